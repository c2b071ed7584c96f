//! Wire-level transport: connections, connectors, call tracking, facade.
//!
//! The layering runs bottom-up:
//!
//! - [`protocol`], [`filter`], [`handshake`] — the boundaries a protocol
//!   owner plugs into
//! - [`write_buffer`], [`connection`], [`udp`] — one socket's state machine
//!   on one reactor
//! - [`call_map`], [`backup`] — matching responses (and hedged replicas)
//!   back to callers
//! - [`connector`] — the three correlation disciplines over one connection
//! - [`facade`] — worker pool, connector cache, and the public invoke API

pub mod backup;
pub mod call_map;
pub mod connection;
pub mod connector;
pub mod facade;
pub mod filter;
pub mod handshake;
pub mod protocol;
pub mod udp;
pub mod write_buffer;

pub use backup::BackupRequestRetryInfo;
pub use call_map::{CallCompletion, CallContext, CallMap, CallResult, ReplySlot};
pub use connection::{CleanupReason, ConnState, ConnectionHandler, TcpConnection};
pub use connector::{
    ComplexConnector, ConnectionType, Connector, ConnectorOptions, PipelineConnector,
    PoolConnector, Request,
};
pub use facade::Transport;
pub use filter::{Filter, FilterChain, RequestInfo};
pub use handshake::{HandshakeState, Handshaker, NoHandshake};
pub use protocol::{FrameCheck, FrameChecker, RequestEncoder, ResponseDecoder, SocketConfigurer};
pub use udp::UdpConnection;
pub use write_buffer::{FlushOutcome, WriteBufferList};
