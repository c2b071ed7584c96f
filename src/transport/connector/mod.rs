//! Connector disciplines: how requests map onto one connection.
//!
//! A connector owns exactly one connection plus the bookkeeping that matches
//! responses back to callers. Three disciplines exist:
//!
//! - [`ComplexConnector`]: multiplexed, unbounded in-flight, responses carry
//!   the request id
//! - [`PoolConnector`]: at most one outstanding call, no id matching
//! - [`PipelineConnector`]: back-to-back requests, responses correlated by
//!   FIFO send order
//!
//! All three share the per-request timeout discipline: submission arms a
//! timer on the owning reactor's queue, firing removes the call from the
//! pending table and fails it with a timeout error carrying the request id
//! and peer address, and the connection stays usable afterwards.

mod complex;
mod pipeline;
mod pool;

pub use complex::ComplexConnector;
pub use pipeline::PipelineConnector;
pub use pool::PoolConnector;

use crate::config::{CallConfig, ConnectionConfig};
use crate::error::{Error, Result};
use crate::transport::call_map::CallCompletion;
use crate::transport::connection::CleanupReason;
use crate::transport::filter::FilterChain;
use crate::transport::handshake::Handshaker;
use crate::transport::protocol::{FrameChecker, ResponseDecoder, SocketConfigurer};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

/// Which connector discipline a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Multiplexed: responses carry the request id.
    Multiplexed,
    /// One outstanding call at a time.
    Pooled,
    /// Responses arrive in send order.
    Pipelined,
}

/// One request submitted to a connector.
pub struct Request {
    /// Caller-assigned id, unique among this connector's in-flight calls.
    pub request_id: u64,
    /// Fully encoded request bytes.
    pub send_data: Bytes,
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
    /// Where the outcome goes.
    pub completion: CallCompletion,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("request_id", &self.request_id)
            .field("len", &self.send_data.len())
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

/// Host-supplied pieces a connector needs to drive its connection.
#[derive(Clone)]
pub struct ConnectorOptions {
    /// Connection-level tunables. Overwritten from the transport's config
    /// when the connector is built through the facade.
    pub connection: ConnectionConfig,
    /// Call-tracking tunables. Overwritten from the transport's config when
    /// the connector is built through the facade.
    pub call: CallConfig,
    /// Frame boundary scanner.
    pub frame_checker: FrameChecker,
    /// Request-id extractor; required by the multiplexed discipline only.
    pub response_decoder: Option<ResponseDecoder>,
    /// Optional in-band handshake driver.
    pub handshaker: Option<Arc<dyn Handshaker>>,
    /// Optional pre-connect socket options hook.
    pub socket_configurer: Option<SocketConfigurer>,
    /// Observe-only filter chain.
    pub filters: FilterChain,
}

impl std::fmt::Debug for ConnectorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorOptions")
            .field("connection", &self.connection)
            .field("call", &self.call)
            .field("has_decoder", &self.response_decoder.is_some())
            .finish_non_exhaustive()
    }
}

/// The common connector contract.
pub trait Connector: Send + Sync {
    /// Submits a request expecting a response.
    fn send_req_msg(&self, req: Request) -> Result<()>;
    /// Sends bytes with no response expected and no call tracking.
    fn send_only(&self, data: Bytes) -> Result<()>;
    /// Stops the connector and its connection. Idempotent.
    fn stop(&self);
    /// True while the connection is usable for new calls.
    fn is_healthy(&self) -> bool;
    /// The peer this connector targets.
    fn peer(&self) -> SocketAddr;
}

/// Error used to fail pending calls when their connection goes away.
pub(crate) fn teardown_error(reason: CleanupReason, peer: SocketAddr) -> Error {
    let err = match reason {
        CleanupReason::UserInitiated => Error::network("connection stopped by user"),
        CleanupReason::Error => Error::network("connection failed"),
        CleanupReason::Disconnect => Error::network("peer disconnected"),
        CleanupReason::HandshakeFailed => Error::network("handshake failed"),
    };
    err.with_peer(peer)
}
