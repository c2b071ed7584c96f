//! Muxrpc: the wire-level transport core of an RPC framework.
//!
//! # Overview
//!
//! Muxrpc multiplexes many concurrent outbound calls over a small, fixed pool
//! of OS worker threads. Each worker drives one [`Reactor`](runtime::reactor::Reactor)
//! (an epoll-style event loop with task and timer queues); cooperative fibers
//! are distributed across workers by one of two interchangeable schedulers;
//! and per-socket connection state machines plus three connector disciplines
//! correlate in-flight requests to responses under timeout, backpressure, and
//! partial-failure conditions.
//!
//! # Core Guarantees
//!
//! - **At-most-once completion**: every pending call is completed by exactly
//!   one of response arrival, timeout firing, or connection teardown
//! - **Ordered flush**: within one connection, writes drain in submission order
//! - **Bounded everything**: task queues, write buffers, and append waits are
//!   capacity- and timeout-bounded; overload is surfaced, never dropped
//! - **Exactly-once teardown**: duplicate failure triggers never double-free
//! - **Protocol-agnostic**: framing and response decoding are host-supplied
//!   callbacks; the core never interprets payload bytes beyond a request id
//!
//! # Module Structure
//!
//! - [`runtime`]: reactor, timer queue, and the two fiber schedulers
//! - [`fiber`]: the cooperative unit of work and its scheduling attributes
//! - [`transport`]: connection state machines, call map, connectors, facade
//! - [`config`]: tuning knobs for every layer
//! - [`error`]: the closed retcode taxonomy
//! - [`util`]: internal utilities (deterministic RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod error;
pub mod fiber;
pub mod runtime;
pub mod tracing_compat;
pub mod transport;
pub mod util;

pub use config::{
    CallConfig, ConfigError, ConnectionConfig, ReactorConfig, SchedulerConfig, TransportConfig,
};
pub use error::{Error, ErrorKind, Result};
pub use fiber::Fiber;
pub use runtime::reactor::{EventHandler, Interest, Reactor, TaskPriority};
pub use runtime::scheduler::{FiberScheduler, NonStealingScheduler, StealingScheduler};
pub use runtime::timer::{TimerId, TimerQueue};
pub use transport::{
    BackupRequestRetryInfo, CallCompletion, CallMap, CallResult, CleanupReason, ComplexConnector,
    ConnectionType, Connector, ConnectorOptions, FilterChain, FrameCheck, FrameChecker,
    PipelineConnector, PoolConnector, ReplySlot, Request, RequestEncoder, ResponseDecoder,
    Transport,
};
