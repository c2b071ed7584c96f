//! Error types and error handling strategy for muxrpc.
//!
//! I/O-layer failures are translated at the connector boundary into a small
//! closed set of retcodes, each attached to a textual message that carries
//! the peer address and request id when they are known. Nothing is thrown
//! across the reactor/fiber boundary: completion is always delivered via an
//! explicit callback, even on failure.
//!
//! # Error Categories
//!
//! - **Network**: remote disconnect or socket error; terminal for the
//!   affected connection, reported to every pending call on it
//! - **Connect**: the dial itself failed; terminal for the connection
//! - **Timeout**: per-request; terminal only for that call, the connection
//!   remains usable
//! - **Decode**: framing or payload decode failure; terminal for the
//!   connection, since it may be lying about message boundaries
//! - **Overload**: a bounded queue or buffer was full; surfaced synchronously
//!   to the caller, never retried internally
//!
//! Programming invariants (e.g. double-reclaim of a pending call) are not
//! represented here: the single-reclaim guarantee is enforced by move-only
//! types, and remaining invariant checks are debug assertions.

use core::fmt;
use std::net::SocketAddr;

/// The kind of error, forming the closed retcode set of the transport core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Remote disconnect or socket-level failure on an established connection.
    Network,
    /// Connection establishment failed.
    Connect,
    /// A per-request timeout fired before the response arrived.
    Timeout,
    /// The peer's bytes could not be framed or decoded.
    Decode,
    /// A bounded queue or write buffer refused the submission.
    Overload,
}

impl ErrorKind {
    /// Short lowercase name used in rendered messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network error",
            Self::Connect => "connect error",
            Self::Timeout => "invoke timeout",
            Self::Decode => "decode error",
            Self::Overload => "overload",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transport-core error: a retcode plus human-readable context.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    peer: Option<SocketAddr>,
    request_id: Option<u64>,
}

impl Error {
    /// Creates an error of the given kind with a message.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            peer: None,
            request_id: None,
        }
    }

    /// Shorthand for a [`ErrorKind::Network`] error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    /// Shorthand for a [`ErrorKind::Connect`] error.
    #[must_use]
    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connect, message)
    }

    /// Shorthand for a [`ErrorKind::Timeout`] error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Shorthand for a [`ErrorKind::Decode`] error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Decode, message)
    }

    /// Shorthand for a [`ErrorKind::Overload`] error.
    #[must_use]
    pub fn overload(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Overload, message)
    }

    /// Attaches the peer address to the error context.
    #[must_use]
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Attaches the request id to the error context.
    #[must_use]
    pub const fn with_request_id(mut self, id: u64) -> Self {
        self.request_id = Some(id);
        self
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the bare message, without the rendered context.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the peer address, if recorded.
    #[must_use]
    pub const fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Returns the request id, if recorded.
    #[must_use]
    pub const fn request_id(&self) -> Option<u64> {
        self.request_id
    }

    /// True when retrying the same call on the same connection could help.
    ///
    /// Timeouts leave the connection usable; everything else is terminal for
    /// the connection or a synchronous capacity rejection.
    #[must_use]
    pub const fn connection_usable(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout | ErrorKind::Overload)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(id) = self.request_id {
            write!(f, ", request_id={id}")?;
        }
        if let Some(peer) = self.peer {
            write!(f, ", peer={peer}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::network(err.to_string())
    }
}

/// Result alias for transport-core operations.
pub type Result<T> = std::result::Result<T, Error>;
