//! Pluggable post-connect handshake.
//!
//! A connection's I/O callbacks check handshake completion first and re-arm
//! whichever readiness direction the handshake driver asks for. The plain
//! case is [`NoHandshake`], which completes immediately; a TLS layer plugs
//! in by implementing [`Handshaker`] over the raw stream.

use std::net::TcpStream;

/// State of the in-band handshake, orthogonal to the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Not started.
    Pending,
    /// The driver needs the socket to become readable.
    NeedRead,
    /// The driver needs the socket to become writable.
    NeedWrite,
    /// Completed; application I/O may proceed.
    Done,
    /// Failed; the connection must be torn down.
    Failed,
}

impl HandshakeState {
    /// True once application I/O is allowed.
    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Drives an in-band handshake over an established stream.
pub trait Handshaker: Send + Sync {
    /// Advances the handshake as far as the socket allows; called whenever
    /// the connection's fd is ready and the handshake is not done.
    fn advance(&self, stream: &TcpStream, readable: bool, writable: bool) -> HandshakeState;
}

/// The trivial handshake: completes as soon as the connection is established.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHandshake;

impl Handshaker for NoHandshake {
    fn advance(&self, _stream: &TcpStream, _readable: bool, _writable: bool) -> HandshakeState {
        HandshakeState::Done
    }
}
