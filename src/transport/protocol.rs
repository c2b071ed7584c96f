//! Boundaries with the protocol owner.
//!
//! The core is protocol-agnostic: it never interprets payload bytes beyond
//! extracting a request id when the connector discipline requires one. The
//! protocol owner plugs in through three callbacks:
//!
//! - a [`FrameChecker`] that scans the inbound buffer and extracts zero or
//!   more complete frames, reporting "enough bytes" / "not enough" /
//!   "corrupt" and nothing more
//! - a [`ResponseDecoder`] that recovers the request id from a complete
//!   response frame (multiplexed connector only)
//! - a [`SocketConfigurer`] that may set arbitrary socket options right
//!   after socket creation, before connect (keep-alive, TLS prerequisites,
//!   buffer sizes)

use crate::error::Result;
use bytes::{Bytes, BytesMut};
use socket2::Socket;
use std::io;
use std::sync::Arc;

/// Verdict of one frame-checker pass over the inbound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCheck {
    /// At least one complete frame was extracted into the output vector.
    Full,
    /// More bytes are needed; nothing was extracted.
    Less,
    /// The buffer is corrupt; the connection must be torn down.
    Error,
}

/// Scans `buffer`, moves complete frames into `frames`, and reports whether
/// more input is needed. Called after every read chunk.
pub type FrameChecker = Arc<dyn Fn(&mut BytesMut, &mut Vec<Bytes>) -> FrameCheck + Send + Sync>;

/// Extracts the request id carried by a response frame.
pub type ResponseDecoder = Arc<dyn Fn(&Bytes) -> Result<u64> + Send + Sync>;

/// Applies host socket options between socket creation and connect.
pub type SocketConfigurer = Arc<dyn Fn(&Socket) -> io::Result<()> + Send + Sync>;

/// Encodes one request given its allocated id. The facade assigns request
/// ids and calls this once per wire send, so a hedged call's duplicate
/// carries its own id.
pub type RequestEncoder = Arc<dyn Fn(u64) -> Bytes + Send + Sync>;
