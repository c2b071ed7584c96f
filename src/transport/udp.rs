//! UDP datagram transceiver.
//!
//! A [`UdpConnection`] is a connected nonblocking `UdpSocket` registered
//! with one reactor. Datagram boundaries are the frame boundaries: every
//! received datagram is handed to the handler as one frame, with no frame
//! checker involved, and every queued send goes out as one datagram.
//! Outbound datagrams wait in a byte-bounded queue; a full queue rejects the
//! send with `Overload` immediately (there is no partial-write state to
//! protect, so no blocking append). Teardown follows the same exactly-once
//! discipline as the TCP connection.
//!
//! Inbound datagrams larger than `read_chunk_bytes` are truncated by the
//! kernel to the receive buffer; size the chunk to the protocol's maximum
//! datagram. A receive that fills the whole chunk is logged at debug level
//! as possibly truncated.

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::runtime::reactor::{EventHandler, Interest, Reactor, TaskPriority};
use crate::tracing_compat::{debug, warn};
use crate::transport::connection::{CleanupReason, ConnState, ConnectionHandler};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

struct Outbound {
    queue: VecDeque<Bytes>,
    bytes: usize,
    closed: bool,
}

/// A reactor-driven connected UDP socket.
pub struct UdpConnection {
    peer: SocketAddr,
    socket: UdpSocket,
    fd: RawFd,
    state: Mutex<ConnState>,
    handler: Arc<dyn ConnectionHandler>,
    outbound: Mutex<Outbound>,
    reactor: Arc<Reactor>,
    cfg: ConnectionConfig,
    cleanup_started: AtomicBool,
    self_ref: Weak<Self>,
}

impl UdpConnection {
    /// Binds an ephemeral local socket, connects it to `peer`, and registers
    /// with `reactor`. UDP connect is local bookkeeping, so the connection
    /// is `Established` on return.
    pub fn connect(
        peer: SocketAddr,
        reactor: Arc<Reactor>,
        cfg: ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Arc<Self>> {
        let bind_addr: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().map_err(|_| Error::connect("bad bind addr"))?
        } else {
            "[::]:0".parse().map_err(|_| Error::connect("bad bind addr"))?
        };
        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| Error::connect(format!("udp bind failed: {e}")).with_peer(peer))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::connect(format!("set_nonblocking failed: {e}")).with_peer(peer))?;
        socket
            .connect(peer)
            .map_err(|e| Error::connect(format!("udp connect failed: {e}")).with_peer(peer))?;

        let fd = socket.as_raw_fd();
        let conn = Arc::new_cyclic(|self_ref| Self {
            peer,
            socket,
            fd,
            state: Mutex::new(ConnState::Established),
            handler,
            outbound: Mutex::new(Outbound {
                queue: VecDeque::new(),
                bytes: 0,
                closed: false,
            }),
            reactor,
            cfg,
            cleanup_started: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });

        let dyn_handler: Arc<dyn EventHandler> = conn.clone();
        conn.reactor
            .update(&dyn_handler)
            .map_err(|e| Error::connect(format!("reactor registration failed: {e}")).with_peer(peer))?;
        Ok(conn)
    }

    /// The peer this socket is connected to.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current lifecycle state (`Established` or `Closed`).
    #[must_use]
    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    /// Queues one datagram.
    ///
    /// # Errors
    ///
    /// Fails with `Overload` when the outbound queue is at byte capacity and
    /// with `Network` once the connection is closed.
    pub fn send(self: &Arc<Self>, datagram: Bytes) -> Result<()> {
        let was_empty = {
            let mut outbound = self.outbound.lock();
            if outbound.closed {
                return Err(Error::network("connection is closed").with_peer(self.peer));
            }
            if outbound.bytes + datagram.len() > self.cfg.write_buffer_capacity
                && !outbound.queue.is_empty()
            {
                return Err(Error::overload(format!(
                    "udp outbound queue full ({} bytes)",
                    outbound.bytes
                ))
                .with_peer(self.peer));
            }
            let was_empty = outbound.queue.is_empty();
            outbound.bytes += datagram.len();
            outbound.queue.push_back(datagram);
            was_empty
        };

        if was_empty {
            let conn = Arc::clone(self);
            let submitted = self
                .reactor
                .submit(move || conn.drain_and_rearm(), TaskPriority::Pinned);
            if !submitted {
                self.rearm();
            }
        }
        Ok(())
    }

    /// Tears the socket down on behalf of the local user.
    pub fn stop(&self) {
        if let Some(this) = self.self_ref.upgrade() {
            this.teardown(CleanupReason::UserInitiated);
        }
    }

    fn rearm(self: &Arc<Self>) {
        let dyn_handler: Arc<dyn EventHandler> = self.clone();
        if let Err(err) = self.reactor.update(&dyn_handler) {
            debug!(peer = %self.peer, %err, "re-arm failed");
            self.teardown(CleanupReason::Error);
        }
    }

    fn drain_and_rearm(self: &Arc<Self>) {
        if self.state() != ConnState::Established {
            return;
        }
        self.drain();
        if self.state() == ConnState::Established {
            self.rearm();
        }
    }

    fn drain(self: &Arc<Self>) {
        loop {
            let Some(datagram) = self.outbound.lock().queue.front().cloned() else {
                return;
            };
            match self.socket.send(&datagram) {
                Ok(_) => {
                    let mut outbound = self.outbound.lock();
                    outbound.bytes -= datagram.len();
                    outbound.queue.pop_front();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(peer = %self.peer, %err, "udp send failed");
                    self.teardown(CleanupReason::Error);
                    return;
                }
            }
        }
    }

    fn read_ready(self: &Arc<Self>) {
        let mut scratch = vec![0u8; self.cfg.read_chunk_bytes];
        let mut consumed = 0usize;
        loop {
            if consumed >= self.cfg.max_read_per_event {
                break;
            }
            match self.socket.recv(&mut scratch) {
                // An empty datagram is a valid (empty) frame, not EOF.
                Ok(n) => {
                    if n == scratch.len() {
                        debug!(
                            peer = %self.peer,
                            len = n,
                            "datagram filled the read chunk; tail may be truncated"
                        );
                    }
                    consumed += n.max(1);
                    let frame = Bytes::copy_from_slice(&scratch[..n]);
                    if !self.handler.on_frame(frame) {
                        self.teardown(CleanupReason::Error);
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    // ICMP unreachable surfaces here on a connected socket.
                    warn!(peer = %self.peer, %err, "udp recv failed");
                    self.teardown(CleanupReason::Error);
                    return;
                }
            }
        }
    }

    fn teardown(self: &Arc<Self>, reason: CleanupReason) {
        if self.cleanup_started.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %self.peer, ?reason, "tearing udp connection down");
        *self.state.lock() = ConnState::Closing;
        self.outbound.lock().closed = true;
        self.reactor.remove(self.fd);
        *self.state.lock() = ConnState::Closed;
        self.handler.on_closed(reason);
        self.handler.clean_resource();
    }
}

impl EventHandler for UdpConnection {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn interest(&self) -> Interest {
        match self.state() {
            ConnState::Established => {
                if self.outbound.lock().queue.is_empty() {
                    Interest::READABLE
                } else {
                    Interest::BOTH
                }
            }
            _ => Interest::NONE,
        }
    }

    fn handle_event(&self, readable: bool, writable: bool) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        if this.state() != ConnState::Established {
            return;
        }
        if readable {
            this.read_ready();
        }
        if writable && this.state() == ConnState::Established {
            this.drain();
        }
    }
}

impl std::fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpConnection")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("queued_bytes", &self.outbound.lock().bytes)
            .finish_non_exhaustive()
    }
}
