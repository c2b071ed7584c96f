//! TCP connection state machine.
//!
//! A [`TcpConnection`] is a nonblocking socket registered with one reactor,
//! moving through `Unconnected → Connecting → Established → Closing → Closed`.
//! Connect is started with the socket already nonblocking, so it lands in
//! `Connecting` on `EINPROGRESS` and is confirmed by the first writable event
//! (where `SO_ERROR` is consulted). An optional in-band handshake gates
//! application I/O after establishment.
//!
//! Sends are legal in any pre-`Closing` state: bytes buffered while the
//! connection is still establishing are flushed as soon as the handshake
//! completes. Teardown runs exactly once regardless of how many paths race
//! into it (I/O error, peer close, user stop, connect timeout).

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::runtime::reactor::{EventHandler, Interest, Reactor, TaskPriority};
use crate::runtime::timer::TimerId;
use crate::tracing_compat::{debug, trace, warn};
use crate::transport::handshake::{Handshaker, HandshakeState, NoHandshake};
use crate::transport::protocol::{FrameCheck, FrameChecker, SocketConfigurer};
use crate::transport::write_buffer::{FlushOutcome, WriteBufferList};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket created, connect not started.
    Unconnected,
    /// Nonblocking connect in flight; armed for writability.
    Connecting,
    /// Connect confirmed; handshake may still be in progress.
    Established,
    /// Teardown in progress.
    Closing,
    /// Fully torn down.
    Closed,
}

/// Why a connection was torn down, as reported to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// The local user asked for the connection to stop.
    UserInitiated,
    /// An I/O error, corrupt frame, or connect failure.
    Error,
    /// The peer closed the connection.
    Disconnect,
    /// The in-band handshake failed.
    HandshakeFailed,
}

/// Owner-side callbacks of a connection; implemented by each connector.
pub trait ConnectionHandler: Send + Sync {
    /// A complete inbound frame. Return false to declare the connection
    /// unhealthy; the connection tears itself down.
    fn on_frame(&self, frame: Bytes) -> bool;
    /// The connection was torn down. Called exactly once.
    fn on_closed(&self, reason: CleanupReason);
    /// Last-step resource release, after `on_closed`. Called exactly once.
    fn clean_resource(&self);
}

/// A reactor-driven nonblocking TCP connection.
pub struct TcpConnection {
    peer: SocketAddr,
    stream: TcpStream,
    fd: RawFd,
    state: Mutex<ConnState>,
    hs_state: Mutex<HandshakeState>,
    handshaker: Arc<dyn Handshaker>,
    frame_checker: FrameChecker,
    handler: Arc<dyn ConnectionHandler>,
    write_list: WriteBufferList,
    read_buf: Mutex<BytesMut>,
    reactor: Arc<Reactor>,
    cfg: ConnectionConfig,
    connect_timer: Mutex<Option<TimerId>>,
    cleanup_started: AtomicBool,
    /// Back-reference so `handle_event` (which takes `&self`) can clone the
    /// owning `Arc` for teardown and flush paths.
    self_ref: Weak<Self>,
}

impl TcpConnection {
    /// Starts a nonblocking connect to `peer` and registers the connection
    /// with `reactor`.
    ///
    /// `configurer` runs between socket creation and connect, so it can set
    /// options that must precede the handshake. A connect-timeout timer is
    /// armed on the reactor's timer queue.
    pub fn connect(
        peer: SocketAddr,
        reactor: Arc<Reactor>,
        cfg: ConnectionConfig,
        frame_checker: FrameChecker,
        handshaker: Option<Arc<dyn Handshaker>>,
        configurer: Option<SocketConfigurer>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Arc<Self>> {
        let domain = Domain::for_address(peer);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::connect(format!("socket creation failed: {e}")).with_peer(peer))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::connect(format!("set_nonblocking failed: {e}")).with_peer(peer))?;
        if let Some(configure) = &configurer {
            configure(&socket)
                .map_err(|e| Error::connect(format!("socket configurer failed: {e}")).with_peer(peer))?;
        }

        let state = match socket.connect(&peer.into()) {
            // Loopback connects can complete synchronously; the writable
            // event still drives the SO_ERROR check and state transition.
            Ok(()) => ConnState::Connecting,
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                ConnState::Connecting
            }
            Err(e) => {
                return Err(Error::connect(format!("connect failed: {e}")).with_peer(peer));
            }
        };

        let stream: TcpStream = socket.into();
        let fd = stream.as_raw_fd();
        let conn = Arc::new_cyclic(|self_ref| Self {
            peer,
            stream,
            fd,
            state: Mutex::new(state),
            hs_state: Mutex::new(HandshakeState::Pending),
            handshaker: handshaker.unwrap_or_else(|| Arc::new(NoHandshake)),
            frame_checker,
            handler,
            write_list: WriteBufferList::new(cfg.write_buffer_capacity),
            read_buf: Mutex::new(BytesMut::with_capacity(cfg.read_chunk_bytes)),
            reactor,
            connect_timer: Mutex::new(None),
            cfg,
            cleanup_started: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });

        // Arm the timeout before registration: once the fd is registered the
        // reactor thread may confirm the connect (and detach this timer) at
        // any moment.
        let weak: Weak<Self> = Arc::downgrade(&conn);
        let timeout_ms = conn.cfg.connect_timeout_ms;
        let timer_id = conn.reactor.timer().add_after(timeout_ms, move || {
            if let Some(conn) = weak.upgrade() {
                if *conn.state.lock() == ConnState::Connecting {
                    warn!(peer = %conn.peer, timeout_ms, "connect timed out");
                    conn.teardown(CleanupReason::Error);
                }
            }
        });
        *conn.connect_timer.lock() = Some(timer_id);

        let dyn_handler: Arc<dyn EventHandler> = conn.clone();
        if let Err(e) = conn.reactor.update(&dyn_handler) {
            conn.reactor.timer().detach(timer_id);
            return Err(
                Error::connect(format!("reactor registration failed: {e}")).with_peer(peer)
            );
        }

        Ok(conn)
    }

    /// The peer this connection targets.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    /// True while sends are still accepted (buffered if not yet established).
    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(
            self.state(),
            ConnState::Unconnected | ConnState::Connecting | ConnState::Established
        )
    }

    /// Queues `data` for sending, flushing inline on the reactor thread when
    /// the message became the head of an idle write list.
    ///
    /// # Errors
    ///
    /// Fails with `Overload` when the write buffer stays full past the
    /// configured append timeout, and with `Network` once the connection is
    /// closing or closed.
    pub fn send(self: &Arc<Self>, data: Bytes) -> Result<()> {
        if !self.is_usable() {
            return Err(Error::network("connection is closed").with_peer(self.peer));
        }
        let timeout = Duration::from_millis(self.cfg.write_append_timeout_ms);
        let became_head = self
            .write_list
            .append(data, timeout)
            .map_err(|e| e.with_peer(self.peer))?;

        // A non-head message rides the flush already owed to the head.
        if became_head && self.io_ready() {
            let conn = Arc::clone(self);
            let submitted = self
                .reactor
                .submit(move || conn.flush_and_rearm(), TaskPriority::Pinned);
            if !submitted {
                // Task queue full: fall back to arming write interest so the
                // reactor picks the buffered bytes up on readiness.
                self.rearm();
            }
        }
        Ok(())
    }

    /// Tears the connection down on behalf of the local user.
    pub fn stop(&self) {
        if let Some(this) = self.self_ref.upgrade() {
            this.teardown(CleanupReason::UserInitiated);
        }
    }

    fn io_ready(&self) -> bool {
        self.state() == ConnState::Established && self.hs_state.lock().is_done()
    }

    fn rearm(self: &Arc<Self>) {
        let dyn_handler: Arc<dyn EventHandler> = self.clone();
        if let Err(err) = self.reactor.update(&dyn_handler) {
            debug!(peer = %self.peer, %err, "re-arm failed");
            self.teardown(CleanupReason::Error);
        }
    }

    fn flush_and_rearm(self: &Arc<Self>) {
        if !self.io_ready() {
            return;
        }
        self.flush();
        if self.state() == ConnState::Established {
            self.rearm();
        }
    }

    fn flush(self: &Arc<Self>) {
        let mut writer = &self.stream;
        match self
            .write_list
            .flush_into(&mut writer, self.cfg.flush_quota_bytes)
        {
            FlushOutcome::Complete | FlushOutcome::Pending => {}
            FlushOutcome::PeerClosed => {
                debug!(peer = %self.peer, "peer closed during flush");
                self.teardown(CleanupReason::Disconnect);
            }
            FlushOutcome::Failed(err) => {
                warn!(peer = %self.peer, %err, "write failed");
                self.teardown(CleanupReason::Error);
            }
        }
    }

    fn confirm_connect(self: &Arc<Self>) {
        match self.stream.take_error() {
            Ok(None) => {}
            Ok(Some(err)) => {
                warn!(peer = %self.peer, %err, "connect failed");
                self.teardown(CleanupReason::Error);
                return;
            }
            Err(err) => {
                warn!(peer = %self.peer, %err, "SO_ERROR query failed");
                self.teardown(CleanupReason::Error);
                return;
            }
        }
        *self.state.lock() = ConnState::Established;
        if let Some(id) = self.connect_timer.lock().take() {
            self.reactor.timer().detach(id);
        }
        trace!(peer = %self.peer, "connection established");
        self.advance_handshake(false, true);
    }

    fn advance_handshake(self: &Arc<Self>, readable: bool, writable: bool) {
        let next = self.handshaker.advance(&self.stream, readable, writable);
        *self.hs_state.lock() = next;
        match next {
            HandshakeState::Done => {
                // Flush anything buffered while establishing.
                if !self.write_list.is_empty() {
                    self.flush();
                }
            }
            HandshakeState::Failed => {
                warn!(peer = %self.peer, "handshake failed");
                self.teardown(CleanupReason::HandshakeFailed);
            }
            HandshakeState::Pending | HandshakeState::NeedRead | HandshakeState::NeedWrite => {}
        }
    }

    fn read_ready(self: &Arc<Self>) {
        let mut scratch = vec![0u8; self.cfg.read_chunk_bytes];
        let mut consumed = 0usize;
        let mut frames = Vec::new();
        loop {
            if consumed >= self.cfg.max_read_per_event {
                // Per-event cap; the oneshot re-arm delivers the rest.
                break;
            }
            let mut reader = &self.stream;
            match reader.read(&mut scratch) {
                Ok(0) => {
                    debug!(peer = %self.peer, "peer closed");
                    self.teardown(CleanupReason::Disconnect);
                    return;
                }
                Ok(n) => {
                    consumed += n;
                    let verdict = {
                        let mut buf = self.read_buf.lock();
                        buf.extend_from_slice(&scratch[..n]);
                        (self.frame_checker)(&mut buf, &mut frames)
                    };
                    if verdict == FrameCheck::Error {
                        warn!(peer = %self.peer, "corrupt inbound frame");
                        self.teardown(CleanupReason::Error);
                        return;
                    }
                    for frame in frames.drain(..) {
                        if !self.handler.on_frame(frame) {
                            self.teardown(CleanupReason::Error);
                            return;
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(peer = %self.peer, %err, "read failed");
                    self.teardown(CleanupReason::Error);
                    return;
                }
            }
        }
    }

    /// Runs the teardown sequence exactly once.
    fn teardown(self: &Arc<Self>, reason: CleanupReason) {
        if self.cleanup_started.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %self.peer, ?reason, "tearing connection down");
        *self.state.lock() = ConnState::Closing;
        if let Some(id) = self.connect_timer.lock().take() {
            self.reactor.timer().detach(id);
        }
        self.write_list.close();
        self.reactor.remove(self.fd);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        *self.state.lock() = ConnState::Closed;
        self.handler.on_closed(reason);
        self.handler.clean_resource();
    }
}

impl EventHandler for TcpConnection {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn interest(&self) -> Interest {
        match self.state() {
            ConnState::Unconnected | ConnState::Connecting => Interest::WRITABLE,
            ConnState::Established => match *self.hs_state.lock() {
                HandshakeState::NeedRead => Interest::READABLE,
                HandshakeState::NeedWrite => Interest::WRITABLE,
                HandshakeState::Pending | HandshakeState::Failed => Interest::BOTH,
                HandshakeState::Done => {
                    if self.write_list.is_empty() {
                        Interest::READABLE
                    } else {
                        Interest::BOTH
                    }
                }
            },
            ConnState::Closing | ConnState::Closed => Interest::NONE,
        }
    }

    fn handle_event(&self, readable: bool, writable: bool) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };

        match this.state() {
            ConnState::Connecting => {
                if writable || readable {
                    this.confirm_connect();
                }
                return;
            }
            ConnState::Established => {}
            ConnState::Unconnected | ConnState::Closing | ConnState::Closed => return,
        }

        if !this.hs_state.lock().is_done() {
            this.advance_handshake(readable, writable);
            if !this.io_ready() {
                return;
            }
        }
        if readable {
            this.read_ready();
        }
        if writable && this.state() == ConnState::Established {
            this.flush();
        }
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("buffered", &self.write_list.len_bytes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReactorConfig;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    /// u32 big-endian length prefix framing, used by all connection tests.
    fn length_prefix_checker() -> FrameChecker {
        Arc::new(|buf: &mut BytesMut, frames: &mut Vec<Bytes>| {
            let mut extracted = false;
            loop {
                if buf.len() < 4 {
                    return if extracted { FrameCheck::Full } else { FrameCheck::Less };
                }
                let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                if len > 1 << 20 {
                    return FrameCheck::Error;
                }
                if buf.len() < 4 + len {
                    return if extracted { FrameCheck::Full } else { FrameCheck::Less };
                }
                let mut whole = buf.split_to(4 + len);
                frames.push(whole.split_off(4).freeze());
                extracted = true;
            }
        })
    }

    fn encode(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + payload.len());
        out.extend_from_slice(&u32::try_from(payload.len()).expect("len").to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[derive(Default)]
    struct Recording {
        frames: Mutex<Vec<Bytes>>,
        closed: Mutex<Option<CleanupReason>>,
        cleaned: AtomicUsize,
    }

    impl ConnectionHandler for Recording {
        fn on_frame(&self, frame: Bytes) -> bool {
            self.frames.lock().push(frame);
            true
        }
        fn on_closed(&self, reason: CleanupReason) {
            *self.closed.lock() = Some(reason);
        }
        fn clean_resource(&self) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Loop {
        reactor: Arc<Reactor>,
        stop: Arc<AtomicBool>,
        thread: Option<thread::JoinHandle<()>>,
    }

    impl Loop {
        fn start() -> Self {
            let reactor =
                Arc::new(Reactor::new(ReactorConfig::default()).expect("create reactor"));
            let stop = Arc::new(AtomicBool::new(false));
            let r = Arc::clone(&reactor);
            let s = Arc::clone(&stop);
            let thread = thread::spawn(move || r.run(&s));
            Self {
                reactor,
                stop,
                thread: Some(thread),
            }
        }
    }

    impl Drop for Loop {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Release);
            let _ = self.reactor.wake();
            if let Some(t) = self.thread.take() {
                let _ = t.join();
            }
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn connect_pair(
        event_loop: &Loop,
        handler: Arc<Recording>,
    ) -> (Arc<TcpConnection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let peer = listener.local_addr().expect("addr");
        let conn = TcpConnection::connect(
            peer,
            Arc::clone(&event_loop.reactor),
            ConnectionConfig::default(),
            length_prefix_checker(),
            None,
            None,
            handler,
        )
        .expect("connect");
        let (server, _) = listener.accept().expect("accept");
        assert!(wait_for(|| conn.state() == ConnState::Established));
        (conn, server)
    }

    #[test]
    fn connect_establishes_and_delivers_frames() {
        let event_loop = Loop::start();
        let handler = Arc::new(Recording::default());
        let (conn, mut server) = connect_pair(&event_loop, Arc::clone(&handler));

        server.write_all(&encode(b"hello")).expect("server write");
        // Second frame split across writes exercises partial-frame buffering.
        let wire = encode(b"world");
        server.write_all(&wire[..3]).expect("server write");
        server.flush().expect("flush");
        thread::sleep(Duration::from_millis(10));
        server.write_all(&wire[3..]).expect("server write");

        assert!(wait_for(|| handler.frames.lock().len() == 2));
        let frames = handler.frames.lock();
        assert_eq!(frames[0].as_ref(), b"hello");
        assert_eq!(frames[1].as_ref(), b"world");
        drop(frames);
        conn.stop();
    }

    #[test]
    fn send_reaches_peer() {
        let event_loop = Loop::start();
        let handler = Arc::new(Recording::default());
        let (conn, mut server) = connect_pair(&event_loop, Arc::clone(&handler));

        conn.send(Bytes::from(encode(b"ping"))).expect("send");
        conn.send(Bytes::from(encode(b"pong"))).expect("send");

        let mut got = Vec::new();
        let expected = [encode(b"ping"), encode(b"pong")].concat();
        server
            .set_read_timeout(Some(Duration::from_secs(3)))
            .expect("timeout");
        while got.len() < expected.len() {
            let mut chunk = [0u8; 64];
            let n = server.read(&mut chunk).expect("server read");
            assert!(n > 0, "server saw EOF early");
            got.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(got, expected);
        conn.stop();
    }

    #[test]
    fn peer_close_tears_down_as_disconnect() {
        let event_loop = Loop::start();
        let handler = Arc::new(Recording::default());
        let (conn, server) = connect_pair(&event_loop, Arc::clone(&handler));

        drop(server);
        assert!(wait_for(|| conn.state() == ConnState::Closed));
        assert_eq!(*handler.closed.lock(), Some(CleanupReason::Disconnect));
        assert_eq!(handler.cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn corrupt_frame_tears_down_as_error() {
        let event_loop = Loop::start();
        let handler = Arc::new(Recording::default());
        let (conn, mut server) = connect_pair(&event_loop, Arc::clone(&handler));

        // Length beyond the checker's sanity bound.
        server.write_all(&u32::MAX.to_be_bytes()).expect("write");

        assert!(wait_for(|| conn.state() == ConnState::Closed));
        assert_eq!(*handler.closed.lock(), Some(CleanupReason::Error));
    }

    #[test]
    fn refused_connect_reports_error_once() {
        let event_loop = Loop::start();
        let handler = Arc::new(Recording::default());
        // Grab a port that nothing listens on.
        let peer = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr")
        };

        let conn = TcpConnection::connect(
            peer,
            Arc::clone(&event_loop.reactor),
            ConnectionConfig::default(),
            length_prefix_checker(),
            None,
            None,
            Arc::clone(&handler) as Arc<dyn ConnectionHandler>,
        )
        .expect("connect starts");

        assert!(wait_for(|| conn.state() == ConnState::Closed));
        assert_eq!(*handler.closed.lock(), Some(CleanupReason::Error));
        assert_eq!(handler.cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let event_loop = Loop::start();
        let handler = Arc::new(Recording::default());
        let (conn, _server) = connect_pair(&event_loop, Arc::clone(&handler));

        conn.stop();
        conn.stop();
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(*handler.closed.lock(), Some(CleanupReason::UserInitiated));
        assert_eq!(handler.cleaned.load(Ordering::SeqCst), 1);
        assert!(conn.send(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn configurer_runs_before_connect() {
        let event_loop = Loop::start();
        let handler = Arc::new(Recording::default());
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let peer = listener.local_addr().expect("addr");

        let configured = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&configured);
        let configurer: SocketConfigurer = Arc::new(move |socket| {
            socket.set_nodelay(true)?;
            flag.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let conn = TcpConnection::connect(
            peer,
            Arc::clone(&event_loop.reactor),
            ConnectionConfig::default(),
            length_prefix_checker(),
            None,
            Some(configurer),
            handler,
        )
        .expect("connect");
        assert_eq!(configured.load(Ordering::SeqCst), 1);
        let _accepted = listener.accept().expect("accept");
        assert!(wait_for(|| conn.state() == ConnState::Established));
        conn.stop();
    }
}
