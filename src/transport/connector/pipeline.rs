//! Pipelined connector: responses correlated by send order.
//!
//! Requests are flushed back-to-back without waiting; a FIFO of sent
//! request ids decides which pending call each response belongs to. The id
//! is pushed under the send-order lock (the same lock that serializes the
//! buffer appends) so the FIFO order always equals the wire order, and
//! popped lock-free on the reactor thread.
//!
//! Precondition: the wire protocol must guarantee strictly ordered
//! responses. A response arriving with an empty FIFO violates it; the
//! connector logs at error level, marks itself unhealthy, and tears the
//! connection down. A response whose FIFO id has already timed out consumes
//! its slot and is dropped, keeping later correlations aligned.

use crate::error::{Error, Result};
use crate::runtime::reactor::Reactor;
use crate::runtime::timer::TimerQueue;
use crate::tracing_compat::{debug, error};
use crate::transport::call_map::{timeout_error, CallContext, CallMap};
use crate::transport::connection::{CleanupReason, ConnectionHandler, TcpConnection};
use crate::transport::connector::{teardown_error, Connector, ConnectorOptions, Request};
use crate::transport::filter::{FilterChain, RequestInfo};
use bytes::Bytes;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Dispatch {
    peer: SocketAddr,
    calls: Arc<CallMap>,
    fifo: Arc<SegQueue<u64>>,
    timer: Arc<TimerQueue>,
    filters: FilterChain,
    healthy: Arc<AtomicBool>,
}

impl Dispatch {
    fn fail_all(&self, err: &Error) {
        while self.fifo.pop().is_some() {}
        for ctx in self.calls.drain() {
            if let Some(tid) = ctx.timeout_timer() {
                self.timer.detach(tid);
            }
            let id = ctx.request_id();
            ctx.complete(Err(err.clone().with_request_id(id)));
        }
    }
}

impl ConnectionHandler for Dispatch {
    fn on_frame(&self, frame: Bytes) -> bool {
        let Some(id) = self.fifo.pop() else {
            error!(
                peer = %self.peer,
                "response with empty send FIFO: peer violated response ordering"
            );
            self.healthy.store(false, Ordering::Release);
            self.fail_all(
                &Error::decode("peer violated pipelined response ordering").with_peer(self.peer),
            );
            return false;
        };
        let Some(ctx) = self.calls.remove(id) else {
            // Timed out before the reply landed; the slot is consumed so the
            // next response still lines up.
            debug!(peer = %self.peer, request_id = id, "reply for timed-out call dropped");
            return true;
        };
        if let Some(tid) = ctx.timeout_timer() {
            self.timer.detach(tid);
        }
        let info = RequestInfo {
            request_id: id,
            peer: self.peer,
            payload_len: frame.len(),
        };
        self.filters.pre_recv(&info);
        ctx.complete(Ok(frame));
        self.filters.post_recv(&info);
        true
    }

    fn on_closed(&self, reason: CleanupReason) {
        self.healthy.store(false, Ordering::Release);
        self.fail_all(&teardown_error(reason, self.peer));
    }

    fn clean_resource(&self) {}
}

/// FIFO-correlated connector over one TCP connection.
pub struct PipelineConnector {
    peer: SocketAddr,
    conn: Arc<TcpConnection>,
    calls: Arc<CallMap>,
    fifo: Arc<SegQueue<u64>>,
    /// Serializes append-to-buffer with FIFO push so both see the same order.
    send_order: Mutex<()>,
    timer: Arc<TimerQueue>,
    filters: FilterChain,
    default_timeout_ms: u64,
    healthy: Arc<AtomicBool>,
    stopped: AtomicBool,
}

impl PipelineConnector {
    /// Connects to `peer` on `reactor`.
    pub fn init(
        peer: SocketAddr,
        reactor: Arc<Reactor>,
        opts: ConnectorOptions,
    ) -> Result<Arc<Self>> {
        let healthy = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(CallMap::new(opts.call.shard_count));
        let fifo = Arc::new(SegQueue::new());
        let timer = Arc::clone(reactor.timer());

        let dispatch = Arc::new(Dispatch {
            peer,
            calls: Arc::clone(&calls),
            fifo: Arc::clone(&fifo),
            timer: Arc::clone(&timer),
            filters: opts.filters.clone(),
            healthy: Arc::clone(&healthy),
        });
        let conn = TcpConnection::connect(
            peer,
            reactor,
            opts.connection,
            opts.frame_checker,
            opts.handshaker,
            opts.socket_configurer,
            dispatch,
        )?;

        Ok(Arc::new(Self {
            peer,
            conn,
            calls,
            fifo,
            send_order: Mutex::new(()),
            timer,
            filters: opts.filters,
            default_timeout_ms: opts.call.default_timeout_ms,
            healthy,
            stopped: AtomicBool::new(false),
        }))
    }

    /// Number of in-flight calls.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.calls.len()
    }
}

impl Connector for PipelineConnector {
    fn send_req_msg(&self, req: Request) -> Result<()> {
        if !self.is_healthy() {
            return Err(Error::network("connector is not usable").with_peer(self.peer));
        }
        let id = req.request_id;
        let timeout_ms = if req.timeout_ms == 0 {
            self.default_timeout_ms
        } else {
            req.timeout_ms
        };

        let ctx = CallContext::new(id, self.peer, req.completion);
        if self.calls.insert(ctx).is_err() {
            return Err(Error::network("request id already in flight")
                .with_peer(self.peer)
                .with_request_id(id));
        }
        // Register before arming: a timer that fires against an absent id
        // would leave the inserted call with no timeout path.
        let calls = Arc::clone(&self.calls);
        let peer = self.peer;
        let timer_id = self.timer.add_after(timeout_ms, move || {
            // The FIFO slot stays; the late reply consumes and drops it.
            if let Some(ctx) = calls.remove(id) {
                ctx.complete(Err(timeout_error(id, peer, timeout_ms)));
            }
        });
        if !self.calls.set_timeout_timer(id, timer_id) {
            // Already claimed (fired or torn down); nothing left for the
            // timer to do.
            self.timer.detach(timer_id);
        }

        let info = RequestInfo {
            request_id: id,
            peer: self.peer,
            payload_len: req.send_data.len(),
        };
        self.filters.pre_send(&info);
        {
            let _order = self.send_order.lock();
            if let Err(err) = self.conn.send(req.send_data) {
                if self.calls.remove(id).is_some() {
                    self.timer.detach(timer_id);
                }
                return Err(err.with_request_id(id));
            }
            self.fifo.push(id);
        }
        self.filters.post_send(&info);
        Ok(())
    }

    fn send_only(&self, data: Bytes) -> Result<()> {
        if !self.is_healthy() {
            return Err(Error::network("connector is not usable").with_peer(self.peer));
        }
        // Serialized with tracked sends, but no FIFO slot: no reply expected.
        let _order = self.send_order.lock();
        self.conn.send(data)
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.conn.stop();
    }

    fn is_healthy(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
            && self.healthy.load(Ordering::Acquire)
            && self.conn.is_usable()
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl std::fmt::Debug for PipelineConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineConnector")
            .field("peer", &self.peer)
            .field("pending", &self.calls.len())
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CallConfig, ConnectionConfig, ReactorConfig};
    use crate::error::ErrorKind;
    use crate::transport::call_map::{CallCompletion, ReplySlot};
    use crate::transport::connection::ConnState;
    use crate::transport::protocol::{FrameCheck, FrameChecker};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    fn line_checker() -> FrameChecker {
        // Newline-delimited frames, the classic pipelined-protocol shape.
        Arc::new(|buf: &mut bytes::BytesMut, frames: &mut Vec<Bytes>| {
            let mut extracted = false;
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let mut line = buf.split_to(pos + 1);
                line.truncate(pos);
                frames.push(line.freeze());
                extracted = true;
            }
            if extracted {
                FrameCheck::Full
            } else {
                FrameCheck::Less
            }
        })
    }

    fn options() -> ConnectorOptions {
        ConnectorOptions {
            connection: ConnectionConfig::default(),
            call: CallConfig::default(),
            frame_checker: line_checker(),
            response_decoder: None,
            handshaker: None,
            socket_configurer: None,
            filters: FilterChain::new(),
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

    #[test]
    fn responses_match_send_order() {
        let reactor = Arc::new(Reactor::new(ReactorConfig::default()).expect("reactor"));
        let stop = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&reactor);
        let s = Arc::clone(&stop);
        let loop_thread = thread::spawn(move || r.run(&s));

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let peer = listener.local_addr().expect("addr");
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().expect("accept");
            let mut seen = Vec::new();
            let mut buf = [0u8; 64];
            while seen.iter().filter(|&&b| b == b'\n').count() < 2 {
                let n = sock.read(&mut buf).expect("read");
                assert!(n > 0);
                seen.extend_from_slice(&buf[..n]);
            }
            sock.write_all(b"first\nsecond\n").expect("write");
            sock
        });

        let connector =
            PipelineConnector::init(peer, Arc::clone(&reactor), options()).expect("init");
        let slot_a = ReplySlot::new();
        let slot_b = ReplySlot::new();
        for (id, slot) in [(10u64, &slot_a), (11, &slot_b)] {
            connector
                .send_req_msg(Request {
                    request_id: id,
                    send_data: Bytes::from(format!("req-{id}\n")),
                    timeout_ms: 2000,
                    completion: CallCompletion::Direct(slot.completion()),
                })
                .expect("send");
        }

        let a = slot_a.wait(Duration::from_secs(3)).expect("first reply");
        let b = slot_b.wait(Duration::from_secs(3)).expect("second reply");
        assert_eq!(a.payload.expect("ok").as_ref(), b"first");
        assert_eq!(b.payload.expect("ok").as_ref(), b"second");
        assert_eq!(connector.pending(), 0);

        connector.stop();
        drop(server.join().expect("server"));
        stop.store(true, Ordering::Release);
        reactor.wake().expect("wake");
        loop_thread.join().expect("join");
    }

    #[test]
    fn unsolicited_response_marks_unhealthy_and_tears_down() {
        let reactor = Arc::new(Reactor::new(ReactorConfig::default()).expect("reactor"));
        let stop = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&reactor);
        let s = Arc::clone(&stop);
        let loop_thread = thread::spawn(move || r.run(&s));

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let peer = listener.local_addr().expect("addr");
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().expect("accept");
            // Nothing was requested; this violates the ordering precondition.
            sock.write_all(b"surprise\n").expect("write");
            sock
        });

        let connector =
            PipelineConnector::init(peer, Arc::clone(&reactor), options()).expect("init");

        assert!(wait_for(|| !connector.is_healthy()));
        assert!(wait_for(|| connector.conn.state() == ConnState::Closed));
        let err = connector
            .send_req_msg(Request {
                request_id: 1,
                send_data: Bytes::from_static(b"late\n"),
                timeout_ms: 100,
                completion: CallCompletion::Direct(Box::new(|_| {})),
            })
            .expect_err("connector is down");
        assert_eq!(err.kind(), ErrorKind::Network);

        connector.stop();
        drop(server.join().expect("server"));
        stop.store(true, Ordering::Release);
        reactor.wake().expect("wake");
        loop_thread.join().expect("join");
    }
}
