//! Multiplexed connector: unbounded in-flight calls over one connection.
//!
//! Every response frame carries the request id; the host-supplied decoder
//! recovers it and the call is claimed from the sharded [`CallMap`]. A
//! decode failure is terminal for the whole connection (the peer may be
//! lying about framing), so it fails every in-flight call and tears the
//! connection down. Late or unknown ids are discarded quietly.

use crate::error::{Error, Result};
use crate::runtime::reactor::Reactor;
use crate::runtime::timer::TimerQueue;
use crate::tracing_compat::{debug, error};
use crate::transport::call_map::{timeout_error, CallContext, CallMap};
use crate::transport::connection::{CleanupReason, ConnectionHandler, TcpConnection};
use crate::transport::connector::{teardown_error, Connector, ConnectorOptions, Request};
use crate::transport::filter::{FilterChain, RequestInfo};
use crate::transport::protocol::ResponseDecoder;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Response dispatch side; owned by the connection, holds no reference back
/// to it.
struct Dispatch {
    peer: SocketAddr,
    calls: Arc<CallMap>,
    timer: Arc<TimerQueue>,
    decoder: ResponseDecoder,
    filters: FilterChain,
    healthy: Arc<AtomicBool>,
}

impl Dispatch {
    fn fail_all(&self, err: &Error) {
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
        let id = match (self.decoder)(&frame) {
            Ok(id) => id,
            Err(err) => {
                error!(peer = %self.peer, %err, "response decode failed");
                self.healthy.store(false, Ordering::Release);
                self.fail_all(&Error::decode(err.message().to_owned()).with_peer(self.peer));
                return false;
            }
        };
        let Some(ctx) = self.calls.remove(id) else {
            debug!(peer = %self.peer, request_id = id, "unmatched response discarded");
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

/// Multiplexed connector over one TCP connection.
pub struct ComplexConnector {
    peer: SocketAddr,
    conn: Arc<TcpConnection>,
    calls: Arc<CallMap>,
    timer: Arc<TimerQueue>,
    filters: FilterChain,
    default_timeout_ms: u64,
    healthy: Arc<AtomicBool>,
    stopped: AtomicBool,
}

impl ComplexConnector {
    /// Connects to `peer` on `reactor` and starts dispatching.
    ///
    /// # Errors
    ///
    /// Fails when `opts` lacks a response decoder or when the connect cannot
    /// be started.
    pub fn init(
        peer: SocketAddr,
        reactor: Arc<Reactor>,
        opts: ConnectorOptions,
    ) -> Result<Arc<Self>> {
        let decoder = opts
            .response_decoder
            .clone()
            .ok_or_else(|| Error::connect("multiplexed connector requires a response decoder"))?;
        let healthy = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(CallMap::new(opts.call.shard_count));
        let timer = Arc::clone(reactor.timer());

        let dispatch = Arc::new(Dispatch {
            peer,
            calls: Arc::clone(&calls),
            timer: Arc::clone(&timer),
            decoder,
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

impl Connector for ComplexConnector {
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
        if let Err(err) = self.conn.send(req.send_data) {
            // Reclaim synchronously; the caller learns from the return value.
            if self.calls.remove(id).is_some() {
                self.timer.detach(timer_id);
            }
            return Err(err.with_request_id(id));
        }
        self.filters.post_send(&info);
        Ok(())
    }

    fn send_only(&self, data: Bytes) -> Result<()> {
        if !self.is_healthy() {
            return Err(Error::network("connector is not usable").with_peer(self.peer));
        }
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

impl std::fmt::Debug for ComplexConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplexConnector")
            .field("peer", &self.peer)
            .field("pending", &self.calls.len())
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}
