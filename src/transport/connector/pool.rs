//! Pooled connector: at most one outstanding call per connection.
//!
//! With a single pending slot there is nothing to hash: the context is
//! swapped in and out under a plain mutex, and any response frame belongs to
//! the one pending call (a frame with no pending call is a late reply to a
//! timed-out request and is dropped). A second concurrent send is refused
//! with `Overload` rather than queued.

use crate::error::{Error, Result};
use crate::runtime::reactor::Reactor;
use crate::runtime::timer::TimerQueue;
use crate::tracing_compat::debug;
use crate::transport::call_map::{timeout_error, CallContext};
use crate::transport::connection::{CleanupReason, ConnectionHandler, TcpConnection};
use crate::transport::connector::{teardown_error, Connector, ConnectorOptions, Request};
use crate::transport::filter::{FilterChain, RequestInfo};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type PendingSlot = Arc<Mutex<Option<CallContext>>>;

struct Dispatch {
    peer: SocketAddr,
    pending: PendingSlot,
    timer: Arc<TimerQueue>,
    filters: FilterChain,
    healthy: Arc<AtomicBool>,
}

impl Dispatch {
    fn fail_pending(&self, err: Error) {
        if let Some(ctx) = self.pending.lock().take() {
            if let Some(tid) = ctx.timeout_timer() {
                self.timer.detach(tid);
            }
            let id = ctx.request_id();
            ctx.complete(Err(err.with_request_id(id)));
        }
    }
}

impl ConnectionHandler for Dispatch {
    fn on_frame(&self, frame: Bytes) -> bool {
        let Some(ctx) = self.pending.lock().take() else {
            debug!(peer = %self.peer, "response with no pending call discarded");
            return true;
        };
        if let Some(tid) = ctx.timeout_timer() {
            self.timer.detach(tid);
        }
        let info = RequestInfo {
            request_id: ctx.request_id(),
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
        self.fail_pending(teardown_error(reason, self.peer));
    }

    fn clean_resource(&self) {}
}

/// One-outstanding-call connector over one TCP connection.
pub struct PoolConnector {
    peer: SocketAddr,
    conn: Arc<TcpConnection>,
    pending: PendingSlot,
    timer: Arc<TimerQueue>,
    filters: FilterChain,
    default_timeout_ms: u64,
    healthy: Arc<AtomicBool>,
    stopped: AtomicBool,
}

impl PoolConnector {
    /// Connects to `peer` on `reactor`.
    pub fn init(
        peer: SocketAddr,
        reactor: Arc<Reactor>,
        opts: ConnectorOptions,
    ) -> Result<Arc<Self>> {
        let healthy = Arc::new(AtomicBool::new(true));
        let pending: PendingSlot = Arc::new(Mutex::new(None));
        let timer = Arc::clone(reactor.timer());

        let dispatch = Arc::new(Dispatch {
            peer,
            pending: Arc::clone(&pending),
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
            pending,
            timer,
            filters: opts.filters,
            default_timeout_ms: opts.call.default_timeout_ms,
            healthy,
            stopped: AtomicBool::new(false),
        }))
    }
}

impl Connector for PoolConnector {
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

        {
            let mut slot = self.pending.lock();
            if slot.is_some() {
                return Err(Error::overload("a call is already outstanding")
                    .with_peer(self.peer)
                    .with_request_id(id));
            }
            let mut ctx = CallContext::new(id, self.peer, req.completion);
            let pending = Arc::clone(&self.pending);
            let peer = self.peer;
            let timer_id = self.timer.add_after(timeout_ms, move || {
                // Only the call we armed for; a newer call keeps its slot.
                let taken = {
                    let mut slot = pending.lock();
                    if slot.as_ref().map(CallContext::request_id) == Some(id) {
                        slot.take()
                    } else {
                        None
                    }
                };
                if let Some(ctx) = taken {
                    ctx.complete(Err(timeout_error(id, peer, timeout_ms)));
                }
            });
            ctx.set_timeout_timer(timer_id);
            *slot = Some(ctx);
        }

        let info = RequestInfo {
            request_id: id,
            peer: self.peer,
            payload_len: req.send_data.len(),
        };
        self.filters.pre_send(&info);
        if let Err(err) = self.conn.send(req.send_data) {
            let taken = {
                let mut slot = self.pending.lock();
                if slot.as_ref().map(CallContext::request_id) == Some(id) {
                    slot.take()
                } else {
                    None
                }
            };
            if let Some(ctx) = taken {
                if let Some(tid) = ctx.timeout_timer() {
                    self.timer.detach(tid);
                }
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

impl std::fmt::Debug for PoolConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConnector")
            .field("peer", &self.peer)
            .field("busy", &self.pending.lock().is_some())
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}
