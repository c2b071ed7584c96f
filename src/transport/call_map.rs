//! In-flight call tracking.
//!
//! A [`CallMap`] owns every pending request of a multiplexed connection,
//! keyed by request id and sharded to keep lock contention off the hot path.
//! [`CallMap::remove`] is the single linearization point for a call's fate:
//! whoever removes the context (response dispatch, timeout, teardown) owns
//! it, and [`CallContext::complete`] consumes the context by value, so a
//! call can be completed at most once no matter how the response, the timer,
//! and a connection error race.

use crate::error::{Error, Result};
use crate::runtime::timer::TimerId;
use crate::tracing_compat::debug;
use crate::transport::backup::SharedCompletion;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Terminal outcome of one call, as handed to its completion.
#[derive(Debug)]
pub struct CallResult {
    /// The id the caller layer assigned to the request.
    pub request_id: u64,
    /// Response payload, or the error that ended the call.
    pub payload: Result<Bytes>,
}

/// User-facing completion callback, invoked exactly once per call.
pub type CompletionFn = Box<dyn FnOnce(CallResult) + Send>;

/// How a pending call delivers its outcome.
pub enum CallCompletion {
    /// Plain call: one callback, owned by this context alone.
    Direct(CompletionFn),
    /// Hedged call: the callback lives in a [`SharedCompletion`] raced by
    /// several replicas; `node_index` identifies this replica.
    Shared {
        /// The completion slot shared across replicas.
        shared: Arc<SharedCompletion>,
        /// Index of this replica in the retry info's address list.
        node_index: usize,
    },
}

/// State of one in-flight request.
pub struct CallContext {
    request_id: u64,
    peer: SocketAddr,
    timeout_timer: Option<TimerId>,
    completion: CallCompletion,
}

impl CallContext {
    /// Creates a pending call bound to `peer`.
    #[must_use]
    pub fn new(request_id: u64, peer: SocketAddr, completion: CallCompletion) -> Self {
        Self {
            request_id,
            peer,
            timeout_timer: None,
            completion,
        }
    }

    /// The request id this context tracks.
    #[must_use]
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// The peer the request was sent to.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Records the timeout timer armed for this call.
    pub fn set_timeout_timer(&mut self, id: TimerId) {
        self.timeout_timer = Some(id);
    }

    /// The timeout timer armed for this call, if any.
    #[must_use]
    pub fn timeout_timer(&self) -> Option<TimerId> {
        self.timeout_timer
    }

    /// Delivers the outcome, consuming the context.
    ///
    /// Returns false when a hedged sibling already won and this result was
    /// discarded as a conflict.
    pub fn complete(self, payload: Result<Bytes>) -> bool {
        let result = CallResult {
            request_id: self.request_id,
            payload,
        };
        match self.completion {
            CallCompletion::Direct(f) => {
                f(result);
                true
            }
            CallCompletion::Shared { shared, node_index } => {
                let won = shared.try_complete(node_index, result);
                if !won {
                    debug!(
                        request_id = self.request_id,
                        node_index, "hedged reply lost the race, discarded"
                    );
                }
                won
            }
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("request_id", &self.request_id)
            .field("peer", &self.peer)
            .field("timeout_timer", &self.timeout_timer)
            .finish_non_exhaustive()
    }
}

/// Sharded map of in-flight calls.
pub struct CallMap {
    shards: Vec<Mutex<HashMap<u64, CallContext>>>,
}

impl CallMap {
    /// Creates a map with `shard_count` shards (at least one).
    #[must_use]
    pub fn new(shard_count: usize) -> Self {
        let n = shard_count.max(1);
        Self {
            shards: (0..n).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, request_id: u64) -> &Mutex<HashMap<u64, CallContext>> {
        let idx = (request_id % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    /// Registers a pending call. Fails (handing the context back) when the
    /// id is already in flight.
    pub fn insert(&self, ctx: CallContext) -> std::result::Result<(), CallContext> {
        let mut shard = self.shard(ctx.request_id).lock();
        if shard.contains_key(&ctx.request_id) {
            return Err(ctx);
        }
        shard.insert(ctx.request_id, ctx);
        Ok(())
    }

    /// Records the timeout timer for a pending call.
    ///
    /// Returns false when the call has already been claimed; the caller must
    /// then detach the timer itself, since no removal path will see it.
    pub fn set_timeout_timer(&self, request_id: u64, timer: TimerId) -> bool {
        let mut shard = self.shard(request_id).lock();
        match shard.get_mut(&request_id) {
            Some(ctx) => {
                ctx.set_timeout_timer(timer);
                true
            }
            None => false,
        }
    }

    /// Claims the call for `request_id`, if still pending.
    ///
    /// This is the linearization point: at most one caller gets the context.
    pub fn remove(&self, request_id: u64) -> Option<CallContext> {
        self.shard(request_id).lock().remove(&request_id)
    }

    /// Claims every pending call, for teardown.
    pub fn drain(&self) -> Vec<CallContext> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.lock().drain().map(|(_, ctx)| ctx));
        }
        out
    }

    /// Total pending calls across all shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// True when no call is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CallMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallMap")
            .field("shards", &self.shards.len())
            .field("pending", &self.len())
            .finish()
    }
}

struct SlotInner {
    cell: Mutex<Option<CallResult>>,
    ready: Condvar,
}

/// Blocks a synchronous caller until its completion fires.
#[derive(Clone)]
pub struct ReplySlot {
    inner: Arc<SlotInner>,
}

impl Default for ReplySlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplySlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SlotInner {
                cell: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// A completion callback that fills this slot.
    #[must_use]
    pub fn completion(&self) -> CompletionFn {
        let inner = Arc::clone(&self.inner);
        Box::new(move |result| {
            *inner.cell.lock() = Some(result);
            inner.ready.notify_all();
        })
    }

    /// Waits up to `timeout` for the result.
    ///
    /// `None` means the wait itself expired before any completion ran; the
    /// call is still owned by whatever will eventually complete it.
    pub fn wait(&self, timeout: Duration) -> Option<CallResult> {
        let mut cell = self.inner.cell.lock();
        if cell.is_none() {
            let _ = self.inner.ready.wait_for(&mut cell, timeout);
        }
        cell.take()
    }
}

impl std::fmt::Debug for ReplySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySlot")
            .field("filled", &self.inner.cell.lock().is_some())
            .finish()
    }
}

/// Builds the timed-out error raised when a call's timer fires.
#[must_use]
pub fn timeout_error(request_id: u64, peer: SocketAddr, timeout_ms: u64) -> Error {
    Error::timeout(format!("request {request_id} timed out after {timeout_ms}ms"))
        .with_peer(peer)
        .with_request_id(request_id)
}
