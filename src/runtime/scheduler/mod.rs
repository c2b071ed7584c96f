//! Cooperative fiber schedulers.
//!
//! Two interchangeable disciplines behind one contract:
//!
//! - [`NonStealingScheduler`]: bounded per-worker local queues plus a bounded
//!   global overflow queue; a worker never touches another worker's queue
//! - [`StealingScheduler`]: unbounded stealable deques with a per-worker
//!   victim hint and a parking notifier; idle workers steal
//!
//! Both host one [`TimerQueue`] per worker and invoke the host's heartbeat
//! hook every scheduling pass so external liveness detectors can observe
//! per-worker progress and queue depth. There is no hidden "current worker"
//! thread-local: callers pass the worker id explicitly.

mod global_queue;
mod local_queue;
mod non_stealing;
mod parker;
mod stealing;

pub use global_queue::{BoundedGlobalQueue, GlobalQueue};
pub use local_queue::{LocalQueue, PinnedQueue, Stealer};
pub use non_stealing::NonStealingScheduler;
pub use parker::Notifier;
pub use stealing::StealingScheduler;

use crate::fiber::Fiber;
use crate::runtime::timer::TimerQueue;
use std::sync::Arc;

/// Identifier for a scheduler worker.
pub type WorkerId = usize;

/// Hook observing `(worker, queue_depth)` once per scheduling pass.
pub type HeartbeatFn = Arc<dyn Fn(WorkerId, usize) + Send + Sync>;

/// The common contract of both scheduling disciplines.
pub trait FiberScheduler: Send + Sync {
    /// Claims a worker slot for the current thread. Call once per worker
    /// before [`schedule`](Self::schedule).
    fn enter(&self, worker: WorkerId);

    /// Runs the worker loop; blocks until [`stop`](Self::stop).
    fn schedule(&self, worker: WorkerId);

    /// Submits a fiber from any thread; routes by destination affinity.
    /// Returns false when the destination queue is full.
    fn submit(&self, fiber: Fiber) -> bool;

    /// The timer queue hosted by the given worker.
    fn timer(&self, worker: WorkerId) -> &Arc<TimerQueue>;

    /// Requests shutdown; idempotent. Workers drain nothing further and
    /// return from [`schedule`](Self::schedule).
    fn stop(&self);

    /// Number of workers this scheduler was built for.
    fn worker_count(&self) -> usize;
}
