//! The non-stealing scheduling discipline.
//!
//! Each worker owns a bounded local queue; a bounded global queue absorbs
//! work submitted from outside any worker. A worker pops from its local
//! queue first, then the global queue, and never touches another worker's
//! queue. Destination affinity (`dst_thread_key`) hashes a fiber to a
//! specific worker's local queue, keeping a connection's callbacks on one
//! worker for memory locality.

use crate::config::SchedulerConfig;
use crate::fiber::Fiber;
use crate::runtime::scheduler::global_queue::BoundedGlobalQueue;
use crate::runtime::scheduler::local_queue::PinnedQueue;
use crate::runtime::scheduler::parker::Notifier;
use crate::runtime::scheduler::{FiberScheduler, HeartbeatFn, WorkerId};
use crate::runtime::timer::TimerQueue;
use crate::tracing_compat::{debug, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PARK_TIMEOUT: Duration = Duration::from_millis(10);

struct WorkerSlot {
    local: PinnedQueue,
    timer: Arc<TimerQueue>,
    entered: AtomicBool,
}

/// Affinity-preserving scheduler without work stealing.
pub struct NonStealingScheduler {
    workers: Vec<WorkerSlot>,
    global: BoundedGlobalQueue,
    notifier: Notifier,
    stop: AtomicBool,
    heartbeat: Option<HeartbeatFn>,
}

impl NonStealingScheduler {
    /// Builds a scheduler for `cfg.effective_workers()` workers.
    #[must_use]
    pub fn new(cfg: &SchedulerConfig) -> Self {
        let count = cfg.effective_workers();
        let workers = (0..count)
            .map(|_| WorkerSlot {
                local: PinnedQueue::new(cfg.local_queue_capacity),
                timer: Arc::new(TimerQueue::new()),
                entered: AtomicBool::new(false),
            })
            .collect();
        Self {
            workers,
            global: BoundedGlobalQueue::new(cfg.global_queue_capacity),
            notifier: Notifier::new(),
            stop: AtomicBool::new(false),
            heartbeat: None,
        }
    }

    /// Installs a heartbeat hook invoked every scheduling pass.
    #[must_use]
    pub fn with_heartbeat(mut self, hook: HeartbeatFn) -> Self {
        self.heartbeat = Some(hook);
        self
    }

    fn route(&self, key: u64) -> usize {
        (key % self.workers.len() as u64) as usize
    }

    fn next_fiber(&self, worker: WorkerId) -> Option<Fiber> {
        self.workers[worker]
            .local
            .pop()
            .or_else(|| self.global.pop())
    }
}

impl FiberScheduler for NonStealingScheduler {
    fn enter(&self, worker: WorkerId) {
        let claimed = self.workers[worker].entered.swap(true, Ordering::AcqRel);
        debug_assert!(!claimed, "worker {worker} entered twice");
        debug!(worker, "worker entered");
    }

    fn schedule(&self, worker: WorkerId) {
        while !self.stop.load(Ordering::Acquire) {
            let fiber = self.next_fiber(worker);
            let had_work = fiber.is_some();
            if let Some(fiber) = fiber {
                fiber.run();
            }

            self.workers[worker].timer.run_expired(Instant::now());
            if let Some(hook) = &self.heartbeat {
                let depth = self.workers[worker].local.len() + self.global.len();
                hook(worker, depth);
            }

            if !had_work {
                let token = self.notifier.prepare_park();
                // Recheck after taking the token; a fiber routed here in the
                // meantime must not be slept past.
                if self.workers[worker].local.is_empty() && self.global.is_empty() {
                    self.notifier.park(token, PARK_TIMEOUT);
                }
            }
        }
        trace!(worker, "worker stopped");
    }

    fn submit(&self, fiber: Fiber) -> bool {
        let accepted = match fiber.dst_thread_key() {
            Some(key) => self.workers[self.route(key)].local.push(fiber),
            None => self.global.push(fiber),
        };
        if accepted {
            self.notifier.notify_one();
        }
        accepted
    }

    fn timer(&self, worker: WorkerId) -> &Arc<TimerQueue> {
        &self.workers[worker].timer
    }

    fn stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            self.notifier.notify_all();
        }
    }

    fn worker_count(&self) -> usize {
        self.workers.len()
    }
}
