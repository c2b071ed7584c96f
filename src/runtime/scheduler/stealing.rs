//! The work-stealing scheduling discipline.
//!
//! Each worker owns an unbounded stealable deque plus a bounded pinned lane
//! that is never stolen; a shared unbounded global queue absorbs outside
//! submissions. When a worker runs dry it steals from its victim hint
//! (`vtm`), round-robining the hint on failure; after a bounded number of
//! failed attempts it yields, and finally parks on the shared notifier. A
//! parking worker re-checks every queue once more after taking its park
//! token, so a submission racing the park is never slept past.

use crate::config::SchedulerConfig;
use crate::fiber::Fiber;
use crate::runtime::scheduler::global_queue::GlobalQueue;
use crate::runtime::scheduler::local_queue::{LocalQueue, PinnedQueue, Stealer};
use crate::runtime::scheduler::parker::Notifier;
use crate::runtime::scheduler::{FiberScheduler, HeartbeatFn, WorkerId};
use crate::runtime::timer::TimerQueue;
use crate::tracing_compat::{debug, trace};
use crate::util::DetRng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PARK_TIMEOUT: Duration = Duration::from_millis(10);
const YIELDS_BEFORE_PARK: usize = 2;

struct StealWorker {
    pinned: PinnedQueue,
    local: LocalQueue,
    timer: Arc<TimerQueue>,
    /// Victim hint: the queue this worker tries to steal from first.
    vtm: AtomicUsize,
    entered: AtomicBool,
}

/// Work-stealing scheduler.
pub struct StealingScheduler {
    workers: Vec<StealWorker>,
    stealers: Vec<Stealer>,
    global: GlobalQueue,
    notifier: Notifier,
    stop: AtomicBool,
    heartbeat: Option<HeartbeatFn>,
    steal_attempts: usize,
    enable_parking: bool,
}

impl StealingScheduler {
    /// Builds a scheduler for `cfg.effective_workers()` workers.
    #[must_use]
    pub fn new(cfg: &SchedulerConfig) -> Self {
        let count = cfg.effective_workers();
        let mut rng = DetRng::new(count as u64 + 1);
        let workers: Vec<StealWorker> = (0..count)
            .map(|_| StealWorker {
                pinned: PinnedQueue::new(cfg.local_queue_capacity),
                local: LocalQueue::new(),
                timer: Arc::new(TimerQueue::new()),
                vtm: AtomicUsize::new(rng.next_usize(count)),
                entered: AtomicBool::new(false),
            })
            .collect();
        let stealers = workers.iter().map(|w| w.local.stealer()).collect();
        Self {
            workers,
            stealers,
            global: GlobalQueue::new(),
            notifier: Notifier::new(),
            stop: AtomicBool::new(false),
            heartbeat: None,
            steal_attempts: cfg.steal_attempts,
            enable_parking: cfg.enable_parking,
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

    /// Pushes a fiber produced on `worker` itself; non-stealable fibers go
    /// to the pinned lane, everything else to the stealable deque.
    pub fn submit_local(&self, worker: WorkerId, fiber: Fiber) -> bool {
        let accepted = if fiber.is_local() {
            self.workers[worker].pinned.push(fiber)
        } else {
            self.workers[worker].local.push(fiber);
            true
        };
        if accepted {
            self.notifier.notify_one();
        }
        accepted
    }

    fn try_steal(&self, thief: WorkerId) -> Option<Fiber> {
        let count = self.workers.len();
        if count <= 1 {
            return None;
        }
        let mut victim = self.workers[thief].vtm.load(Ordering::Relaxed) % count;
        for _ in 0..self.steal_attempts {
            if victim != thief {
                if let Some(fiber) = self.stealers[victim].steal() {
                    // Successful victim stays the hint.
                    self.workers[thief].vtm.store(victim, Ordering::Relaxed);
                    return Some(fiber);
                }
            }
            victim = (victim + 1) % count;
        }
        self.workers[thief].vtm.store(victim, Ordering::Relaxed);
        None
    }

    fn next_fiber(&self, worker: WorkerId) -> Option<Fiber> {
        let slot = &self.workers[worker];
        slot.pinned
            .pop()
            .or_else(|| slot.local.pop())
            .or_else(|| self.global.pop())
            .or_else(|| self.try_steal(worker))
    }

    fn any_work_visible(&self, worker: WorkerId) -> bool {
        let slot = &self.workers[worker];
        !slot.pinned.is_empty()
            || !slot.local.is_empty()
            || !self.global.is_empty()
            || self.stealers.iter().any(|s| !s.is_empty())
    }

    fn queue_depth(&self, worker: WorkerId) -> usize {
        let slot = &self.workers[worker];
        slot.pinned.len() + slot.local.len() + self.global.len()
    }
}

impl FiberScheduler for StealingScheduler {
    fn enter(&self, worker: WorkerId) {
        let claimed = self.workers[worker].entered.swap(true, Ordering::AcqRel);
        debug_assert!(!claimed, "worker {worker} entered twice");
        debug!(worker, "worker entered");
    }

    fn schedule(&self, worker: WorkerId) {
        let mut idle_passes = 0usize;
        while !self.stop.load(Ordering::Acquire) {
            let fiber = self.next_fiber(worker);
            let had_work = fiber.is_some();
            if let Some(fiber) = fiber {
                idle_passes = 0;
                fiber.run();
            }

            self.workers[worker].timer.run_expired(Instant::now());
            if let Some(hook) = &self.heartbeat {
                hook(worker, self.queue_depth(worker));
            }

            if !had_work {
                idle_passes += 1;
                if idle_passes <= YIELDS_BEFORE_PARK || !self.enable_parking {
                    std::thread::yield_now();
                } else {
                    let token = self.notifier.prepare_park();
                    if !self.any_work_visible(worker) {
                        self.notifier.park(token, PARK_TIMEOUT);
                    }
                }
            }
        }
        trace!(worker, "worker stopped");
    }

    fn submit(&self, fiber: Fiber) -> bool {
        let accepted = match fiber.dst_thread_key() {
            Some(key) => self.workers[self.route(key)].pinned.push(fiber),
            None => {
                self.global.push(fiber);
                true
            }
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
