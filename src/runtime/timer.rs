//! Timer queue for delayed and periodic callbacks.
//!
//! A [`TimerQueue`] is an id-keyed collection of one-shot and periodic
//! callbacks backed by a min-heap. Each reactor (and each scheduler worker)
//! owns one and polls it every loop iteration via [`TimerQueue::run_expired`].
//!
//! Cancellation uses generation counters instead of heap removal: pause,
//! resume, and cancel bump or drop the generation recorded for the id, and
//! stale heap entries are lazily discarded when they surface. Timer ids are
//! process-local 64-bit opaque handles with no cross-process meaning; all
//! intervals are milliseconds.
//!
//! # Cancellation semantics
//!
//! `cancel` removes the entry and drops the callback under the queue lock,
//! so once `cancel` returns the callback can no longer begin firing. A
//! callback that is already mid-fire completes, but a concurrent cancel
//! suppresses any periodic re-arm. `detach` is the same removal for callers
//! that do not care whether a firing is in flight.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

/// Opaque handle identifying a timer within one [`TimerQueue`].
pub type TimerId = u64;

type TimerCallback = Box<dyn FnMut() + Send>;

/// Heap entry; validity is checked against the id table's generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    generation: u64,
    id: TimerId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct TimerState {
    /// Taken out (left `None`) while the callback is being fired.
    callback: Option<TimerCallback>,
    deadline: Instant,
    interval: Option<Duration>,
    generation: u64,
    /// Remaining time recorded at pause; `Some` means the timer is paused.
    paused_remaining: Option<Duration>,
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<HeapEntry>,
    timers: HashMap<TimerId, TimerState>,
    next_generation: u64,
}

impl Inner {
    fn arm(&mut self, id: TimerId, deadline: Instant) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.heap.push(HeapEntry {
            deadline,
            generation,
            id,
        });
        generation
    }

    /// True when the heap entry still refers to a live, unpaused arming.
    fn entry_is_current(&self, entry: &HeapEntry) -> bool {
        self.timers.get(&entry.id).is_some_and(|state| {
            state.generation == entry.generation && state.paused_remaining.is_none()
        })
    }
}

/// An ordered collection of delayed and periodic callbacks.
pub struct TimerQueue {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    /// Creates an empty timer queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a one-shot timer firing `delay_ms` from now.
    pub fn add_after(&self, delay_ms: u64, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_inner(Duration::from_millis(delay_ms), None, Box::new(callback))
    }

    /// Registers a periodic timer first firing after `initial_ms`, then every
    /// `interval_ms`.
    pub fn add_periodic(
        &self,
        initial_ms: u64,
        interval_ms: u64,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        self.add_inner(
            Duration::from_millis(initial_ms),
            Some(Duration::from_millis(interval_ms)),
            Box::new(callback),
        )
    }

    fn add_inner(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerId {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let deadline = Instant::now() + delay;
        let mut inner = self.inner.lock();
        let generation = inner.arm(id, deadline);
        inner.timers.insert(
            id,
            TimerState {
                callback: Some(callback),
                deadline,
                interval,
                generation,
                paused_remaining: None,
            },
        );
        id
    }

    /// Pauses a timer, recording its remaining time. Returns false for an
    /// unknown or already-paused id.
    pub fn pause(&self, id: TimerId) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let generation = inner.next_generation;
        let Some(state) = inner.timers.get_mut(&id) else {
            return false;
        };
        if state.paused_remaining.is_some() {
            return false;
        }
        state.paused_remaining = Some(state.deadline.saturating_duration_since(now));
        // Invalidate the queued heap entry.
        state.generation = generation;
        inner.next_generation += 1;
        true
    }

    /// Resumes a paused timer with its recorded remaining time. Returns false
    /// for an unknown or non-paused id.
    pub fn resume(&self, id: TimerId) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(state) = inner.timers.get_mut(&id) else {
            return false;
        };
        let Some(remaining) = state.paused_remaining.take() else {
            return false;
        };
        let deadline = now + remaining;
        state.deadline = deadline;
        let generation = inner.arm(id, deadline);
        if let Some(state) = inner.timers.get_mut(&id) {
            state.generation = generation;
        }
        true
    }

    /// Cancels a timer. After this returns, the callback cannot begin firing;
    /// a firing already in progress completes but is never re-armed.
    pub fn cancel(&self, id: TimerId) -> bool {
        // The callback is dropped under the lock, which is what makes the
        // "never fires after cancel returns" guarantee hold.
        self.inner.lock().timers.remove(&id).is_some()
    }

    /// Cancels a timer without reporting whether it existed or was mid-fire.
    pub fn detach(&self, id: TimerId) {
        let _ = self.cancel(id);
    }

    /// Returns the earliest live deadline, discarding stale heap entries.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.lock();
        loop {
            let entry = *inner.heap.peek()?;
            if inner.entry_is_current(&entry) {
                return Some(entry.deadline);
            }
            inner.heap.pop();
        }
    }

    /// Number of registered (live) timers, paused ones included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Fires every timer whose deadline is at or before `now`.
    ///
    /// Callbacks run outside the queue lock, so they may freely register or
    /// cancel timers. Returns the number of callbacks fired.
    pub fn run_expired(&self, now: Instant) -> usize {
        let mut due: Vec<(TimerId, TimerCallback, Option<Duration>)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            while let Some(entry) = inner.heap.peek().copied() {
                if !inner.entry_is_current(&entry) {
                    inner.heap.pop();
                    continue;
                }
                if entry.deadline > now {
                    break;
                }
                inner.heap.pop();
                if let Some(state) = inner.timers.get_mut(&entry.id) {
                    if let Some(callback) = state.callback.take() {
                        due.push((entry.id, callback, state.interval));
                    }
                }
            }
        }

        let fired = due.len();
        let mut finished = Vec::with_capacity(fired);
        for (id, mut callback, interval) in due {
            callback();
            finished.push((id, callback, interval));
        }

        let rearm_base = Instant::now();
        let mut inner = self.inner.lock();
        for (id, callback, interval) in finished {
            // Cancelled mid-fire: the id is gone, drop the callback and
            // suppress any re-arm.
            if !inner.timers.contains_key(&id) {
                continue;
            }
            match interval {
                Some(period) => {
                    let deadline = rearm_base + period;
                    let generation = inner.arm(id, deadline);
                    if let Some(state) = inner.timers.get_mut(&id) {
                        state.callback = Some(callback);
                        state.deadline = deadline;
                        if state.paused_remaining.is_some() {
                            // Paused mid-fire; keep the callback, skip arming.
                            state.paused_remaining = Some(period);
                        } else {
                            state.generation = generation;
                        }
                    }
                }
                None => {
                    inner.timers.remove(&id);
                }
            }
        }
        fired
    }
}

impl std::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueue")
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrd};
    use std::sync::Arc;
    use std::thread;

    fn fire_all(queue: &TimerQueue) -> usize {
        queue.run_expired(Instant::now() + Duration::from_secs(3600))
    }

    #[test]
    fn one_shot_fires_once_and_is_removed() {
        let queue = TimerQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        queue.add_after(0, move || {
            c.fetch_add(1, AtomicOrd::SeqCst);
        });
        assert_eq!(queue.size(), 1);

        assert_eq!(fire_all(&queue), 1);
        assert_eq!(count.load(AtomicOrd::SeqCst), 1);
        assert_eq!(queue.size(), 0);

        assert_eq!(fire_all(&queue), 0);
        assert_eq!(count.load(AtomicOrd::SeqCst), 1);
    }

    #[test]
    fn expiration_order_is_deadline_order() {
        let queue = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(30u64, 3u32), (10, 1), (20, 2)] {
            let order = Arc::clone(&order);
            queue.add_after(delay, move || order.lock().push(tag));
        }
        fire_all(&queue);
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn cancel_prevents_firing() {
        let queue = TimerQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = queue.add_after(0, move || {
            c.fetch_add(1, AtomicOrd::SeqCst);
        });

        assert!(queue.cancel(id));
        assert!(!queue.cancel(id), "second cancel reports not found");
        assert_eq!(queue.size(), 0);

        assert_eq!(fire_all(&queue), 0);
        assert_eq!(count.load(AtomicOrd::SeqCst), 0);
    }

    #[test]
    fn periodic_refires_until_cancelled() {
        let queue = TimerQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = queue.add_periodic(0, 1, move || {
            c.fetch_add(1, AtomicOrd::SeqCst);
        });

        for _ in 0..3 {
            thread::sleep(Duration::from_millis(2));
            fire_all(&queue);
        }
        let fired = count.load(AtomicOrd::SeqCst);
        assert!(fired >= 3, "periodic should refire, got {fired}");
        assert_eq!(queue.size(), 1);

        assert!(queue.cancel(id));
        thread::sleep(Duration::from_millis(2));
        assert_eq!(fire_all(&queue), 0);
        assert_eq!(count.load(AtomicOrd::SeqCst), fired);
    }

    #[test]
    fn callback_can_cancel_its_own_periodic_timer() {
        let queue = Arc::new(TimerQueue::new());
        let count = Arc::new(AtomicUsize::new(0));

        let q = Arc::clone(&queue);
        let c = Arc::clone(&count);
        let id_cell = Arc::new(Mutex::new(0u64));
        let cell = Arc::clone(&id_cell);
        let id = queue.add_periodic(0, 1, move || {
            c.fetch_add(1, AtomicOrd::SeqCst);
            q.detach(*cell.lock());
        });
        *id_cell.lock() = id;

        fire_all(&queue);
        assert_eq!(count.load(AtomicOrd::SeqCst), 1);
        assert_eq!(queue.size(), 0, "self-cancel suppresses re-arm");
    }

    #[test]
    fn pause_and_resume_preserve_timer() {
        let queue = TimerQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = queue.add_after(5, move || {
            c.fetch_add(1, AtomicOrd::SeqCst);
        });

        assert!(queue.pause(id));
        assert!(!queue.pause(id), "double pause rejected");
        // A paused timer never fires, however late the poll.
        assert_eq!(fire_all(&queue), 0);
        assert_eq!(queue.size(), 1);

        assert!(queue.resume(id));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(queue.run_expired(Instant::now()), 1);
        assert_eq!(count.load(AtomicOrd::SeqCst), 1);
    }

    #[test]
    fn next_deadline_skips_stale_entries() {
        let queue = TimerQueue::new();
        let early = queue.add_after(10, || {});
        let _late = queue.add_after(1000, || {});

        let first = queue.next_deadline().expect("deadline");
        queue.cancel(early);
        let second = queue.next_deadline().expect("deadline");
        assert!(second > first);
    }

    #[test]
    fn cancel_race_fires_exactly_once_or_not_at_all() {
        // Drive expiration on one thread while cancelling from another;
        // every iteration must observe zero or one firing, never two.
        for seed in 0..50u64 {
            let queue = Arc::new(TimerQueue::new());
            let count = Arc::new(AtomicUsize::new(0));

            let c = Arc::clone(&count);
            let id = queue.add_after(1, move || {
                c.fetch_add(1, AtomicOrd::SeqCst);
            });

            let q = Arc::clone(&queue);
            let firing = thread::spawn(move || {
                for _ in 0..20 {
                    q.run_expired(Instant::now());
                    thread::yield_now();
                }
            });
            let q = Arc::clone(&queue);
            let cancelling = thread::spawn(move || {
                if seed % 2 == 0 {
                    thread::yield_now();
                }
                q.cancel(id);
            });

            firing.join().expect("firing thread");
            cancelling.join().expect("cancel thread");

            let fired = count.load(AtomicOrd::SeqCst);
            assert!(fired <= 1, "timer fired {fired} times");
            assert_eq!(queue.size(), 0);
        }
    }
}
