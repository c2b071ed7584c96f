//! Per-worker queues.
//!
//! Two lanes per worker: a stealable deque (owner pops LIFO, thieves steal
//! FIFO) and a bounded pinned lane that is never stolen. Fibers carrying a
//! destination-thread affinity land in the pinned lane; everything else the
//! worker produces goes to the stealable deque.
//!
//! The deque is a lock-based `VecDeque`, which stays within the crate's
//! `unsafe` prohibition while preserving correct work-stealing semantics.

use crate::fiber::Fiber;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::Arc;

/// A worker's stealable queue.
///
/// Single-producer (the owning worker), multi-consumer (thieves). The owner
/// pushes and pops from one end; stealers take from the other.
#[derive(Debug)]
pub struct LocalQueue {
    inner: Arc<Mutex<std::collections::VecDeque<Fiber>>>,
}

impl LocalQueue {
    /// Creates a new stealable queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(std::collections::VecDeque::new())),
        }
    }

    /// Pushes a fiber (owner side).
    pub fn push(&self, fiber: Fiber) {
        self.inner.lock().push_back(fiber);
    }

    /// Pops a fiber (owner side, LIFO for cache locality).
    #[must_use]
    pub fn pop(&self) -> Option<Fiber> {
        self.inner.lock().pop_back()
    }

    /// Number of queued fibers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when no fibers are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Creates a stealer handle for this queue.
    #[must_use]
    pub fn stealer(&self) -> Stealer {
        Stealer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle to steal fibers from another worker's queue.
#[derive(Debug, Clone)]
pub struct Stealer {
    inner: Arc<Mutex<std::collections::VecDeque<Fiber>>>,
}

impl Stealer {
    /// Steals the oldest fiber (FIFO side).
    #[must_use]
    pub fn steal(&self) -> Option<Fiber> {
        self.inner.lock().pop_front()
    }

    /// True when the observed queue currently holds nothing to steal.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// A worker's bounded, never-stolen lane.
///
/// Multi-producer (any thread routing by affinity), single-consumer (the
/// owning worker). Push failure is surfaced to the caller.
#[derive(Debug)]
pub struct PinnedQueue {
    inner: ArrayQueue<Fiber>,
}

impl PinnedQueue {
    /// Creates a pinned lane with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    /// Pushes a fiber; returns false when the lane is full.
    pub fn push(&self, fiber: Fiber) -> bool {
        self.inner.push(fiber).is_ok()
    }

    /// Pops the next pinned fiber.
    #[must_use]
    pub fn pop(&self) -> Option<Fiber> {
        self.inner.pop()
    }

    /// Number of queued fibers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when no fibers are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
