//! Global injection queues.
//!
//! Work submitted from outside any worker, or tagged parallel, lands here.
//! The stealing discipline uses the unbounded [`GlobalQueue`]; the
//! non-stealing discipline uses [`BoundedGlobalQueue`], whose push failure is
//! surfaced to the caller.

use crate::fiber::Fiber;
use crossbeam_queue::{ArrayQueue, SegQueue};

/// Unbounded thread-safe FIFO of fibers.
#[derive(Debug, Default)]
pub struct GlobalQueue {
    inner: SegQueue<Fiber>,
}

impl GlobalQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: SegQueue::new(),
        }
    }

    /// Pushes a fiber.
    pub fn push(&self, fiber: Fiber) {
        self.inner.push(fiber);
    }

    /// Pops the oldest fiber.
    #[must_use]
    pub fn pop(&self) -> Option<Fiber> {
        self.inner.pop()
    }

    /// Number of queued fibers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Bounded thread-safe FIFO of fibers.
#[derive(Debug)]
pub struct BoundedGlobalQueue {
    inner: ArrayQueue<Fiber>,
}

impl BoundedGlobalQueue {
    /// Creates a queue with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    /// Pushes a fiber; returns false when full.
    pub fn push(&self, fiber: Fiber) -> bool {
        self.inner.push(fiber).is_ok()
    }

    /// Pops the oldest fiber.
    #[must_use]
    pub fn pop(&self) -> Option<Fiber> {
        self.inner.pop()
    }

    /// Number of queued fibers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
