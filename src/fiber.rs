//! The cooperative unit of work.
//!
//! A fiber is a run-to-completion closure plus its scheduling attributes.
//! There is no preemption: once a worker pops a fiber it executes the
//! procedure until it returns, and anything resembling a suspension point is
//! modeled by submitting a continuation fiber. The attributes decide where
//! the fiber may run:
//!
//! - `dst_thread_key` pins the fiber to one worker (hashed modulo worker
//!   count), used to keep a connection's callbacks on the worker that owns
//!   its reactor registration
//! - `local` marks the fiber as non-stealable even without a destination key
//! - `group` names the scheduling group, so hosts running several scheduler
//!   instances can route by group

/// A suspendable-by-convention unit of execution.
pub struct Fiber {
    proc: Box<dyn FnOnce() + Send + 'static>,
    group: usize,
    local: bool,
    dst_thread_key: Option<u64>,
}

impl Fiber {
    /// Creates a fiber from a start procedure with default attributes
    /// (group 0, stealable, no destination affinity).
    #[must_use]
    pub fn new(proc: impl FnOnce() + Send + 'static) -> Self {
        Self {
            proc: Box::new(proc),
            group: 0,
            local: false,
            dst_thread_key: None,
        }
    }

    /// Sets the scheduling-group affinity.
    #[must_use]
    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    /// Marks the fiber as local: it must run on the worker it is queued on
    /// and is never stolen.
    #[must_use]
    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Routes the fiber to a specific worker, hashed modulo worker count.
    /// A fiber with a destination key is never stolen by another worker.
    #[must_use]
    pub fn with_dst_thread_key(mut self, key: u64) -> Self {
        self.dst_thread_key = Some(key);
        self
    }

    /// Returns the scheduling-group affinity.
    #[must_use]
    pub fn group(&self) -> usize {
        self.group
    }

    /// True when the fiber must not be stolen.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.local || self.dst_thread_key.is_some()
    }

    /// Returns the destination-thread key, if any.
    #[must_use]
    pub fn dst_thread_key(&self) -> Option<u64> {
        self.dst_thread_key
    }

    /// Runs the fiber to completion, consuming it.
    pub fn run(self) {
        (self.proc)();
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("group", &self.group)
            .field("local", &self.local)
            .field("dst_thread_key", &self.dst_thread_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_to_completion() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        Fiber::new(move || flag.store(true, Ordering::SeqCst)).run();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn destination_key_implies_local() {
        let fiber = Fiber::new(|| {}).with_dst_thread_key(7);
        assert!(fiber.is_local());
        assert_eq!(fiber.dst_thread_key(), Some(7));
    }

    #[test]
    fn attributes_round_trip() {
        let fiber = Fiber::new(|| {}).with_group(3).with_local(true);
        assert_eq!(fiber.group(), 3);
        assert!(fiber.is_local());
        assert_eq!(fiber.dst_thread_key(), None);
    }
}
