//! Idle-worker notifier.
//!
//! Tracks how many workers are parked so submitters only pay the condvar
//! notification cost when someone is actually asleep. A parking worker must
//! re-check its queues between [`Notifier::prepare_park`] and
//! [`Notifier::park`]; the epoch counter inside catches notifications that
//! land in that window, closing the lost-wakeup race.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    parked: usize,
    epoch: u64,
}

/// Shared park/notify coordination for a scheduler's workers.
#[derive(Debug, Default)]
pub struct Notifier {
    state: Mutex<State>,
    condvar: Condvar,
}

/// Token binding a `prepare_park`/`park` pair to one notification epoch.
#[derive(Debug, Clone, Copy)]
pub struct ParkToken {
    epoch: u64,
}

impl Notifier {
    /// Creates a notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently parked workers.
    #[must_use]
    pub fn parked(&self) -> usize {
        self.state.lock().parked
    }

    /// Records intent to park and returns the current epoch. The caller must
    /// re-check all work sources before calling [`park`](Self::park).
    #[must_use]
    pub fn prepare_park(&self) -> ParkToken {
        ParkToken {
            epoch: self.state.lock().epoch,
        }
    }

    /// Parks until notified or `timeout` elapses. Returns immediately when a
    /// notification arrived after the token was taken.
    pub fn park(&self, token: ParkToken, timeout: Duration) {
        let mut state = self.state.lock();
        if state.epoch != token.epoch {
            return;
        }
        state.parked += 1;
        let _ = self.condvar.wait_for(&mut state, timeout);
        state.parked -= 1;
    }

    /// Wakes one parked worker, if any.
    pub fn notify_one(&self) {
        let mut state = self.state.lock();
        state.epoch = state.epoch.wrapping_add(1);
        if state.parked > 0 {
            drop(state);
            self.condvar.notify_one();
        }
    }

    /// Wakes every parked worker (shutdown).
    pub fn notify_all(&self) {
        let mut state = self.state.lock();
        state.epoch = state.epoch.wrapping_add(1);
        drop(state);
        self.condvar.notify_all();
    }
}
