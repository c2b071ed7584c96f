//! Backup (hedged) request plumbing.
//!
//! A backup request duplicates a call to one or more alternate destinations
//! after a configured delay, to cut tail latency. The original and each
//! duplicate carry their own [`CallContext`](super::call_map::CallContext),
//! but all of them point at one [`SharedCompletion`]: whichever reply (or
//! timeout) arrives first takes the single user callback and records which
//! replica answered; every later completion attempt observes the
//! `reply_ready` flag and is discarded as a conflict, so the caller is never
//! completed twice.

use crate::transport::call_map::{CallResult, CompletionFn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Replica index recorded before any reply has won.
pub const NO_RESPONDER: usize = usize::MAX;

/// Read-mostly description of a hedged call, shared between the original and
/// duplicated in-flight requests.
#[derive(Debug)]
pub struct BackupRequestRetryInfo {
    /// Destination addresses; index 0 is the original target.
    pub addrs: Vec<SocketAddr>,
    /// Delay before the duplicate is sent, in milliseconds.
    pub delay_ms: u64,
    /// Which replica's reply completed the call; [`NO_RESPONDER`] until then.
    pub succ_rsp_node_index: AtomicUsize,
}

impl BackupRequestRetryInfo {
    /// Creates retry info for the given replica set and resend delay.
    #[must_use]
    pub fn new(addrs: Vec<SocketAddr>, delay_ms: u64) -> Self {
        Self {
            addrs,
            delay_ms,
            succ_rsp_node_index: AtomicUsize::new(NO_RESPONDER),
        }
    }

    /// The replica index that answered, if any reply has won yet.
    #[must_use]
    pub fn responder(&self) -> Option<usize> {
        match self.succ_rsp_node_index.load(Ordering::Acquire) {
            NO_RESPONDER => None,
            idx => Some(idx),
        }
    }
}

/// The single completion slot shared by all replicas of one hedged call.
pub struct SharedCompletion {
    cell: Mutex<Option<CompletionFn>>,
    reply_ready: AtomicBool,
    retry: Arc<BackupRequestRetryInfo>,
}

impl SharedCompletion {
    /// Wraps a user callback for fan-out across replicas.
    #[must_use]
    pub fn new(completion: CompletionFn, retry: Arc<BackupRequestRetryInfo>) -> Self {
        Self {
            cell: Mutex::new(Some(completion)),
            reply_ready: AtomicBool::new(false),
            retry,
        }
    }

    /// True once some replica's reply (or a timeout) has won.
    #[must_use]
    pub fn is_reply_ready(&self) -> bool {
        self.reply_ready.load(Ordering::Acquire)
    }

    /// The retry info this completion fans out over.
    #[must_use]
    pub fn retry(&self) -> &Arc<BackupRequestRetryInfo> {
        &self.retry
    }

    /// Attempts to deliver `result` on behalf of replica `node_index`.
    ///
    /// Returns true when this attempt won the race and the user callback
    /// ran; false when a reply was already recorded (the caller should
    /// discard the result as a conflict).
    pub fn try_complete(&self, node_index: usize, result: CallResult) -> bool {
        let completion = self.cell.lock().take();
        let Some(completion) = completion else {
            return false;
        };
        if result.payload.is_ok() {
            self.retry
                .succ_rsp_node_index
                .store(node_index, Ordering::Release);
        }
        self.reply_ready.store(true, Ordering::Release);
        completion(result);
        true
    }
}

impl std::fmt::Debug for SharedCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCompletion")
            .field("reply_ready", &self.is_reply_ready())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize as Counter;

    fn addrs() -> Vec<SocketAddr> {
        vec![
            "127.0.0.1:9001".parse().expect("addr"),
            "127.0.0.1:9002".parse().expect("addr"),
        ]
    }

    fn ok_result(id: u64) -> CallResult {
        CallResult {
            request_id: id,
            payload: Ok(Bytes::from_static(b"rsp")),
        }
    }

    #[test]
    fn first_reply_wins_and_records_responder() {
        let retry = Arc::new(BackupRequestRetryInfo::new(addrs(), 20));
        let count = Arc::new(Counter::new(0));
        let c = Arc::clone(&count);
        let shared = SharedCompletion::new(
            Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::clone(&retry),
        );

        assert!(shared.try_complete(0, ok_result(1)));
        assert!(shared.is_reply_ready());
        assert_eq!(retry.responder(), Some(0));

        // The duplicate's later reply is a conflict, not a second completion.
        assert!(!shared.try_complete(1, ok_result(1)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(retry.responder(), Some(0));
    }

    #[test]
    fn failed_winner_does_not_record_a_responder() {
        let retry = Arc::new(BackupRequestRetryInfo::new(addrs(), 20));
        let shared = SharedCompletion::new(Box::new(|_| {}), Arc::clone(&retry));

        assert!(shared.try_complete(
            0,
            CallResult {
                request_id: 7,
                payload: Err(Error::timeout("late")),
            }
        ));
        assert!(shared.is_reply_ready());
        assert_eq!(retry.responder(), None);
    }

    #[test]
    fn concurrent_replies_complete_exactly_once() {
        use std::thread;

        for _ in 0..50 {
            let retry = Arc::new(BackupRequestRetryInfo::new(addrs(), 20));
            let count = Arc::new(Counter::new(0));
            let c = Arc::clone(&count);
            let shared = Arc::new(SharedCompletion::new(
                Box::new(move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
                retry,
            ));

            let a = Arc::clone(&shared);
            let b = Arc::clone(&shared);
            let t1 = thread::spawn(move || a.try_complete(0, ok_result(1)));
            let t2 = thread::spawn(move || b.try_complete(1, ok_result(1)));
            let r1 = t1.join().expect("t1");
            let r2 = t2.join().expect("t2");

            assert!(r1 ^ r2, "exactly one attempt must win");
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }
}
