//! Observe-only extension points around send and receive.
//!
//! Four hooks are invoked as side effects: pre-send and post-send around the
//! write, pre-receive and post-receive around response dispatch. Filters may
//! observe and annotate their own state but cannot alter control flow inside
//! the core; a filter that wants to reject a call does so at the caller
//! layer before the request reaches the transport.

use std::net::SocketAddr;
use std::sync::Arc;

/// Read-only view of an in-flight request handed to filters.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo {
    /// The request id assigned by the caller layer.
    pub request_id: u64,
    /// Destination peer.
    pub peer: SocketAddr,
    /// Outbound payload length in bytes.
    pub payload_len: usize,
}

/// A transport filter. All methods default to no-ops so implementations
/// override only the points they care about.
pub trait Filter: Send + Sync {
    /// Called just before the request bytes are appended to the write buffer.
    fn pre_send(&self, _req: &RequestInfo) {}
    /// Called after the request bytes were accepted by the write buffer.
    fn post_send(&self, _req: &RequestInfo) {}
    /// Called when a response frame has been matched to the request, before
    /// completion runs.
    fn pre_recv(&self, _req: &RequestInfo) {}
    /// Called after the completion callback ran.
    fn post_recv(&self, _req: &RequestInfo) {}
}

/// An ordered chain of filters, invoked in registration order.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a filter to the chain.
    pub fn push(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    /// Runs the pre-send point.
    pub fn pre_send(&self, req: &RequestInfo) {
        for f in &self.filters {
            f.pre_send(req);
        }
    }

    /// Runs the post-send point.
    pub fn post_send(&self, req: &RequestInfo) {
        for f in &self.filters {
            f.post_send(req);
        }
    }

    /// Runs the pre-receive point.
    pub fn pre_recv(&self, req: &RequestInfo) {
        for f in &self.filters {
            f.pre_recv(req);
        }
    }

    /// Runs the post-receive point.
    pub fn post_recv(&self, req: &RequestInfo) {
        for f in &self.filters {
            f.post_recv(req);
        }
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("len", &self.filters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        pre_send: AtomicUsize,
        post_send: AtomicUsize,
        pre_recv: AtomicUsize,
        post_recv: AtomicUsize,
    }

    impl Filter for Counting {
        fn pre_send(&self, _req: &RequestInfo) {
            self.pre_send.fetch_add(1, Ordering::SeqCst);
        }
        fn post_send(&self, _req: &RequestInfo) {
            self.post_send.fetch_add(1, Ordering::SeqCst);
        }
        fn pre_recv(&self, _req: &RequestInfo) {
            self.pre_recv.fetch_add(1, Ordering::SeqCst);
        }
        fn post_recv(&self, _req: &RequestInfo) {
            self.post_recv.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn all_four_points_fire() {
        let filter = Arc::new(Counting::default());
        let mut chain = FilterChain::new();
        chain.push(filter.clone());

        let info = RequestInfo {
            request_id: 1,
            peer: "127.0.0.1:80".parse().expect("addr"),
            payload_len: 3,
        };
        chain.pre_send(&info);
        chain.post_send(&info);
        chain.pre_recv(&info);
        chain.post_recv(&info);

        assert_eq!(filter.pre_send.load(Ordering::SeqCst), 1);
        assert_eq!(filter.post_send.load(Ordering::SeqCst), 1);
        assert_eq!(filter.pre_recv.load(Ordering::SeqCst), 1);
        assert_eq!(filter.post_recv.load(Ordering::SeqCst), 1);
    }
}
