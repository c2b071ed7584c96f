//! Bounded outbound write buffering.
//!
//! A [`WriteBufferList`] is the connection's outbound queue: a list of byte
//! segments bounded by total byte size (not message count) and by how long an
//! append may wait for space. Appends are thread-safe and may be called from
//! any fiber requesting a send; draining happens only on the reactor thread
//! that owns the connection.
//!
//! A failed append never corrupts the list: the segment is admitted in full
//! under the lock or not at all, so a partial frame can never be flushed.

use crate::error::{Error, Result};
use crate::tracing_compat::trace;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::io::{self, IoSlice, Write};
use std::time::{Duration, Instant};

/// Max iovec entries assembled per vectored write.
const MAX_IOVECS: usize = 64;

/// Result of one flush pass.
#[derive(Debug)]
pub enum FlushOutcome {
    /// Everything drained; write interest can be suppressed.
    Complete,
    /// The socket (or the quota) stopped us with data remaining; arm write
    /// interest and retry later.
    Pending,
    /// The peer closed: a write returned zero bytes.
    PeerClosed,
    /// Hard I/O error; the connection must be torn down.
    Failed(io::Error),
}

struct Segment {
    data: Bytes,
    offset: usize,
}

impl Segment {
    fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

#[derive(Default)]
struct Inner {
    segments: VecDeque<Segment>,
    bytes: usize,
    closed: bool,
}

/// Capacity- and timeout-bounded list of outbound byte segments.
pub struct WriteBufferList {
    capacity: usize,
    inner: Mutex<Inner>,
    space: Condvar,
}

impl WriteBufferList {
    /// Creates a list bounded to `capacity` total buffered bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
            space: Condvar::new(),
        }
    }

    /// Appends a message, waiting up to `timeout` for space.
    ///
    /// Returns `Ok(true)` when the message became the new head (the list was
    /// empty), which is the caller's cue to attempt an immediate flush. A
    /// message larger than the whole capacity is admitted only into an empty
    /// list. Fails with [`ErrorKind::Overload`](crate::ErrorKind::Overload)
    /// on timeout and [`ErrorKind::Network`](crate::ErrorKind::Network) once
    /// the list is closed.
    pub fn append(&self, data: Bytes, timeout: Duration) -> Result<bool> {
        if data.is_empty() {
            return Ok(false);
        }
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(Error::network("connection stopped accepting writes"));
            }
            let fits = inner.bytes + data.len() <= self.capacity || inner.bytes == 0;
            if fits {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::overload(format!(
                    "write buffer full ({} of {} bytes) for {}ms",
                    inner.bytes,
                    self.capacity,
                    timeout.as_millis()
                )));
            }
            // Timeout is re-checked at the top of the loop.
            let _ = self.space.wait_until(&mut inner, deadline);
        }
        let was_empty = inner.segments.is_empty();
        inner.bytes += data.len();
        inner.segments.push_back(Segment { data, offset: 0 });
        Ok(was_empty)
    }

    /// Refuses all future appends and wakes blocked appenders. Buffered
    /// segments remain drainable.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.space.notify_all();
    }

    /// Total buffered bytes.
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    /// True when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().segments.is_empty()
    }

    /// Drains up to `quota` bytes into `writer` with vectored writes,
    /// preserving submission order.
    pub fn flush_into<W: Write>(&self, writer: &mut W, quota: usize) -> FlushOutcome {
        let mut inner = self.inner.lock();
        let mut written_total = 0usize;

        while !inner.segments.is_empty() {
            if written_total >= quota {
                return FlushOutcome::Pending;
            }
            let budget = quota - written_total;
            // The iovec borrow of `segments` must end before `consume`
            // mutates them, so assemble and write inside this block.
            let wrote = {
                let mut slices: SmallVec<[IoSlice<'_>; 8]> = SmallVec::new();
                let mut assembled = 0usize;
                for segment in &inner.segments {
                    if assembled >= budget || slices.len() >= MAX_IOVECS {
                        break;
                    }
                    let take = segment.remaining().len().min(budget - assembled);
                    slices.push(IoSlice::new(&segment.remaining()[..take]));
                    assembled += take;
                }
                match writer.write_vectored(&slices) {
                    Ok(0) => return FlushOutcome::PeerClosed,
                    Ok(n) => n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return FlushOutcome::Pending;
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return FlushOutcome::Failed(err),
                }
            };
            written_total += wrote;
            self.consume(&mut inner, wrote);
            self.space.notify_all();
        }

        trace!(bytes = written_total, "write buffer drained");
        FlushOutcome::Complete
    }

    fn consume(&self, inner: &mut Inner, mut wrote: usize) {
        inner.bytes -= wrote;
        while wrote > 0 {
            let segment = inner
                .segments
                .front_mut()
                .expect("consumed more than buffered");
            let remaining = segment.data.len() - segment.offset;
            if wrote >= remaining {
                wrote -= remaining;
                inner.segments.pop_front();
            } else {
                segment.offset += wrote;
                wrote = 0;
            }
        }
    }
}

impl std::fmt::Debug for WriteBufferList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WriteBufferList")
            .field("bytes", &inner.bytes)
            .field("segments", &inner.segments.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;
    use std::thread;

    const NO_WAIT: Duration = Duration::from_millis(0);

    #[test]
    fn flush_preserves_submission_order() {
        let list = WriteBufferList::new(1024);
        assert!(list.append(Bytes::from_static(b"aa"), NO_WAIT).expect("append"));
        assert!(!list.append(Bytes::from_static(b"bb"), NO_WAIT).expect("append"));
        assert!(!list.append(Bytes::from_static(b"cc"), NO_WAIT).expect("append"));

        let mut sink = Vec::new();
        match list.flush_into(&mut sink, usize::MAX) {
            FlushOutcome::Complete => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(sink, b"aabbcc");
        assert!(list.is_empty());
    }

    #[test]
    fn quota_limits_one_pass() {
        let list = WriteBufferList::new(1024);
        list.append(Bytes::from_static(b"abcdef"), NO_WAIT).expect("append");

        let mut sink = Vec::new();
        match list.flush_into(&mut sink, 4) {
            FlushOutcome::Pending => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(sink, b"abcd");
        assert_eq!(list.len_bytes(), 2);

        match list.flush_into(&mut sink, 4) {
            FlushOutcome::Complete => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(sink, b"abcdef");
    }

    #[test]
    fn short_writes_rebuild_iovecs_each_pass() {
        // Writes at most 3 bytes per call, forcing a fresh slice assembly
        // after every partial consume.
        struct Trickle(Vec<u8>);
        impl Write for Trickle {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                let n = buf.len().min(3);
                self.0.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let list = WriteBufferList::new(1024);
        list.append(Bytes::from_static(b"abcde"), NO_WAIT).expect("append");
        list.append(Bytes::from_static(b"fghij"), NO_WAIT).expect("append");

        let mut sink = Trickle(Vec::new());
        match list.flush_into(&mut sink, usize::MAX) {
            FlushOutcome::Complete => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(sink.0, b"abcdefghij");
        assert!(list.is_empty());
        assert_eq!(list.len_bytes(), 0);
    }

    #[test]
    fn over_capacity_append_times_out_without_corruption() {
        let list = WriteBufferList::new(10);
        list.append(Bytes::from_static(b"12345678"), NO_WAIT)
            .expect("first append fits");

        let start = Instant::now();
        let err = list
            .append(Bytes::from_static(b"87654321"), Duration::from_millis(50))
            .expect_err("second append must time out");
        assert_eq!(err.kind(), ErrorKind::Overload);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(40), "waited {waited:?}");
        assert!(waited < Duration::from_millis(500), "waited {waited:?}");

        // The rejected message left no partial frame behind.
        assert_eq!(list.len_bytes(), 8);
        let mut sink = Vec::new();
        list.flush_into(&mut sink, usize::MAX);
        assert_eq!(sink, b"12345678");
    }

    #[test]
    fn blocked_append_proceeds_when_space_frees() {
        let list = Arc::new(WriteBufferList::new(10));
        list.append(Bytes::from_static(b"12345678"), NO_WAIT).expect("fits");

        let shared = Arc::clone(&list);
        let appender = thread::spawn(move || {
            shared.append(Bytes::from_static(b"ABCDEFGH"), Duration::from_secs(5))
        });

        thread::sleep(Duration::from_millis(20));
        let mut sink = Vec::new();
        list.flush_into(&mut sink, usize::MAX);

        let appended = appender.join().expect("join");
        assert!(appended.expect("append succeeds after flush"));
        assert_eq!(list.len_bytes(), 8);
    }

    #[test]
    fn oversized_message_admitted_only_into_empty_list() {
        let list = WriteBufferList::new(4);
        // Larger than the whole capacity, but the list is empty.
        assert!(list
            .append(Bytes::from_static(b"123456"), NO_WAIT)
            .expect("admitted"));
        let err = list
            .append(Bytes::from_static(b"x"), NO_WAIT)
            .expect_err("full");
        assert_eq!(err.kind(), ErrorKind::Overload);
    }

    #[test]
    fn append_after_close_fails_fast() {
        let list = WriteBufferList::new(16);
        list.close();
        let err = list
            .append(Bytes::from_static(b"data"), Duration::from_secs(1))
            .expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[test]
    fn close_wakes_blocked_appender() {
        let list = Arc::new(WriteBufferList::new(4));
        list.append(Bytes::from_static(b"1234"), NO_WAIT).expect("fits");

        let shared = Arc::clone(&list);
        let appender = thread::spawn(move || {
            shared.append(Bytes::from_static(b"5678"), Duration::from_secs(5))
        });

        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        list.close();
        let err = appender.join().expect("join").expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
