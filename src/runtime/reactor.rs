//! Per-worker event loop: readiness multiplexer, task queues, timer queue.
//!
//! One [`Reactor`] runs on each worker thread. It owns a [`polling::Poller`]
//! (epoll on Linux), two bounded task queues split by [`TaskPriority`], and a
//! [`TimerQueue`]. Each loop iteration drains a bounded number of tasks, waits
//! for readiness with a timeout derived from the next timer deadline, then
//! dispatches I/O callbacks and expired timers.
//!
//! # Registration model
//!
//! The reactor holds only *non-owning* (`Weak`) references to its event
//! handlers: a connection is owned by its connector, and a dead registration
//! is dropped the next time its fd surfaces. The poller operates in oneshot
//! mode — after an event is delivered the reactor re-arms the handler's
//! current interest with `modify`, so handlers that change interest inside
//! `handle_event` (handshake drivers, write-completion) get the right arming
//! without an extra syscall from their side.
//!
//! # Cross-thread submission
//!
//! [`Reactor::submit`] may be called from any thread. When the loop is
//! blocked in `wait`, an `is_polling` flag tells the submitter to interrupt
//! it via [`polling::Poller::notify`]; when the loop is already spinning the
//! wake syscall is skipped.

use crate::config::ReactorConfig;
use crate::runtime::timer::TimerQueue;
use crate::tracing_compat::{debug, trace, warn};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use polling::{Event, Poller};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Readiness interest for a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    /// Interested in readability.
    pub readable: bool,
    /// Interested in writability.
    pub writable: bool,
}

impl Interest {
    /// Interest in readability only.
    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
    };
    /// Interest in writability only.
    pub const WRITABLE: Self = Self {
        readable: false,
        writable: true,
    };
    /// Interest in both directions.
    pub const BOTH: Self = Self {
        readable: true,
        writable: true,
    };
    /// No interest; the registration stays but delivers nothing.
    pub const NONE: Self = Self {
        readable: false,
        writable: false,
    };

    fn to_event(self, key: usize) -> Event {
        match (self.readable, self.writable) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }
}

/// A socket-backed participant in the reactor loop.
///
/// Implementations must be cheap to query: `fd` and `interest` are called on
/// every re-arm. `handle_event` runs on the reactor thread and must not
/// block.
pub trait EventHandler: Send + Sync {
    /// The registered file descriptor.
    fn fd(&self) -> RawFd;
    /// The interest the reactor should (re-)arm for this handler.
    fn interest(&self) -> Interest;
    /// Called when the fd is ready. At least one of the flags is true.
    fn handle_event(&self, readable: bool, writable: bool);
}

/// Priority class of a deferred task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    /// Affinity-sensitive work that must run on this reactor's thread.
    Pinned,
    /// Fan-out work a host may load-balance across workers.
    Parallel,
}

type ReactorTask = Box<dyn FnOnce() + Send>;

/// An epoll-driven event loop with task and timer queues.
pub struct Reactor {
    poller: Poller,
    pinned: ArrayQueue<ReactorTask>,
    parallel: ArrayQueue<ReactorTask>,
    handlers: Mutex<HashMap<usize, Weak<dyn EventHandler>>>,
    timer: Arc<TimerQueue>,
    is_polling: AtomicBool,
    cfg: ReactorConfig,
}

impl Reactor {
    /// Creates a reactor with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying poller (epoll fd) cannot be
    /// created.
    pub fn new(cfg: ReactorConfig) -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            pinned: ArrayQueue::new(cfg.task_queue_capacity),
            parallel: ArrayQueue::new(cfg.task_queue_capacity),
            handlers: Mutex::new(HashMap::new()),
            timer: Arc::new(TimerQueue::new()),
            is_polling: AtomicBool::new(false),
            cfg,
        })
    }

    /// The reactor's timer queue, polled once per loop iteration.
    #[must_use]
    pub fn timer(&self) -> &Arc<TimerQueue> {
        &self.timer
    }

    /// Submits a deferred task from any thread.
    ///
    /// Returns false when the queue for the given priority is full; the task
    /// is handed back to the caller inside the queue's rejection, never
    /// silently dropped.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static, priority: TaskPriority) -> bool {
        let queue = match priority {
            TaskPriority::Pinned => &self.pinned,
            TaskPriority::Parallel => &self.parallel,
        };
        if queue.push(Box::new(task)).is_err() {
            return false;
        }
        // Wake only a loop that is actually blocked in wait().
        if self.is_polling.load(Ordering::Acquire) {
            let _ = self.poller.notify();
        }
        true
    }

    /// Registers a handler, or re-arms its interest if already registered.
    ///
    /// Registration errors are fatal to the handler: on failure the caller
    /// should tear the connection down.
    pub fn update(&self, handler: &Arc<dyn EventHandler>) -> io::Result<()> {
        let fd = handler.fd();
        let key = fd as usize;
        let event = handler.interest().to_event(key);
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(&key) {
            self.poller.modify(fd, event)?;
        } else {
            self.poller.add(fd, event)?;
            handlers.insert(key, Arc::downgrade(handler));
        }
        Ok(())
    }

    /// Deregisters a file descriptor. Idempotent; safe from any thread.
    pub fn remove(&self, fd: RawFd) {
        let existed = self.handlers.lock().remove(&(fd as usize)).is_some();
        if existed {
            if let Err(err) = self.poller.delete(fd) {
                debug!(fd, %err, "poller delete failed during deregistration");
            }
        }
    }

    /// Interrupts a blocking poll from another thread.
    pub fn wake(&self) -> io::Result<()> {
        self.poller.notify()
    }

    fn has_pending_tasks(&self) -> bool {
        !self.pinned.is_empty() || !self.parallel.is_empty()
    }

    /// Drains up to `cap` tasks, pinned queue first.
    fn drain_tasks(&self, cap: usize) -> usize {
        let mut ran = 0;
        while ran < cap {
            let Some(task) = self.pinned.pop().or_else(|| self.parallel.pop()) else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }

    fn poll_timeout(&self) -> Duration {
        if self.has_pending_tasks() {
            return Duration::ZERO;
        }
        let ceiling = Duration::from_millis(self.cfg.poll_ceiling_ms);
        self.timer.next_deadline().map_or(ceiling, |deadline| {
            ceiling.min(deadline.saturating_duration_since(Instant::now()))
        })
    }

    /// Runs the event loop until `stop` becomes true.
    ///
    /// Call on the thread that owns this reactor; everything dispatched here
    /// (I/O callbacks, tasks, timers) runs on that thread.
    pub fn run(&self, stop: &AtomicBool) {
        let mut events: Vec<Event> = Vec::with_capacity(self.cfg.max_events);
        while !stop.load(Ordering::Acquire) {
            self.drain_tasks(self.cfg.tasks_per_poll);

            events.clear();
            let timeout = self.poll_timeout();
            self.is_polling.store(true, Ordering::Release);
            let waited = self.poller.wait(&mut events, Some(timeout));
            self.is_polling.store(false, Ordering::Release);

            match waited {
                Ok(n) => trace!(events = n, "reactor woke"),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(%err, "reactor poll failed");
                }
            }

            for event in events.drain(..) {
                self.dispatch_event(event);
            }

            self.timer.run_expired(Instant::now());
        }
    }

    fn dispatch_event(&self, event: Event) {
        let weak = self.handlers.lock().get(&event.key).cloned();
        let Some(handler) = weak.and_then(|w| w.upgrade()) else {
            // Owner dropped the handler without deregistering.
            self.remove(event.key as RawFd);
            return;
        };

        // Run the callback outside the handler-table lock; it may deregister
        // itself (teardown) or change its interest.
        handler.handle_event(event.readable, event.writable);

        // Oneshot semantics: re-arm the current interest unless the handler
        // deregistered during the callback.
        if self.handlers.lock().contains_key(&event.key) {
            let fd = handler.fd();
            let rearmed = self.poller.modify(fd, handler.interest().to_event(event.key));
            if let Err(err) = rearmed {
                debug!(fd, %err, "re-arm failed, dropping registration");
                self.remove(fd);
            }
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("registrations", &self.handlers.lock().len())
            .field("pinned_tasks", &self.pinned.len())
            .field("parallel_tasks", &self.parallel.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn small_reactor() -> Arc<Reactor> {
        Arc::new(Reactor::new(ReactorConfig::default()).expect("create reactor"))
    }

    struct ReadFlag {
        fd: RawFd,
        hits: AtomicUsize,
    }

    impl EventHandler for ReadFlag {
        fn fd(&self) -> RawFd {
            self.fd
        }
        fn interest(&self) -> Interest {
            Interest::READABLE
        }
        fn handle_event(&self, readable: bool, _writable: bool) {
            if readable {
                self.hits.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn submit_runs_on_reactor_thread() {
        let reactor = small_reactor();
        let stop = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&reactor);
        let s = Arc::clone(&stop);
        let loop_thread = thread::spawn(move || r.run(&s));

        for _ in 0..10 {
            let counter = Arc::clone(&ran);
            assert!(reactor.submit(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                TaskPriority::Pinned
            ));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while ran.load(Ordering::SeqCst) < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 10);

        stop.store(true, Ordering::Release);
        reactor.wake().expect("wake");
        loop_thread.join().expect("join");
    }

    #[test]
    fn full_task_queue_rejects_submission() {
        let cfg = ReactorConfig {
            task_queue_capacity: 2,
            ..ReactorConfig::default()
        };
        let reactor = Reactor::new(cfg).expect("create reactor");

        assert!(reactor.submit(|| {}, TaskPriority::Parallel));
        assert!(reactor.submit(|| {}, TaskPriority::Parallel));
        assert!(
            !reactor.submit(|| {}, TaskPriority::Parallel),
            "third submission must be rejected, not dropped"
        );
        // The other priority class has its own queue.
        assert!(reactor.submit(|| {}, TaskPriority::Pinned));
    }

    #[test]
    fn readiness_event_reaches_handler() {
        let reactor = small_reactor();
        let (mut tx, rx) = UnixStream::pair().expect("socketpair");
        rx.set_nonblocking(true).expect("nonblocking");

        let handler = Arc::new(ReadFlag {
            fd: rx.as_raw_fd(),
            hits: AtomicUsize::new(0),
        });
        let dyn_handler: Arc<dyn EventHandler> = handler.clone();
        reactor.update(&dyn_handler).expect("register");

        let stop = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&reactor);
        let s = Arc::clone(&stop);
        let loop_thread = thread::spawn(move || r.run(&s));

        tx.write_all(b"ping").expect("write");

        let deadline = Instant::now() + Duration::from_secs(2);
        while handler.hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(handler.hits.load(Ordering::SeqCst) >= 1);

        reactor.remove(rx.as_raw_fd());
        stop.store(true, Ordering::Release);
        reactor.wake().expect("wake");
        loop_thread.join().expect("join");
    }

    #[test]
    fn timer_fires_inside_loop() {
        let reactor = small_reactor();
        let stop = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&fired);
        reactor.timer().add_after(10, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let r = Arc::clone(&reactor);
        let s = Arc::clone(&stop);
        let loop_thread = thread::spawn(move || r.run(&s));

        let deadline = Instant::now() + Duration::from_secs(2);
        while fired.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.timer().size(), 0);

        stop.store(true, Ordering::Release);
        reactor.wake().expect("wake");
        loop_thread.join().expect("join");
    }

    #[test]
    fn dead_registration_is_collected() {
        let reactor = small_reactor();
        let (mut tx, rx) = UnixStream::pair().expect("socketpair");
        rx.set_nonblocking(true).expect("nonblocking");

        let handler = Arc::new(ReadFlag {
            fd: rx.as_raw_fd(),
            hits: AtomicUsize::new(0),
        });
        let dyn_handler: Arc<dyn EventHandler> = handler.clone();
        reactor.update(&dyn_handler).expect("register");
        drop(handler);
        drop(dyn_handler);

        let stop = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&reactor);
        let s = Arc::clone(&stop);
        let loop_thread = thread::spawn(move || r.run(&s));

        tx.write_all(b"ping").expect("write");

        let deadline = Instant::now() + Duration::from_secs(2);
        while reactor.handlers.lock().len() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(reactor.handlers.lock().len(), 0);

        stop.store(true, Ordering::Release);
        reactor.wake().expect("wake");
        loop_thread.join().expect("join");
    }
}
