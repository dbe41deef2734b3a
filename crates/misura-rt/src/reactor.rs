//! The callback event loop.
//!
//! The reactor owns the OS poller, the timer heap, a worker thread for
//! blocking offload, and every datagram socket it created. Callbacks
//! scheduled through it run serialized on whichever thread calls [`run`],
//! in the order their triggering events fire.
//!
//! [`run`]: Reactor::run

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use polling::{Event, Events, Poller};
use slab::Slab;

use crate::datagram::{DatagramSocket, SocketShared};
use crate::error::{Error, Result};
use crate::sys::{Family, NetSys, OsNet};
use crate::worker::Worker;

pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;
pub(crate) type PollCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Bytes moved through reactor-owned sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataUsage {
    pub down: u64,
    pub up: u64,
}

/// Direction of a one-shot readiness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollDir {
    Read,
    Write,
}

/// An entry in the source slab: either a one-shot readiness poll or a
/// datagram socket subscribed for readable events.
pub(crate) enum Source {
    Oneshot {
        fd: RawFd,
        cb: Option<PollCallback>,
        timer: Option<u64>,
    },
    Datagram(Arc<SocketShared>),
}

enum TimerKind {
    Callback(Callback),
    /// Deadline of a one-shot readiness poll (slab key).
    PollDeadline(usize),
    /// Read deadline of a datagram socket (slab key).
    SocketDeadline(usize),
}

/// Timers ordered by `(deadline, id)` plus a reverse map for cancellation.
struct TimerState {
    heap: BTreeMap<(Instant, u64), TimerKind>,
    deadlines: HashMap<u64, Instant>,
    next_id: u64,
}

pub(crate) struct Inner {
    poller: Poller,
    /// Callbacks whose trigger has fired, drained in order by the loop.
    ready: ConcurrentQueue<Callback>,
    sources: Mutex<Slab<Source>>,
    timers: Mutex<TimerState>,
    /// Datagram sockets alive until their `close()`.
    sockets: Mutex<HashMap<usize, Arc<SocketShared>>>,
    /// Readiness subscriptions currently armed (one-shot polls plus
    /// resumed datagram sockets). Non-zero keeps the loop alive.
    interest: AtomicUsize,
    data_usage: Mutex<DataUsage>,
    worker: Worker,
    stop_requested: AtomicBool,
    pub(crate) sys: Arc<dyn NetSys>,
}

/// The event loop. Cheap to clone; all clones share the same loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

static INIT: Once = Once::new();

/// Process-wide once: writing to a disconnected peer must not kill us.
fn init_once() {
    INIT.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        Reactor::with_sys(Arc::new(OsNet))
    }

    /// Build a reactor whose datagram syscalls go through `sys`.
    pub fn with_sys(sys: Arc<dyn NetSys>) -> Result<Reactor> {
        init_once();
        let poller = Poller::new().map_err(Error::from_io)?;
        Ok(Reactor {
            inner: Arc::new(Inner {
                poller,
                ready: ConcurrentQueue::unbounded(),
                sources: Mutex::new(Slab::new()),
                timers: Mutex::new(TimerState {
                    heap: BTreeMap::new(),
                    deadlines: HashMap::new(),
                    next_id: 0,
                }),
                sockets: Mutex::new(HashMap::new()),
                interest: AtomicUsize::new(0),
                data_usage: Mutex::new(DataUsage::default()),
                worker: Worker::new(),
                stop_requested: AtomicBool::new(false),
                sys,
            }),
        })
    }

    // ── Event loop management ───────────────────────────────────────

    /// Dispatch events until there are no pending timers, no armed
    /// readiness subscriptions and no in-flight worker jobs, or until
    /// [`stop`](Reactor::stop) is called.
    pub fn run(&self) {
        self.inner.run();
    }

    /// Schedule `cb` as the first event, then [`run`](Reactor::run).
    pub fn run_with_initial_event(&self, cb: impl FnOnce() + Send + 'static) {
        self.call_soon(cb);
        self.run();
    }

    /// Break out of dispatch. Safe from any thread.
    pub fn stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.inner.notify();
    }

    // ── Deferred calls ──────────────────────────────────────────────

    /// Run `cb` on the reactor thread as soon as possible.
    pub fn call_soon(&self, cb: impl FnOnce() + Send + 'static) -> u64 {
        self.call_later(Duration::ZERO, cb)
    }

    /// Run `cb` on the reactor thread after `delay`. Returns a timer id
    /// accepted by [`cancel_timer`](Reactor::cancel_timer).
    pub fn call_later(&self, delay: Duration, cb: impl FnOnce() + Send + 'static) -> u64 {
        self.inner
            .add_timer(delay, TimerKind::Callback(Box::new(cb)))
    }

    /// Cancel a timer that has not fired yet. The callback is dropped.
    pub fn cancel_timer(&self, id: u64) {
        self.inner.cancel_timer(id);
    }

    /// Run `cb` on the worker thread.
    pub fn call_in_thread(&self, cb: impl FnOnce() + Send + 'static) {
        self.inner.worker.submit(cb);
    }

    // ── One-shot readiness ──────────────────────────────────────────

    /// Wait once for `fd` to become readable. The callback receives
    /// `Err(Error::Timeout)` if `timeout` expires first.
    pub fn pollin_once(
        &self,
        fd: RawFd,
        timeout: Duration,
        cb: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        self.inner
            .poll_once(fd, PollDir::Read, timeout, Box::new(cb));
    }

    /// Wait once for `fd` to become writable.
    pub fn pollout_once(
        &self,
        fd: RawFd,
        timeout: Duration,
        cb: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        self.inner
            .poll_once(fd, PollDir::Write, timeout, Box::new(cb));
    }

    // ── Datagram sockets ────────────────────────────────────────────

    /// Create a datagram socket owned by this reactor. The socket starts
    /// paused; call [`resume`](DatagramSocket::resume) to begin reading.
    pub fn make_datagram_socket(&self, family: Family) -> Result<DatagramSocket> {
        let fd = self.inner.sys.socket(family)?;
        let shared = {
            let mut sources = self.inner.sources.lock().unwrap();
            let entry = sources.vacant_entry();
            let key = entry.key();
            let shared = Arc::new(SocketShared::new(
                Arc::downgrade(&self.inner),
                key,
                fd,
                family,
            ));
            entry.insert(Source::Datagram(Arc::clone(&shared)));
            shared
        };
        self.inner
            .sockets
            .lock()
            .unwrap()
            .insert(shared.key(), Arc::clone(&shared));
        Ok(DatagramSocket::new(shared))
    }

    // ── Data usage ──────────────────────────────────────────────────

    /// Snapshot of the bytes moved through this reactor's sockets.
    pub fn data_usage(&self) -> DataUsage {
        *self.inner.data_usage.lock().unwrap()
    }
}

impl Inner {
    fn run(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
        let mut events = Events::new();
        loop {
            // Dispatch callbacks whose trigger already fired.
            loop {
                if self.stop_requested.load(Ordering::SeqCst) {
                    return;
                }
                match self.ready.pop() {
                    Ok(cb) => cb(),
                    Err(_) => break,
                }
            }
            if self.stop_requested.load(Ordering::SeqCst) {
                return;
            }

            let next_deadline = self.expire_timers();
            if !self.ready.is_empty() {
                continue;
            }

            let timers_pending = !self.timers.lock().unwrap().heap.is_empty();
            let pending = timers_pending || self.interest.load(Ordering::SeqCst) > 0;
            if !pending {
                // The poller went idle, but worker jobs are pending events
                // too: re-check every 250 ms until the worker drains.
                if self.worker.concurrency() > 0 {
                    self.add_timer(
                        Duration::from_millis(250),
                        TimerKind::Callback(Box::new(|| {})),
                    );
                    continue;
                }
                return;
            }

            let timeout = next_deadline.map(|d| d.saturating_duration_since(Instant::now()));
            events.clear();
            match self.poller.wait(&mut events, timeout) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::error!("reactor: poller wait failed: {err}");
                    return;
                }
            }

            let fired: Vec<usize> = events.iter().map(|ev| ev.key).collect();
            for key in fired {
                self.dispatch_readiness(key);
            }
        }
    }

    /// Turn a fired readiness event into a ready callback.
    fn dispatch_readiness(&self, key: usize) {
        let removed = {
            let mut sources = self.sources.lock().unwrap();
            match sources.get(key) {
                Some(Source::Oneshot { .. }) => Some(sources.remove(key)),
                Some(Source::Datagram(sock)) => {
                    let sock = Arc::clone(sock);
                    drop(sources);
                    let _ = self
                        .ready
                        .push(Box::new(move || sock.handle_readable()));
                    return;
                }
                None => None,
            }
        };
        if let Some(Source::Oneshot { fd, cb, timer }) = removed {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let _ = self.poller.delete(borrowed);
            self.interest.fetch_sub(1, Ordering::SeqCst);
            if let Some(id) = timer {
                self.cancel_timer(id);
            }
            if let Some(cb) = cb {
                let _ = self.ready.push(Box::new(move || cb(Ok(()))));
            }
        }
    }

    /// Fire expired timers; return the next pending deadline.
    fn expire_timers(&self) -> Option<Instant> {
        let now = Instant::now();
        let (expired, next) = {
            let mut timers = self.timers.lock().unwrap();
            let mut expired = Vec::new();
            loop {
                match timers.heap.keys().next().copied() {
                    Some((deadline, id)) if deadline <= now => {
                        let kind = timers.heap.remove(&(deadline, id)).unwrap();
                        timers.deadlines.remove(&id);
                        expired.push(kind);
                    }
                    other => break (expired, other.map(|(deadline, _)| deadline)),
                }
            }
        };
        for kind in expired {
            match kind {
                TimerKind::Callback(cb) => {
                    let _ = self.ready.push(cb);
                }
                TimerKind::PollDeadline(key) => {
                    let removed = {
                        let mut sources = self.sources.lock().unwrap();
                        match sources.get(key) {
                            Some(Source::Oneshot { .. }) => Some(sources.remove(key)),
                            _ => None,
                        }
                    };
                    if let Some(Source::Oneshot { fd, cb, .. }) = removed {
                        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                        let _ = self.poller.delete(borrowed);
                        self.interest.fetch_sub(1, Ordering::SeqCst);
                        if let Some(cb) = cb {
                            let _ = self.ready.push(Box::new(move || cb(Err(Error::Timeout))));
                        }
                    }
                }
                TimerKind::SocketDeadline(key) => {
                    let sock = {
                        let sources = self.sources.lock().unwrap();
                        match sources.get(key) {
                            Some(Source::Datagram(sock)) => Some(Arc::clone(sock)),
                            _ => None,
                        }
                    };
                    if let Some(sock) = sock {
                        let _ = self.ready.push(Box::new(move || sock.handle_timeout()));
                    }
                }
            }
        }
        next
    }

    fn poll_once(&self, fd: RawFd, dir: PollDir, timeout: Duration, cb: PollCallback) {
        let key = {
            let mut sources = self.sources.lock().unwrap();
            sources.insert(Source::Oneshot {
                fd,
                cb: Some(cb),
                timer: None,
            })
        };
        let interest = match dir {
            PollDir::Read => Event::readable(key),
            PollDir::Write => Event::writable(key),
        };
        if let Err(err) = unsafe { self.poller.add(fd, interest) } {
            let cb = {
                let mut sources = self.sources.lock().unwrap();
                match sources.try_remove(key) {
                    Some(Source::Oneshot { mut cb, .. }) => cb.take(),
                    _ => None,
                }
            };
            if let Some(cb) = cb {
                let reason = Error::from_io(err);
                let _ = self.ready.push(Box::new(move || cb(Err(reason))));
                self.notify();
            }
            return;
        }
        self.interest.fetch_add(1, Ordering::SeqCst);
        let timer = self.add_timer(timeout, TimerKind::PollDeadline(key));
        let mut sources = self.sources.lock().unwrap();
        if let Some(Source::Oneshot { timer: slot, .. }) = sources.get_mut(key) {
            *slot = Some(timer);
        }
        drop(sources);
        self.notify();
    }

    // ── Timer plumbing ──────────────────────────────────────────────

    fn add_timer(&self, delay: Duration, kind: TimerKind) -> u64 {
        let id = {
            let mut timers = self.timers.lock().unwrap();
            let id = timers.next_id;
            timers.next_id += 1;
            let deadline = Instant::now() + delay;
            timers.heap.insert((deadline, id), kind);
            timers.deadlines.insert(id, deadline);
            id
        };
        self.notify();
        id
    }

    pub(crate) fn cancel_timer(&self, id: u64) {
        let mut timers = self.timers.lock().unwrap();
        if let Some(deadline) = timers.deadlines.remove(&id) {
            timers.heap.remove(&(deadline, id));
        }
    }

    pub(crate) fn add_socket_deadline(&self, key: usize, delay: Duration) -> u64 {
        self.add_timer(delay, TimerKind::SocketDeadline(key))
    }

    // ── Datagram socket plumbing ────────────────────────────────────

    /// Arm (or re-arm) readable interest for a datagram socket.
    pub(crate) fn socket_subscribe(
        &self,
        key: usize,
        fd: BorrowedFd<'_>,
        registered: &mut bool,
        first: bool,
    ) -> Result<()> {
        let interest = Event::readable(key);
        if *registered {
            self.poller.modify(fd, interest).map_err(Error::from_io)?;
        } else {
            use std::os::unix::io::AsRawFd;
            unsafe { self.poller.add(fd.as_raw_fd(), interest) }.map_err(Error::from_io)?;
            *registered = true;
        }
        if first {
            self.interest.fetch_add(1, Ordering::SeqCst);
        }
        self.notify();
        Ok(())
    }

    /// Drop readable interest for a datagram socket.
    pub(crate) fn socket_unsubscribe(&self, key: usize, fd: BorrowedFd<'_>) -> Result<()> {
        self.poller
            .modify(fd, Event::none(key))
            .map_err(Error::from_io)?;
        self.interest.fetch_sub(1, Ordering::SeqCst);
        self.notify();
        Ok(())
    }

    /// Withdraw a closing socket's fd from the poller before the fd is
    /// released.
    pub(crate) fn socket_detach_poller(&self, fd: Option<BorrowedFd<'_>>, had_interest: bool) {
        if let Some(fd) = fd {
            let _ = self.poller.delete(fd);
        }
        if had_interest {
            self.interest.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Forget a closed socket. Idempotent.
    pub(crate) fn forget_socket(&self, key: usize) {
        {
            let mut sources = self.sources.lock().unwrap();
            if matches!(sources.get(key), Some(Source::Datagram(_))) {
                sources.remove(key);
            }
        }
        self.sockets.lock().unwrap().remove(&key);
        self.notify();
    }

    pub(crate) fn credit_down(&self, bytes: usize) {
        self.data_usage.lock().unwrap().down += bytes as u64;
    }

    pub(crate) fn credit_up(&self, bytes: usize) {
        self.data_usage.lock().unwrap().up += bytes as u64;
    }

    pub(crate) fn notify(&self) {
        let _ = self.poller.notify();
    }
}

// Used by DatagramSocket to reach its owner.
pub(crate) type WeakInner = Weak<Inner>;

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("interest", &self.inner.interest.load(Ordering::SeqCst))
            .field("worker_jobs", &self.inner.worker.concurrency())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn run_returns_immediately_when_idle() {
        let reactor = Reactor::new().unwrap();
        let start = Instant::now();
        reactor.run();
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn call_soon_runs_in_order() {
        let reactor = Reactor::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            reactor.call_soon(move || order.lock().unwrap().push(i));
        }
        reactor.run();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn call_later_respects_delay() {
        let reactor = Reactor::new().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        reactor.call_later(Duration::from_millis(50), move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        let start = Instant::now();
        reactor.run();
        assert!(fired.load(Ordering::SeqCst));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn cancel_timer_drops_the_callback() {
        let reactor = Reactor::new().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        let id = reactor.call_later(Duration::from_millis(50), move || {
            fired_clone.store(true, Ordering::SeqCst);
        });
        reactor.cancel_timer(id);
        reactor.run();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_breaks_out_of_dispatch() {
        let reactor = Reactor::new().unwrap();
        // Keep the loop alive far beyond the test horizon.
        reactor.call_later(Duration::from_secs(60), || {});
        let stopper = reactor.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stopper.stop();
        });
        let start = Instant::now();
        reactor.run();
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn run_waits_for_worker_jobs() {
        let reactor = Reactor::new().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let done_clone = Arc::clone(&done);
        reactor.call_in_thread(move || {
            thread::sleep(Duration::from_millis(500));
            done_clone.store(true, Ordering::SeqCst);
        });
        let start = Instant::now();
        reactor.run();
        // The loop itself had nothing to do, yet run() must not return
        // before the worker went quiet.
        assert!(done.load(Ordering::SeqCst));
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[test]
    fn pollin_once_times_out() {
        let reactor = Reactor::new().unwrap();
        let socket = reactor.make_datagram_socket(Family::V4).unwrap();
        socket.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let fd = socket.raw_fd().unwrap();
        let outcome = Arc::new(Mutex::new(None));
        let outcome_clone = Arc::clone(&outcome);
        reactor.pollin_once(fd, Duration::from_millis(50), move |res| {
            *outcome_clone.lock().unwrap() = Some(res);
        });
        reactor.run();
        let outcome = outcome.lock().unwrap().take().unwrap();
        assert!(matches!(outcome, Err(Error::Timeout)));
        socket.close().unwrap();
    }

    #[test]
    fn pollin_once_reports_readiness() {
        let reactor = Reactor::new().unwrap();
        let receiver = reactor.make_datagram_socket(Family::V4).unwrap();
        receiver.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let dest = receiver.local_addr().unwrap();
        let sender = reactor.make_datagram_socket(Family::V4).unwrap();
        sender.try_sendto(b"x", Some(&dest)).unwrap();

        let fd = receiver.raw_fd().unwrap();
        let outcome = Arc::new(Mutex::new(None));
        let outcome_clone = Arc::clone(&outcome);
        reactor.pollin_once(fd, Duration::from_secs(5), move |res| {
            *outcome_clone.lock().unwrap() = Some(res);
        });
        reactor.run();
        let outcome = outcome.lock().unwrap().take().unwrap();
        assert!(outcome.is_ok());
        receiver.close().unwrap();
        sender.close().unwrap();
    }

    #[test]
    fn pollout_once_reports_writability() {
        let reactor = Reactor::new().unwrap();
        let socket = reactor.make_datagram_socket(Family::V4).unwrap();
        socket.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let fd = socket.raw_fd().unwrap();
        let outcome = Arc::new(Mutex::new(None));
        let outcome_clone = Arc::clone(&outcome);
        // A fresh UDP socket is writable right away.
        reactor.pollout_once(fd, Duration::from_secs(5), move |res| {
            *outcome_clone.lock().unwrap() = Some(res);
        });
        reactor.run();
        let outcome = outcome.lock().unwrap().take().unwrap();
        assert!(outcome.is_ok());
        socket.close().unwrap();
    }

    #[test]
    fn data_usage_counts_sent_bytes() {
        let reactor = Reactor::new().unwrap();
        let receiver = reactor.make_datagram_socket(Family::V4).unwrap();
        receiver.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let dest = receiver.local_addr().unwrap();
        let sender = reactor.make_datagram_socket(Family::V4).unwrap();
        sender.try_sendto(b"ping", Some(&dest)).unwrap();
        assert_eq!(reactor.data_usage().up, 4);
        receiver.close().unwrap();
        sender.close().unwrap();
    }

    #[test]
    fn call_soon_order_interleaved_with_timers() {
        let reactor = Reactor::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = Arc::clone(&order);
            reactor.call_later(Duration::from_millis(30), move || {
                order.lock().unwrap().push("late");
            });
        }
        {
            let order = Arc::clone(&order);
            reactor.call_soon(move || order.lock().unwrap().push("soon"));
        }
        reactor.run();
        assert_eq!(*order.lock().unwrap(), vec!["soon", "late"]);
    }
}
