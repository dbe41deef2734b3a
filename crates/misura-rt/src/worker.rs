//! Background job thread.
//!
//! A single consumer thread drains a FIFO of boxed jobs. The reactor uses it
//! to offload blocking work (file reads, name resolution) and consults
//! [`Worker::concurrency`] to decide when its loop may quiesce.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

struct State {
    jobs: VecDeque<Job>,
    /// Whether the thread is currently running a job outside the lock.
    busy: bool,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    interrupted: AtomicBool,
}

/// A worker thread executing submitted jobs in FIFO order.
///
/// A job that panics unwinds the worker thread and is treated as a fatal
/// library bug; jobs are never silently swallowed.
pub struct Worker {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                jobs: VecDeque::new(),
                busy: false,
            }),
            cond: Condvar::new(),
            interrupted: AtomicBool::new(false),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("misura-worker".into())
            .spawn(move || worker_loop(&thread_shared))
            .expect("failed to spawn worker thread");
        Worker {
            shared,
            thread: Some(thread),
        }
    }

    /// Enqueue a job. Never blocks beyond the queue mutex.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.jobs.push_back(Box::new(job));
        }
        self.shared.cond.notify_one();
    }

    /// Signal the thread to exit at the next wakeup.
    pub fn interrupt(&self) {
        self.shared.interrupted.store(true, Ordering::SeqCst);
        self.shared.cond.notify_one();
    }

    /// Snapshot of the pending job count.
    pub fn queue_size(&self) -> usize {
        self.shared.state.lock().unwrap().jobs.len()
    }

    /// Queued plus currently-running jobs. The reactor treats a non-zero
    /// value like a pending event when deciding whether to quiesce.
    pub fn concurrency(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.jobs.len() + usize::from(state.busy)
    }
}

impl Default for Worker {
    fn default() -> Self {
        Worker::new()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.interrupt();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            // The 250 ms deadline bounds how late an interrupt can be noticed
            // should a notification be missed.
            let (guard, _timeout) = shared
                .cond
                .wait_timeout_while(state, Duration::from_millis(250), |s| {
                    !shared.interrupted.load(Ordering::SeqCst) && s.jobs.is_empty()
                })
                .unwrap();
            state = guard;
            if shared.interrupted.load(Ordering::SeqCst) {
                return;
            }
            match state.jobs.pop_front() {
                Some(job) => {
                    state.busy = true;
                    job
                }
                None => continue,
            }
        };
        // Runs unlocked; the job shares no state with the queue.
        job();
        shared.state.lock().unwrap().busy = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn runs_jobs_in_submission_order() {
        let worker = Worker::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            let order = Arc::clone(&order);
            worker.submit(move || order.lock().unwrap().push(i));
        }
        worker.submit(move || tx.send(()).unwrap());
        // If the final job never runs we hang here, which fails the test.
        rx.recv().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn interrupt_prevents_later_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new();

        {
            let counter = Arc::clone(&counter);
            worker.submit(move || {
                // Long enough that interrupt() lands before the next job.
                thread::sleep(Duration::from_secs(1));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        worker.submit(|| panic!("should_not_happen"));

        // Let the thread pick up the first job.
        thread::sleep(Duration::from_millis(250));
        worker.interrupt();

        while counter.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(250));
        }
    }

    #[test]
    fn drop_interrupts_and_joins() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let worker = Worker::new();
            let counter = Arc::clone(&counter);
            worker.submit(move || {
                thread::sleep(Duration::from_secs(1));
                counter.fetch_add(1, Ordering::SeqCst);
            });
            worker.submit(|| panic!("should_not_happen"));
            thread::sleep(Duration::from_millis(250));
        }
        while counter.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(250));
        }
    }

    #[test]
    fn concurrency_counts_running_and_queued() {
        let worker = Worker::new();
        let (start_tx, start_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        worker.submit(move || {
            start_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        start_rx.recv().unwrap();
        worker.submit(|| {});
        assert_eq!(worker.concurrency(), 2);
        assert_eq!(worker.queue_size(), 1);
        release_tx.send(()).unwrap();
    }
}
