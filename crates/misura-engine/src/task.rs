//! The task: a background measurement with an event stream.
//!
//! A task wraps one measurement run in a single-producer/single-consumer
//! event pipeline. The background thread waits on the admission gate,
//! validates settings, instantiates the runnable and drives it through
//! the reactor; every callback the runnable makes is translated into an
//! event appended to a FIFO the consumer drains with
//! [`wait_for_next_event`].
//!
//! [`wait_for_next_event`]: Task::wait_for_next_event

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;

use serde_json::Value;

use misura_rt::{Error, Reactor, Result};

use crate::event::{performance_from_line, Event, EventType};
use crate::logger::{verbosity, Logger};
use crate::nettests::{self, RunnableContext, TaskType};
use crate::semaphore::{self, Semaphore};
use crate::settings;

struct TaskShared {
    queue: Mutex<VecDeque<Event>>,
    cond: Condvar,
    running: AtomicBool,
    interrupted: AtomicBool,
    reactor: Reactor,
}

impl TaskShared {
    /// Append an event and wake the consumer. Events are owned by the
    /// queue until dequeued.
    fn emit(&self, event: Event) {
        {
            let mut queue = self.queue.lock().unwrap();
            queue.push_back(event);
        }
        self.cond.notify_all();
    }
}

/// A running (or finished but not yet drained) measurement task.
pub struct Task {
    shared: Arc<TaskShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Task {
    /// Start a task gated by the process-global admission semaphore.
    pub fn start(settings: Value) -> Result<Task> {
        Task::start_with_semaphore(settings, semaphore::global())
    }

    /// Start a task gated by a caller-provided admission semaphore.
    pub fn start_with_semaphore(settings: Value, semaphore: Arc<Semaphore>) -> Result<Task> {
        let shared = Arc::new(TaskShared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            reactor: Reactor::new()?,
        });
        let thread_shared = Arc::clone(&shared);
        // One-shot barrier: the constructor returns only after the
        // thread has set `running`, so is_running() and interrupt() are
        // meaningful immediately.
        let (barrier_tx, barrier_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("misura-task".into())
            .spawn(move || {
                thread_shared.running.store(true, Ordering::SeqCst);
                let _ = barrier_tx.send(());
                thread_shared.emit(Event::queued());
                semaphore.acquire();
                if thread_shared.interrupted.load(Ordering::SeqCst) {
                    // Interrupted while queued: terminate the stream
                    // without running anything.
                    thread_shared.emit(Event::failure("interrupted"));
                    thread_shared.emit(Event::end());
                } else {
                    task_run(&thread_shared, settings);
                }
                thread_shared.running.store(false, Ordering::SeqCst);
                thread_shared.cond.notify_all();
                semaphore.release();
            })
            .map_err(Error::from_io)?;
        let _ = barrier_rx.recv();
        Ok(Task {
            shared,
            thread: Some(thread),
        })
    }

    /// Snapshot of the running flag.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Cooperatively stop the task. Idempotent and safe at any state:
    /// the reactor breaks out of dispatch and the flag short-circuits
    /// whatever has not started yet.
    pub fn interrupt(&self) {
        self.shared.interrupted.store(true, Ordering::SeqCst);
        self.shared.reactor.stop();
    }

    /// Block until an event is available or the task is done. Drains the
    /// queue before reporting end-of-stream (`None`), so no event is
    /// ever lost to a late-arriving completion.
    pub fn wait_for_next_event(&self) -> Option<Event> {
        let queue = self.shared.queue.lock().unwrap();
        let mut queue = self
            .cond()
            .wait_while(queue, |queue| {
                self.shared.running.load(Ordering::SeqCst) && queue.is_empty()
            })
            .unwrap();
        if let Some(event) = queue.pop_front() {
            return Some(event);
        }
        debug_assert!(!self.shared.running.load(Ordering::SeqCst));
        None
    }

    fn cond(&self) -> &Condvar {
        &self.shared.cond
    }
}

impl Drop for Task {
    /// Joins the background thread. Interrupt first (or drain the stream
    /// to end) if the task may still be running.
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The body of the task thread, entered with the admission gate held.
fn task_run(shared: &Arc<TaskShared>, settings_doc: Value) {
    // Settings-phase diagnostics go straight onto the queue: the logger
    // is not configured yet and these must not be maskable.
    let emit_warning = |message: &str| {
        shared.emit(Event::log(verbosity::WARNING, message));
    };
    let fail_settings = |message: &str| {
        emit_warning(message);
        shared.emit(Event::failure(&Error::Value.reason()));
        shared.emit(Event::end());
    };

    let settings = {
        let mut warn = |message: String| emit_warning(&message);
        match settings::validate(&settings_doc, &mut warn) {
            Ok(settings) => settings,
            Err(message) => {
                fail_settings(&message);
                return;
            }
        }
    };

    let Some(task_type) = TaskType::from_name(&settings.task_type) else {
        fail_settings(&format!(
            "unknown task type '{}' (fyi: known tasks are: {})",
            settings.task_type,
            nettests::known_tasks()
        ));
        return;
    };

    if settings.is_event_enabled(EventType::Started) {
        shared.emit(Event::started());
    }
    tracing::debug!(task = task_type.name(), "task starting");

    let logger = Arc::new(Logger::new());
    logger.set_verbosity(settings.verbosity);
    if let Some(path) = &settings.log_file {
        if logger.set_log_file(path).is_err() {
            emit_warning(&format!("cannot open log file '{}'", path.display()));
        }
    }

    // Route runnable callbacks into the event queue, honoring the
    // enabled-events mask.
    if settings.is_event_enabled(EventType::Log) {
        let sink = Arc::clone(shared);
        logger.on_log(move |level, line| {
            if level & !verbosity::MASK != 0 {
                return; // not a plain log line
            }
            sink.emit(Event::log(level, line));
        });
    }
    if settings.is_event_enabled(EventType::Performance) {
        let sink = Arc::clone(shared);
        logger.on_event(move |line| {
            if let Some(event) = performance_from_line(line) {
                sink.emit(event);
            }
        });
    }
    if settings.is_event_enabled(EventType::Progress) {
        let sink = Arc::clone(shared);
        logger.on_progress(move |percentage, message| {
            sink.emit(Event::progress(percentage, message));
        });
    }

    let mut ctx = RunnableContext::new(shared.reactor.clone(), Arc::clone(&logger));
    ctx.options = settings.options.clone();
    ctx.inputs = settings.inputs.clone();
    ctx.input_files = settings.input_files.clone();
    ctx.annotations = settings.annotations.clone();
    {
        let sink = Arc::clone(shared);
        let result_enabled = settings.is_event_enabled(EventType::Result);
        let submission_error_enabled =
            settings.is_event_enabled(EventType::ReportSubmissionError);
        let output_file = settings.output_file.clone();
        let report_logger = Arc::clone(&logger);
        ctx.set_on_entry(move |serialized| {
            if let Some(path) = &output_file {
                if append_line(path, serialized).is_err() {
                    report_logger.warn(&format!(
                        "cannot write report entry to '{}'",
                        path.display()
                    ));
                    if submission_error_enabled {
                        sink.emit(Event::report_submission_error(&Error::FileIo.reason()));
                    }
                }
            }
            if result_enabled {
                match serde_json::from_str(serialized) {
                    Ok(entry) => sink.emit(Event::result(entry)),
                    Err(_) => sink.emit(Event::result(Value::from(serialized))),
                }
            }
        });
    }
    if settings.is_event_enabled(EventType::MeasurementError) {
        let sink = Arc::clone(shared);
        ctx.set_on_measurement_error(move |reason, input| {
            sink.emit(Event::measurement_error(reason, input));
        });
    }

    let runnable = nettests::make_runnable(task_type, ctx);
    if settings.is_event_enabled(EventType::Configured) {
        shared.emit(Event::configured());
    }

    // Drive the runnable. The first error reported by either hook wins.
    let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    {
        let initial_shared = Arc::clone(shared);
        let initial_failure = Arc::clone(&failure);
        let begun = Arc::clone(&runnable);
        shared.reactor.run_with_initial_event(move || {
            if initial_shared.interrupted.load(Ordering::SeqCst) {
                return; // interrupted before the first event
            }
            let ender = Arc::clone(&begun);
            let end_failure = Arc::clone(&initial_failure);
            begun.begin(Box::new(move |result| {
                if let Err(err) = result {
                    record_failure(&initial_failure, err);
                }
                let done_failure = Arc::clone(&end_failure);
                ender.end(Box::new(move |result| {
                    if let Err(err) = result {
                        record_failure(&done_failure, err);
                    }
                }));
            }));
        });
    }
    drop(runnable);

    if shared.interrupted.load(Ordering::SeqCst) {
        shared.emit(Event::failure("interrupted"));
        shared.emit(Event::end());
        return;
    }
    if let Some(reason) = failure.lock().unwrap().take() {
        shared.emit(Event::failure(&reason));
    }
    shared.emit(Event::end());
    tracing::debug!(task = task_type.name(), "task finished");
}

fn record_failure(slot: &Arc<Mutex<Option<String>>>, err: Error) {
    let mut slot = slot.lock().unwrap();
    if slot.is_none() {
        *slot = Some(err.reason());
    }
}

fn append_line(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
