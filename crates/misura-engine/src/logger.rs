//! The measurement logger.
//!
//! Runnables talk to the outside world through a [`Logger`]: plain log
//! lines gated by a verbosity level, structured JSON event lines, and
//! progress samples. The task installs callbacks on each channel and turns
//! them into `LOG`, `PERFORMANCE` and `PROGRESS` events.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use misura_rt::{Error, Result};

/// Verbosity levels and the flag bits a log level can carry.
pub mod verbosity {
    pub const QUIET: u32 = 0;
    pub const WARNING: u32 = 1;
    pub const INFO: u32 = 2;
    pub const DEBUG: u32 = 3;
    pub const DEBUG2: u32 = 4;

    /// Bits of a level that encode plain-log severity.
    pub const MASK: u32 = 31;

    /// Flag marking a structured JSON event line rather than a log line.
    pub const EVENT: u32 = 32;

    pub const NAMES: [(&str, u32); 5] = [
        ("QUIET", QUIET),
        ("WARNING", WARNING),
        ("INFO", INFO),
        ("DEBUG", DEBUG),
        ("DEBUG2", DEBUG2),
    ];

    pub fn from_name(name: &str) -> Option<u32> {
        NAMES
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, level)| *level)
    }

    pub fn name(level: u32) -> Option<&'static str> {
        NAMES
            .iter()
            .find(|(_, candidate)| *candidate == level)
            .map(|(name, _)| *name)
    }
}

type LogFn = Box<dyn Fn(u32, &str) + Send + Sync>;
type EventFn = Box<dyn Fn(&str) + Send + Sync>;
type ProgressFn = Box<dyn Fn(f64, &str) + Send + Sync>;

#[derive(Default)]
struct Sinks {
    log_cb: Option<LogFn>,
    event_cb: Option<EventFn>,
    progress_cb: Option<ProgressFn>,
    file: Option<File>,
}

pub struct Logger {
    level: AtomicU32,
    sinks: Mutex<Sinks>,
}

impl Logger {
    pub fn new() -> Logger {
        Logger {
            level: AtomicU32::new(verbosity::QUIET),
            sinks: Mutex::new(Sinks::default()),
        }
    }

    pub fn set_verbosity(&self, level: u32) {
        self.level.store(level & verbosity::MASK, Ordering::SeqCst);
    }

    pub fn verbosity(&self) -> u32 {
        self.level.load(Ordering::SeqCst)
    }

    /// Install the plain-log callback, replacing any previous one.
    pub fn on_log(&self, cb: impl Fn(u32, &str) + Send + Sync + 'static) {
        self.sinks.lock().unwrap().log_cb = Some(Box::new(cb));
    }

    /// Install the structured-event callback, replacing any previous one.
    pub fn on_event(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        self.sinks.lock().unwrap().event_cb = Some(Box::new(cb));
    }

    /// Install the progress callback, replacing any previous one.
    pub fn on_progress(&self, cb: impl Fn(f64, &str) + Send + Sync + 'static) {
        self.sinks.lock().unwrap().progress_cb = Some(Box::new(cb));
    }

    /// Append log lines to `path` from now on.
    pub fn set_log_file(&self, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|_| Error::FileIo)?;
        self.sinks.lock().unwrap().file = Some(file);
        Ok(())
    }

    /// Emit a log line at `level`. Lines carrying the event flag route to
    /// the structured-event callback; plain lines are dropped unless the
    /// severity is within the configured verbosity.
    pub fn log(&self, level: u32, message: &str) {
        if level & verbosity::EVENT != 0 {
            let sinks = self.sinks.lock().unwrap();
            if let Some(cb) = &sinks.event_cb {
                cb(message);
            }
            return;
        }
        let severity = level & verbosity::MASK;
        if severity == verbosity::QUIET || severity > self.verbosity() {
            return;
        }
        let mut sinks = self.sinks.lock().unwrap();
        if let Some(file) = &mut sinks.file {
            let name = verbosity::name(severity).unwrap_or("WARNING");
            let _ = writeln!(file, "[{name}] {message}");
        }
        if let Some(cb) = &sinks.log_cb {
            cb(severity, message);
        }
    }

    pub fn warn(&self, message: &str) {
        self.log(verbosity::WARNING, message);
    }

    pub fn info(&self, message: &str) {
        self.log(verbosity::INFO, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(verbosity::DEBUG, message);
    }

    /// Emit a structured JSON event line.
    pub fn emit_event(&self, doc: &serde_json::Value) {
        self.log(verbosity::EVENT | verbosity::INFO, &doc.to_string());
    }

    /// Report progress in `[0.0, 1.0]`.
    pub fn progress(&self, percentage: f64, message: &str) {
        let sinks = self.sinks.lock().unwrap();
        if let Some(cb) = &sinks.progress_cb {
            cb(percentage, message);
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new()
    }
}
