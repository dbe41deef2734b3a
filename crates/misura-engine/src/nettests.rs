//! Task types and the runnable lifecycle.
//!
//! The engine drives a measurement through the [`Runnable`] continuation
//! protocol: `begin(done)` starts it, `end(done)` finalizes it, and each
//! hook invokes its continuation exactly once. Measurement protocol logic
//! lives outside the engine; what the registry provides is the shared
//! lifecycle every task type runs through: configuration, input planning,
//! progress reporting and report-entry emission, all scheduled on the
//! reactor.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};

use misura_rt::{Error, Reactor, Result};

use crate::logger::Logger;
use crate::settings::{OptionValue, Options};

/// Continuation passed to [`Runnable::begin`] and [`Runnable::end`].
pub type Done = Box<dyn FnOnce(Result<()>) + Send + 'static>;

type EntryFn = Box<dyn Fn(&str) + Send + Sync>;
type MeasurementErrorFn = Box<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// The canonical task-type set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Dash,
    CaptivePortal,
    DnsInjection,
    FacebookMessenger,
    HttpHeaderFieldManipulation,
    HttpInvalidRequestLine,
    MeekFrontedRequests,
    MultiNdt,
    Ndt,
    TcpConnect,
    Telegram,
    WebConnectivity,
    Whatsapp,
}

impl TaskType {
    pub const ALL: [TaskType; 13] = [
        TaskType::Dash,
        TaskType::CaptivePortal,
        TaskType::DnsInjection,
        TaskType::FacebookMessenger,
        TaskType::HttpHeaderFieldManipulation,
        TaskType::HttpInvalidRequestLine,
        TaskType::MeekFrontedRequests,
        TaskType::MultiNdt,
        TaskType::Ndt,
        TaskType::TcpConnect,
        TaskType::Telegram,
        TaskType::WebConnectivity,
        TaskType::Whatsapp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TaskType::Dash => "DASH",
            TaskType::CaptivePortal => "CAPTIVE_PORTAL",
            TaskType::DnsInjection => "DNS_INJECTION",
            TaskType::FacebookMessenger => "FACEBOOK_MESSENGER",
            TaskType::HttpHeaderFieldManipulation => "HTTP_HEADER_FIELD_MANIPULATION",
            TaskType::HttpInvalidRequestLine => "HTTP_INVALID_REQUEST_LINE",
            TaskType::MeekFrontedRequests => "MEEK_FRONTED_REQUESTS",
            TaskType::MultiNdt => "MULTI_NDT",
            TaskType::Ndt => "NDT",
            TaskType::TcpConnect => "TCP_CONNECT",
            TaskType::Telegram => "TELEGRAM",
            TaskType::WebConnectivity => "WEB_CONNECTIVITY",
            TaskType::Whatsapp => "WHATSAPP",
        }
    }

    pub fn from_name(name: &str) -> Option<TaskType> {
        TaskType::ALL.iter().copied().find(|ty| ty.name() == name)
    }

    /// Whether this measurement is meaningless without inputs.
    pub fn needs_input(self) -> bool {
        matches!(
            self,
            TaskType::DnsInjection | TaskType::TcpConnect | TaskType::WebConnectivity
        )
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// JSON list of the known task types, for diagnostics.
pub(crate) fn known_tasks() -> String {
    let names: Vec<&str> = TaskType::ALL.iter().map(|ty| ty.name()).collect();
    serde_json::to_string(&names).expect("static data")
}

/// One measurement, driven by the task through `begin`/`end`.
pub trait Runnable: Send + Sync + 'static {
    fn begin(self: Arc<Self>, done: Done);
    fn end(self: Arc<Self>, done: Done);
}

/// Everything a runnable needs from its task.
pub struct RunnableContext {
    pub reactor: Reactor,
    pub logger: Arc<Logger>,
    pub options: Options,
    pub inputs: Vec<String>,
    pub input_files: Vec<String>,
    pub annotations: Map<String, Value>,
    /// Invoked once per serialized report entry.
    pub on_entry: Option<EntryFn>,
    /// Invoked when one measurement fails without failing the task.
    pub on_measurement_error: Option<MeasurementErrorFn>,
}

impl RunnableContext {
    pub fn new(reactor: Reactor, logger: Arc<Logger>) -> RunnableContext {
        RunnableContext {
            reactor,
            logger,
            options: Options::new(),
            inputs: Vec::new(),
            input_files: Vec::new(),
            annotations: Map::new(),
            on_entry: None,
            on_measurement_error: None,
        }
    }

    pub fn set_on_entry(&mut self, cb: impl Fn(&str) + Send + Sync + 'static) {
        self.on_entry = Some(Box::new(cb));
    }

    pub fn set_on_measurement_error(
        &mut self,
        cb: impl Fn(&str, Option<&str>) + Send + Sync + 'static,
    ) {
        self.on_measurement_error = Some(Box::new(cb));
    }
}

/// Instantiate the runnable for a task type.
pub fn make_runnable(ty: TaskType, ctx: RunnableContext) -> Arc<dyn Runnable> {
    Arc::new(ProbeRunnable::new(ty, ctx))
}

const TEST_VERSION: &str = "0.1.0";

/// The lifecycle shared by every task type: plan inputs (loading input
/// files on the worker thread), then measure them one at a time on the
/// reactor, reporting progress and one entry per input.
pub struct ProbeRunnable {
    ty: TaskType,
    ctx: RunnableContext,
    aborted: AtomicBool,
    watchdog: Mutex<Option<u64>>,
}

impl ProbeRunnable {
    fn new(ty: TaskType, ctx: RunnableContext) -> ProbeRunnable {
        ProbeRunnable {
            ty,
            ctx,
            aborted: AtomicBool::new(false),
            watchdog: Mutex::new(None),
        }
    }

    /// Arm the `max_runtime` watchdog, when configured.
    fn arm_watchdog(this: &Arc<Self>) {
        let max_runtime = this
            .ctx
            .options
            .get("max_runtime")
            .and_then(OptionValue::as_float);
        let Some(max_runtime) = max_runtime else {
            return;
        };
        if !max_runtime.is_finite() || max_runtime < 0.0 {
            this.ctx.logger.warn("ignoring negative max_runtime");
            return;
        }
        let weak = Arc::downgrade(this);
        let id = this
            .ctx
            .reactor
            .call_later(Duration::from_secs_f64(max_runtime), move || {
                if let Some(this) = weak.upgrade() {
                    this.ctx
                        .logger
                        .warn("maximum runtime exceeded, stopping early");
                    this.aborted.store(true, Ordering::SeqCst);
                }
            });
        *this.watchdog.lock().unwrap() = Some(id);
    }

    fn plan_inputs(&self, extra: Vec<String>) -> Vec<Option<String>> {
        let mut inputs: Vec<Option<String>> =
            self.ctx.inputs.iter().cloned().map(Some).collect();
        inputs.extend(extra.into_iter().map(Some));
        if inputs.is_empty() {
            inputs.push(None);
        }
        inputs
    }

    fn entry_for(&self, input: Option<&str>) -> Value {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        json!({
            "annotations": &self.ctx.annotations,
            "input": input,
            "measurement_start_time": start_time,
            "test_name": self.ty.name(),
            "test_version": TEST_VERSION,
        })
    }

    fn step(this: Arc<Self>, inputs: Vec<Option<String>>, idx: usize, done: Done) {
        if idx >= inputs.len() || this.aborted.load(Ordering::SeqCst) {
            this.ctx.logger.progress(1.0, "measurements done");
            done(Ok(()));
            return;
        }
        let total = inputs.len();
        let input = inputs[idx].clone();
        let message = match &input {
            Some(input) => format!("measuring {input}"),
            None => "measuring".to_string(),
        };
        this.ctx.logger.progress(idx as f64 / total as f64, &message);
        this.ctx.logger.debug(&message);
        let entry = this.entry_for(input.as_deref());
        if let Some(cb) = &this.ctx.on_entry {
            cb(&entry.to_string());
        }
        let weak = Arc::downgrade(&this);
        this.ctx.reactor.call_soon(move || {
            if let Some(this) = weak.upgrade() {
                Self::step(this, inputs, idx + 1, done);
            }
        });
    }
}

impl Runnable for ProbeRunnable {
    fn begin(self: Arc<Self>, done: Done) {
        let name = self.ty.name();
        self.ctx.logger.info(&format!("{name}: starting measurement"));
        if self.ty.needs_input() && self.ctx.inputs.is_empty() && self.ctx.input_files.is_empty()
        {
            self.ctx
                .logger
                .warn(&format!("{name}: this measurement requires inputs"));
            done(Err(Error::Value));
            return;
        }
        Self::arm_watchdog(&self);
        if self.ctx.input_files.is_empty() {
            let inputs = self.plan_inputs(Vec::new());
            Self::step(self, inputs, 0, done);
            return;
        }
        // Reading input files is blocking work; do it off the reactor.
        let this = Arc::clone(&self);
        let reactor = self.ctx.reactor.clone();
        self.ctx.reactor.call_in_thread(move || {
            let mut extra = Vec::new();
            for path in &this.ctx.input_files {
                match std::fs::read_to_string(path) {
                    Ok(text) => {
                        extra.extend(
                            text.lines()
                                .map(str::trim)
                                .filter(|line| !line.is_empty())
                                .map(String::from),
                        );
                    }
                    Err(err) => {
                        this.ctx
                            .logger
                            .warn(&format!("cannot read input file '{path}': {err}"));
                        if let Some(cb) = &this.ctx.on_measurement_error {
                            cb(&Error::FileIo.reason(), Some(path.as_str()));
                        }
                    }
                }
            }
            let next = Arc::clone(&this);
            reactor.call_soon(move || {
                let inputs = next.plan_inputs(extra);
                Self::step(next, inputs, 0, done);
            });
        });
    }

    fn end(self: Arc<Self>, done: Done) {
        if let Some(id) = self.watchdog.lock().unwrap().take() {
            self.ctx.reactor.cancel_timer(id);
        }
        self.ctx
            .logger
            .info(&format!("{}: measurement complete", self.ty.name()));
        done(Ok(()));
    }
}
