//! misura-engine: long-running measurement tasks with an event stream.
//!
//! The engine exposes one primitive, the [`Task`]: it captures a settings
//! document, spawns a background thread gated by the process-wide
//! admission semaphore, drives the selected measurement through the
//! reactor, and forwards everything the measurement reports as [`Event`]s
//! consumed with [`Task::wait_for_next_event`].
//!
//! ```no_run
//! use serde_json::json;
//! use misura_engine::Task;
//!
//! let task = Task::start(json!({"type": "NDT", "verbosity": "INFO"})).unwrap();
//! while let Some(event) = task.wait_for_next_event() {
//!     eprintln!("{}", event.serialize());
//! }
//! ```

mod event;
mod logger;
mod nettests;
mod semaphore;
mod settings;
mod task;

pub use event::{Event, EventType};
pub use logger::{verbosity, Logger};
pub use nettests::{make_runnable, Done, Runnable, RunnableContext, TaskType};
pub use semaphore::{global as global_semaphore, Semaphore};
pub use settings::{validate, OptionValue, Options, Settings};
pub use task::Task;

pub use misura_rt::{DataUsage, DatagramSocket, Error, Family, Reactor, Result};
