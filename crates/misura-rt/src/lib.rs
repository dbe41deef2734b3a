//! misura-rt: the I/O runtime under the misura measurement engine.
//!
//! Provides the callback-driven [`Reactor`] (timers, one-shot readiness,
//! worker-thread offload), reactor-owned [`DatagramSocket`]s, the
//! [`Worker`] background job thread, and the shared error taxonomy.
//!
//! The reactor is single-threaded cooperative: every callback it
//! schedules runs serialized on the thread that called [`Reactor::run`].
//! The worker thread runs in parallel with it.

mod datagram;
mod error;
mod reactor;
mod sys;
mod worker;

pub use datagram::{DatagramSocket, MAX_READS_PER_WAKE};
pub use error::{Error, Result};
pub use reactor::{DataUsage, Reactor};
pub use sys::{Family, NetSys, OsNet};
pub use worker::Worker;
