#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss
)]

//! GPU Idle Watchdog
//!
//! Samples GPU utilization, decides when training has finished, exports the
//! latest results and terminates the instance.

pub mod config;
pub mod idle;
pub mod monitor;
pub mod notify;
pub mod results;
pub mod sampler;
pub mod shutdown;
pub mod terminate;
pub mod transfer;

#[cfg(test)]
mod mock;

pub use config::WatchdogConfig;
pub use idle::{IdleDetector, IdlePhase};
pub use monitor::{Collaborators, CycleOutcome, Monitor, MonitorExit};
pub use results::{LogRecord, ResultLocator};
pub use sampler::{AveragedUtilization, Sampler};
pub use shutdown::{ShutdownReport, ShutdownSequence};
