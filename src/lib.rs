#![forbid(unsafe_code)]

#[cfg(feature = "cli")]
pub mod cli;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod error;
pub mod paths;
pub mod pipeline;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::daemon::classify::{ExtractionOutcome, ExtractionStatus, SaveOutcome, StopReason};
pub use crate::daemon::reconcile::{ReconciliationState, ReconciliationSummary};
pub use crate::daemon::state_store::{DaemonState, DaemonStatus};
