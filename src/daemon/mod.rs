//! Daemon module - the scheduling and reconciliation core.
//!
//! Provides:
//! - Durable daemon/reconciliation state and control files
//! - Completeness classification of entity runs
//! - Reconciliation of failed and missed days
//! - The cycle loop and its cancellable wait
//! - Operator actions (start, stop, status, force-run)

pub mod classify;
pub mod control;
pub mod history;
pub mod lifecycle;
pub mod reconcile;
pub(crate) mod record;
pub mod run;
pub mod state_store;

use thiserror::Error;

pub use classify::{Classification, Classifier, ExtractionStatus};
pub use control::{Dispatcher, Mode, ModeHandler};
pub use history::{CycleStatus, CycleSummary, HistoryWriter};
pub use lifecycle::{Lifecycle, LifecycleError, StatusReport};
pub use reconcile::{
    ReconciliationEngine, ReconciliationExecutor, ReconciliationSettings, ReconciliationSummary,
};
pub use run::{CycleWait, DaemonRunner, PollingWait, RunSettings, WaitResult, run_from_config};
pub use state_store::{DaemonState, DaemonStatus, StateError, StateStore};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
    #[error("no handler registered for mode {0}")]
    NoHandler(Mode),
}
