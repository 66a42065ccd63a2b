use thiserror::Error;

use crate::config::ConfigError;
use crate::daemon::{DaemonError, LifecycleError, StateError};
use crate::pipeline::PipelineError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-capability errors; callers that care about a
/// specific failure match on the inner type.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),
}

impl Error {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::Lifecycle(LifecycleError::StillRunning { .. }) => 3,
            _ => 1,
        }
    }
}
