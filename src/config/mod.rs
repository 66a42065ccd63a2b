//! Config loading and persistence.
//!
//! Layers, lowest first: built-in defaults, the user config
//! (`$XDG_CONFIG_HOME/ingest-loop/config.toml`), `./ingest-loop.toml`, then
//! `INGEST_LOOP_*` environment overrides.

use std::path::PathBuf;

use thiserror::Error;

mod load;
mod merge;
mod schema;

pub use load::{
    config_path, load, load_for_dir, load_local_config, load_or_init, load_user_config,
    local_config_path, write_config,
};
pub use merge::{apply_env_overrides, apply_overrides_from, merge_layers};
pub use schema::{
    ClassificationConfig, ClassificationConfigOverride, Config, ConfigLayer, DaemonConfig,
    DaemonConfigOverride, EntityConfig, FileLoggingConfig, FileLoggingConfigOverride,
    HistoryConfig, LogFormat, LogRotation, LoggingConfig, LoggingConfigOverride, PipelineConfig,
    PipelineConfigOverride, ReconciliationConfig, ReconciliationConfigOverride,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("pipeline.program is not configured")]
    MissingPipelineProgram,
}
