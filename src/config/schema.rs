use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub reconciliation: ReconciliationConfig,
    pub classification: ClassificationConfig,
    pub pipeline: PipelineConfig,
    pub history: HistoryConfig,
    pub logging: LoggingConfig,
}

/// One extraction target run by every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    /// Slow or auxiliary entity that operators may exclude with `--skip-optional`.
    #[serde(default)]
    pub optional: bool,
}

impl EntityConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Delay between the end of one cycle and the start of the next.
    pub interval_minutes: u64,
    /// How often the inter-cycle wait re-checks the stop/force-run files.
    pub poll_interval_ms: u64,
    /// Each cycle extracts `[today - window_days, today]`.
    pub window_days: u32,
    pub entities: Vec<EntityConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 30,
            poll_interval_ms: 1_000,
            window_days: 1,
            entities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    /// Values below 1 are treated as 1.
    pub max_attempts_per_cycle: i64,
    /// Values below 0 are treated as 0.
    pub failure_lookback_days: i64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts_per_cycle: 2,
            failure_lookback_days: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub max_tolerated_invalid: u64,
    pub max_tolerated_invalid_percent: f64,
    /// Entities whose persisted count may legitimately exceed the extracted
    /// unique count (related rows backfilled during save).
    pub unique_override_entities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub program: Option<PathBuf>,
    /// Arguments; `{entity}`, `{start}` and `{end}` are substituted per run.
    pub args: Vec<String>,
    /// Failure output containing this text is an integrity failure.
    pub integrity_marker: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec![
                "--entity".to_string(),
                "{entity}".to_string(),
                "--from".to_string(),
                "{start}".to_string(),
                "--to".to_string(),
                "{end}".to_string(),
            ],
            integrity_marker: "integrity check failed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub reconciliation_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Minutely,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Tree,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
    pub retention_max_age_days: Option<u64>,
    pub retention_max_files: Option<usize>,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
            retention_max_age_days: Some(7),
            retention_max_files: Some(10),
        }
    }
}

// =============================================================================
// Override layers
// =============================================================================

/// A partially specified config file; unset fields keep the lower layer's value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigLayer {
    pub daemon: DaemonConfigOverride,
    pub reconciliation: ReconciliationConfigOverride,
    pub classification: ClassificationConfigOverride,
    pub pipeline: PipelineConfigOverride,
    pub history: HistoryConfig,
    pub logging: LoggingConfigOverride,
}

impl ConfigLayer {
    pub fn apply_to(&self, target: &mut Config) {
        self.daemon.apply_to(&mut target.daemon);
        self.reconciliation.apply_to(&mut target.reconciliation);
        self.classification.apply_to(&mut target.classification);
        self.pipeline.apply_to(&mut target.pipeline);
        if let Some(dir) = self.history.reconciliation_dir.as_ref() {
            target.history.reconciliation_dir = Some(dir.clone());
        }
        self.logging.apply_to(&mut target.logging);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfigOverride {
    pub interval_minutes: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub window_days: Option<u32>,
    pub entities: Option<Vec<EntityConfig>>,
}

impl DaemonConfigOverride {
    pub fn apply_to(&self, target: &mut DaemonConfig) {
        if let Some(minutes) = self.interval_minutes {
            target.interval_minutes = minutes;
        }
        if let Some(ms) = self.poll_interval_ms {
            target.poll_interval_ms = ms;
        }
        if let Some(days) = self.window_days {
            target.window_days = days;
        }
        if let Some(entities) = self.entities.as_ref() {
            target.entities = entities.clone();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfigOverride {
    pub enabled: Option<bool>,
    pub max_attempts_per_cycle: Option<i64>,
    pub failure_lookback_days: Option<i64>,
}

impl ReconciliationConfigOverride {
    pub fn apply_to(&self, target: &mut ReconciliationConfig) {
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
        if let Some(max) = self.max_attempts_per_cycle {
            target.max_attempts_per_cycle = max;
        }
        if let Some(days) = self.failure_lookback_days {
            target.failure_lookback_days = days;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfigOverride {
    pub max_tolerated_invalid: Option<u64>,
    pub max_tolerated_invalid_percent: Option<f64>,
    pub unique_override_entities: Option<Vec<String>>,
}

impl ClassificationConfigOverride {
    pub fn apply_to(&self, target: &mut ClassificationConfig) {
        if let Some(max) = self.max_tolerated_invalid {
            target.max_tolerated_invalid = max;
        }
        if let Some(percent) = self.max_tolerated_invalid_percent {
            target.max_tolerated_invalid_percent = percent;
        }
        if let Some(entities) = self.unique_override_entities.as_ref() {
            target.unique_override_entities = entities.clone();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfigOverride {
    pub program: Option<PathBuf>,
    pub args: Option<Vec<String>>,
    pub integrity_marker: Option<String>,
}

impl PipelineConfigOverride {
    pub fn apply_to(&self, target: &mut PipelineConfig) {
        if let Some(program) = self.program.as_ref() {
            target.program = Some(program.clone());
        }
        if let Some(args) = self.args.as_ref() {
            target.args = args.clone();
        }
        if let Some(marker) = self.integrity_marker.as_ref() {
            target.integrity_marker = marker.clone();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfigOverride {
    pub stdout: Option<bool>,
    pub stdout_format: Option<LogFormat>,
    pub filter: Option<String>,
    pub file: Option<FileLoggingConfigOverride>,
}

impl LoggingConfigOverride {
    pub fn apply_to(&self, target: &mut LoggingConfig) {
        if let Some(stdout) = self.stdout {
            target.stdout = stdout;
        }
        if let Some(format) = self.stdout_format {
            target.stdout_format = format;
        }
        if let Some(filter) = self.filter.as_ref() {
            target.filter = Some(filter.clone());
        }
        if let Some(file) = self.file.as_ref() {
            file.apply_to(&mut target.file);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfigOverride {
    pub enabled: Option<bool>,
    pub dir: Option<PathBuf>,
    pub format: Option<LogFormat>,
    pub rotation: Option<LogRotation>,
    pub retention_max_age_days: Option<u64>,
    pub retention_max_files: Option<usize>,
}

impl FileLoggingConfigOverride {
    pub fn apply_to(&self, target: &mut FileLoggingConfig) {
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
        if let Some(dir) = self.dir.as_ref() {
            target.dir = Some(dir.clone());
        }
        if let Some(format) = self.format {
            target.format = format;
        }
        if let Some(rotation) = self.rotation {
            target.rotation = rotation;
        }
        if let Some(days) = self.retention_max_age_days {
            target.retention_max_age_days = Some(days);
        }
        if let Some(files) = self.retention_max_files {
            target.retention_max_files = Some(files);
        }
    }
}
