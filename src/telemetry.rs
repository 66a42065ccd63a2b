//! Tracing subscriber setup.
//!
//! Provides:
//! - A stderr layer in the configured format (tree, pretty, compact, json)
//! - An optional rolling file layer with age/count retention
//! - Verbosity plus `INGEST_LOOP_LOG` filtering

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LogRotation, LoggingConfig};
use crate::paths;

const LOG_FILE_PREFIX: &str = "ingest-loop.log";
const FILTER_ENV: &str = "INGEST_LOOP_LOG";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: LoggingConfig) -> Self {
        Self { verbosity, logging }
    }
}

pub fn is_test_env() -> bool {
    std::env::var_os("INGEST_LOOP_TESTING").is_some()
        || std::env::var_os("RUST_TEST_THREADS").is_some()
}

/// Turn on file logging under `log_dir` for a detached daemon.
pub fn apply_daemon_logging_defaults(logging: &mut LoggingConfig, log_dir: &Path) {
    apply_daemon_logging_defaults_inner(logging, log_dir, is_test_env());
}

fn apply_daemon_logging_defaults_inner(
    logging: &mut LoggingConfig,
    log_dir: &Path,
    is_test_env: bool,
) {
    if is_test_env {
        return;
    }
    logging.file.enabled = true;
    if logging.file.dir.is_none() {
        logging.file.dir = Some(log_dir.to_path_buf());
    }
}

pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let filter = build_filter(config.verbosity, config.logging.filter.as_deref());

    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut notes = Vec::new();

    if config.logging.stdout {
        layers.push(format_layer(
            config.logging.stdout_format,
            std::io::stderr,
            true,
        ));
    }

    if config.logging.file.enabled {
        let dir = resolve_log_dir(&config.logging.file);
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                let retention = RetentionLimits::from_file_config(&config.logging.file);
                if retention.is_enabled() {
                    match prune_logs(&dir, LOG_FILE_PREFIX, retention, SystemTime::now()) {
                        Ok(0) => {}
                        Ok(removed) => notes.push(format!("log retention removed {removed} files")),
                        Err(err) => notes.push(format!("log retention failed: {err}")),
                    }
                }

                let appender = tracing_appender::rolling::RollingFileAppender::new(
                    rotation(config.logging.file.rotation),
                    &dir,
                    LOG_FILE_PREFIX,
                );
                let (writer, guard) = tracing_appender::non_blocking(appender);
                layers.push(format_layer(config.logging.file.format, writer, false));
                guards.push(guard);
            }
            Err(err) => {
                notes.push(format!("log dir init failed for {}: {err}", dir.display()));
            }
        }
    }

    layers.push(Box::new(filter));
    Registry::default().with(layers).init();

    for note in notes {
        tracing::warn!("{note}");
    }

    TelemetryGuard { _guards: guards }
}

fn build_filter(verbosity: u8, configured: Option<&str>) -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(level_from_verbosity(verbosity).into());
    match configured {
        Some(directives) if std::env::var_os(FILTER_ENV).is_none() => {
            builder.parse_lossy(directives)
        }
        _ => builder.with_env_var(FILTER_ENV).from_env_lossy(),
    }
}

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Tree => Box::new(
            tracing_tree::HierarchicalLayer::new(2)
                .with_ansi(ansi)
                .with_writer(writer),
        ),
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_ansi(ansi)
                .with_writer(writer)
                .with_target(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(ansi)
                .with_writer(writer)
                .with_target(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_current_span(true),
        ),
    }
}

fn rotation(rotation: LogRotation) -> tracing_appender::rolling::Rotation {
    match rotation {
        LogRotation::Daily => tracing_appender::rolling::Rotation::DAILY,
        LogRotation::Hourly => tracing_appender::rolling::Rotation::HOURLY,
        LogRotation::Minutely => tracing_appender::rolling::Rotation::MINUTELY,
        LogRotation::Never => tracing_appender::rolling::Rotation::NEVER,
    }
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::WARN,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}

fn resolve_log_dir(config: &FileLoggingConfig) -> PathBuf {
    config.dir.clone().unwrap_or_else(paths::log_dir)
}

#[derive(Clone, Copy, Debug, Default)]
struct RetentionLimits {
    max_age: Option<Duration>,
    max_files: Option<usize>,
}

impl RetentionLimits {
    fn from_file_config(config: &FileLoggingConfig) -> Self {
        Self {
            max_age: config
                .retention_max_age_days
                .map(|days| Duration::from_secs(days.saturating_mul(24 * 60 * 60))),
            max_files: config.retention_max_files,
        }
    }

    fn is_enabled(&self) -> bool {
        self.max_age.is_some() || self.max_files.is_some()
    }
}

/// Remove expired log files, returning how many were deleted.
fn prune_logs(
    dir: &Path,
    prefix: &str,
    retention: RetentionLimits,
    now: SystemTime,
) -> std::io::Result<usize> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let named = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(prefix));
        if named && meta.is_file() {
            entries.push((entry.path(), meta.modified().unwrap_or(now)));
        }
    }

    let mut removed = 0;
    for path in expired_logs(entries, retention, now) {
        if fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Files older than the age limit, then the oldest files beyond the count limit.
fn expired_logs(
    mut entries: Vec<(PathBuf, SystemTime)>,
    retention: RetentionLimits,
    now: SystemTime,
) -> Vec<PathBuf> {
    let mut expired = Vec::new();
    if let Some(max_age) = retention.max_age {
        let (old, fresh): (Vec<_>, Vec<_>) = entries.into_iter().partition(|(_, modified)| {
            now.duration_since(*modified).unwrap_or(Duration::ZERO) > max_age
        });
        expired.extend(old.into_iter().map(|(path, _)| path));
        entries = fresh;
    }
    if let Some(max_files) = retention.max_files
        && entries.len() > max_files
    {
        entries.sort_by_key(|(_, modified)| *modified);
        let excess = entries.len() - max_files;
        expired.extend(entries.drain(..excess).map(|(path, _)| path));
    }
    expired
}
