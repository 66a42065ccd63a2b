//! Durable daemon state and control files.
//!
//! Two key-value records (daemon run state, reconciliation backlog) plus three
//! presence-based control files (pid, stop, force-run) under the daemon's
//! `runtime/` directory. Writes replace whole files; reads treat a missing
//! file as the default state.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Date, PrimitiveDateTime};

use super::history::sanitize_field;
use super::reconcile::ReconciliationState;
use super::record;
use crate::clock::{self, Clock};
use crate::paths::DaemonPaths;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt state record {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },
    #[error("failed to render state record: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("status {status} requires a process id")]
    MissingPid { status: DaemonStatus },
}

/// Why a state record could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl StateError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DaemonStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    WaitingNextCycle,
    WaitingNextCycleWithError,
}

impl DaemonStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DaemonStatus::Stopped => "STOPPED",
            DaemonStatus::Starting => "STARTING",
            DaemonStatus::Running => "RUNNING",
            DaemonStatus::Stopping => "STOPPING",
            DaemonStatus::WaitingNextCycle => "WAITING_NEXT_CYCLE",
            DaemonStatus::WaitingNextCycleWithError => "WAITING_NEXT_CYCLE_WITH_ERROR",
        }
    }
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown daemon status {0:?}")]
pub struct UnknownStatus(String);

impl FromStr for DaemonStatus {
    type Err = UnknownStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(match raw.trim().to_ascii_uppercase().as_str() {
            "STOPPED" => DaemonStatus::Stopped,
            "STARTING" => DaemonStatus::Starting,
            "RUNNING" => DaemonStatus::Running,
            "STOPPING" => DaemonStatus::Stopping,
            "WAITING_NEXT_CYCLE" => DaemonStatus::WaitingNextCycle,
            "WAITING_NEXT_CYCLE_WITH_ERROR" => DaemonStatus::WaitingNextCycleWithError,
            _ => return Err(UnknownStatus(raw.to_string())),
        })
    }
}

/// Last persisted view of the daemon.
///
/// `pid` is present exactly when `status` is not [`DaemonStatus::Stopped`];
/// [`StateStore::save_daemon_state`] enforces this on every write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DaemonState {
    pub status: DaemonStatus,
    pub pid: Option<u32>,
    pub detail: String,
    pub cycle_started_at: Option<PrimitiveDateTime>,
    pub cycle_finished_at: Option<PrimitiveDateTime>,
    pub next_cycle_at: Option<PrimitiveDateTime>,
    pub updated_at: Option<PrimitiveDateTime>,
}

impl DaemonState {
    pub fn stopped(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            ..Self::default()
        }
    }

    pub fn active(status: DaemonStatus, pid: u32, detail: impl Into<String>) -> Self {
        Self {
            status,
            pid: Some(pid),
            detail: detail.into(),
            ..Self::default()
        }
    }

    pub fn with_cycle(
        mut self,
        started_at: Option<PrimitiveDateTime>,
        finished_at: Option<PrimitiveDateTime>,
    ) -> Self {
        self.cycle_started_at = started_at;
        self.cycle_finished_at = finished_at;
        self
    }

    pub fn with_next_cycle(mut self, next: Option<PrimitiveDateTime>) -> Self {
        self.next_cycle_at = next;
        self
    }

    pub fn is_stopped(&self) -> bool {
        self.status == DaemonStatus::Stopped
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct DaemonStateRecord {
    status: String,
    pid: String,
    detail: String,
    cycle_started_at: String,
    cycle_finished_at: String,
    next_cycle_at: String,
    updated_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ReconciliationStateRecord {
    last_daily_scheduled_date: String,
    last_successful_reconciliation_date: String,
    pending_dates: String,
    last_error: String,
    updated_at: String,
}

#[derive(Clone)]
pub struct StateStore {
    paths: DaemonPaths,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    pub fn new(paths: DaemonPaths, clock: Arc<dyn Clock>) -> Self {
        Self { paths, clock }
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    pub fn ensure_dirs(&self) -> Result<(), StateError> {
        self.paths
            .ensure_dirs()
            .map_err(|source| StateError::io(self.paths.root(), source))
    }

    // =========================================================================
    // Daemon state record
    // =========================================================================

    pub fn load_daemon_state(&self) -> Result<DaemonState, StateError> {
        let path = self.paths.state_file();
        let Some(record) = record::load::<DaemonStateRecord>(&path)? else {
            return Ok(DaemonState::default());
        };

        let status = if record.status.trim().is_empty() {
            DaemonStatus::Stopped
        } else {
            record.status.parse().unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), "{err}, treating as STOPPED");
                DaemonStatus::Stopped
            })
        };
        Ok(DaemonState {
            status,
            pid: parse_pid(&record.pid),
            detail: record.detail,
            cycle_started_at: parse_timestamp_field("cycle_started_at", &record.cycle_started_at),
            cycle_finished_at: parse_timestamp_field(
                "cycle_finished_at",
                &record.cycle_finished_at,
            ),
            next_cycle_at: parse_timestamp_field("next_cycle_at", &record.next_cycle_at),
            updated_at: parse_timestamp_field("updated_at", &record.updated_at),
        })
    }

    /// Persist `state`, stamping `updated_at`. Returns what was written.
    pub fn save_daemon_state(&self, state: &DaemonState) -> Result<DaemonState, StateError> {
        let mut state = state.clone();
        if state.is_stopped() {
            state.pid = None;
        } else if state.pid.is_none() {
            return Err(StateError::MissingPid {
                status: state.status,
            });
        }
        state.updated_at = Some(self.clock.now());

        let record = DaemonStateRecord {
            status: state.status.as_str().to_string(),
            pid: state.pid.map(|pid| pid.to_string()).unwrap_or_default(),
            detail: state.detail.clone(),
            cycle_started_at: format_optional(state.cycle_started_at),
            cycle_finished_at: format_optional(state.cycle_finished_at),
            next_cycle_at: format_optional(state.next_cycle_at),
            updated_at: format_optional(state.updated_at),
        };
        record::save(&self.paths.state_file(), &record)?;
        Ok(state)
    }

    // =========================================================================
    // Reconciliation state record
    // =========================================================================

    /// Load the reconciliation backlog.
    ///
    /// A record that fails to decode is renamed to `*.corrupt-<stamp>` before
    /// the error is returned, so the next save does not overwrite it. If the
    /// rename fails the error is reported as [`StateError::Io`] instead, and
    /// callers must not save over the record.
    pub fn load_reconciliation_state(&self) -> Result<ReconciliationState, StateError> {
        let path = self.paths.reconciliation_state_file();
        let record = match record::load::<ReconciliationStateRecord>(&path) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(ReconciliationState::default()),
            Err(err @ StateError::Corrupt { .. }) => {
                return match self.quarantine(&path) {
                    Ok(()) => Err(err),
                    Err(source) => Err(StateError::io(&path, source)),
                };
            }
            Err(err) => return Err(err),
        };

        let mut pending = BTreeSet::new();
        for raw in record.pending_dates.split(',') {
            if let Some(date) = parse_date_field("pending_dates", raw) {
                pending.insert(date);
            }
        }
        Ok(ReconciliationState {
            last_daily_scheduled: parse_date_field(
                "last_daily_scheduled_date",
                &record.last_daily_scheduled_date,
            ),
            last_successful: parse_date_field(
                "last_successful_reconciliation_date",
                &record.last_successful_reconciliation_date,
            ),
            pending,
            last_error: record.last_error,
            updated_at: parse_timestamp_field("updated_at", &record.updated_at),
        })
    }

    pub fn save_reconciliation_state(&self, state: &ReconciliationState) -> Result<(), StateError> {
        let pending = state
            .pending
            .iter()
            .map(|date| clock::format_date(*date))
            .collect::<Vec<_>>()
            .join(",");
        let record = ReconciliationStateRecord {
            last_daily_scheduled_date: state
                .last_daily_scheduled
                .map(clock::format_date)
                .unwrap_or_default(),
            last_successful_reconciliation_date: state
                .last_successful
                .map(clock::format_date)
                .unwrap_or_default(),
            pending_dates: pending,
            last_error: sanitize_field(&state.last_error),
            updated_at: format_optional(state.updated_at),
        };
        record::save(&self.paths.reconciliation_state_file(), &record)
    }

    fn quarantine(&self, path: &Path) -> io::Result<()> {
        let mut target = path.as_os_str().to_owned();
        target.push(format!(
            ".corrupt-{}",
            clock::format_file_stamp(self.clock.now())
        ));
        match fs::rename(path, &target) {
            Ok(()) => {
                tracing::warn!(
                    from = %path.display(),
                    to = %PathBuf::from(&target).display(),
                    "moved corrupt state record aside"
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    "failed to move corrupt state record aside: {err}"
                );
                Err(err)
            }
        }
    }

    // =========================================================================
    // Control files
    // =========================================================================

    pub fn request_stop(&self) -> Result<(), StateError> {
        self.write_flag(&self.paths.stop_file(), "stop")
    }

    pub fn request_force_run(&self) -> Result<(), StateError> {
        self.write_flag(&self.paths.force_run_file(), "force-run")
    }

    pub fn stop_requested(&self) -> bool {
        self.paths.stop_file().exists()
    }

    pub fn force_run_requested(&self) -> bool {
        self.paths.force_run_file().exists()
    }

    /// Remove the force-run flag. `true` if a request was pending.
    pub fn consume_force_run(&self) -> Result<bool, StateError> {
        let path = self.paths.force_run_file();
        record::remove_if_exists(&path).map_err(|source| StateError::io(&path, source))
    }

    pub fn write_pid(&self, pid: u32) -> Result<(), StateError> {
        let path = self.paths.pid_file();
        record::write_atomic(&path, pid.to_string().as_bytes())
            .map_err(|source| StateError::io(&path, source))
    }

    pub fn read_pid(&self) -> Result<Option<u32>, StateError> {
        let path = self.paths.pid_file();
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(parse_pid(&raw)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StateError::io(&path, source)),
        }
    }

    pub fn clear_pid(&self) -> Result<(), StateError> {
        self.remove(&self.paths.pid_file())
    }

    /// Remove stop and force-run requests.
    pub fn clear_signal_files(&self) -> Result<(), StateError> {
        self.remove(&self.paths.stop_file())?;
        self.remove(&self.paths.force_run_file())
    }

    /// Remove pid, stop and force-run files.
    pub fn clear_control_files(&self) -> Result<(), StateError> {
        self.clear_pid()?;
        self.clear_signal_files()
    }

    fn write_flag(&self, path: &Path, label: &str) -> Result<(), StateError> {
        let body = format!("{label}@{}", clock::format_timestamp(self.clock.now()));
        record::write_atomic(path, body.as_bytes()).map_err(|source| StateError::io(path, source))
    }

    fn remove(&self, path: &Path) -> Result<(), StateError> {
        record::remove_if_exists(path)
            .map(|_| ())
            .map_err(|source| StateError::io(path, source))
    }
}

fn parse_pid(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<u32>() {
        Ok(pid) if pid > 0 => Some(pid),
        _ => {
            tracing::warn!("ignoring invalid pid {raw:?}");
            None
        }
    }
}

fn parse_date_field(field: &str, raw: &str) -> Option<Date> {
    if raw.trim().is_empty() {
        return None;
    }
    match clock::parse_date(raw) {
        Ok(date) => Some(date),
        Err(err) => {
            tracing::warn!(field, value = raw, "ignoring invalid date: {err}");
            None
        }
    }
}

fn parse_timestamp_field(field: &str, raw: &str) -> Option<PrimitiveDateTime> {
    if raw.trim().is_empty() {
        return None;
    }
    match clock::parse_timestamp(raw) {
        Ok(at) => Some(at),
        Err(err) => {
            tracing::warn!(field, value = raw, "ignoring invalid timestamp: {err}");
            None
        }
    }
}

fn format_optional(at: Option<PrimitiveDateTime>) -> String {
    at.map(clock::format_timestamp).unwrap_or_default()
}
