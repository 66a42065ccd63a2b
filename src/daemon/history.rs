//! Append-only audit history.
//!
//! Provides:
//! - One log file per cycle under `cycles/<date>/`
//! - Monthly `;`-delimited cycle history (`history/daemon_cycles_YYYY_MM.csv`)
//! - Monthly reconciliation history in its own directory

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use time::PrimitiveDateTime;

use super::reconcile::ReconciliationSummary;
use crate::clock;
use crate::paths::DaemonPaths;

pub const CYCLE_HISTORY_HEADER: &str = "TIMESTAMP;STATUS;DURATION_S;TOTAL_RECORDS;TYPE;ERROR_MSG;STARTED_AT;WARNINGS;ERRORS;CYCLE_LOG";
pub const RECONCILIATION_HISTORY_HEADER: &str = "TIMESTAMP;STATUS;EXECUTED;FAILED;PENDING;CYCLE_LOG;CYCLE_STARTED_AT;CYCLE_FINISHED_AT;CYCLE_SUCCEEDED;ACTIVE;DAILY_SCHEDULED;ADDED_FOR_FAILURE;DETAIL";

const CYCLE_TYPE: &str = "daemon_cycle";
const CYCLE_LOG_PREFIX: &str = "cycle_";
const HISTORY_MESSAGE_LIMIT: usize = 240;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleStatus {
    Success,
    Alert,
    Error,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleStatus::Success => "SUCCESS",
            CycleStatus::Alert => "ALERT",
            CycleStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened in one finished cycle.
#[derive(Clone, Debug)]
pub struct CycleSummary {
    pub started_at: PrimitiveDateTime,
    pub finished_at: PrimitiveDateTime,
    pub status: CycleStatus,
    pub total_records: u64,
    pub warnings: u32,
    pub errors: u32,
    pub detail: String,
    pub cycle_log: Option<PathBuf>,
}

impl CycleSummary {
    pub fn duration_secs(&self) -> i64 {
        (self.finished_at - self.started_at).whole_seconds().max(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    /// Dates were processed or newly scheduled.
    Executed,
    WithFailures,
    Inactive,
    NoAction,
    /// The engine did not produce a summary.
    ProcessingError,
}

impl ReconciliationOutcome {
    pub fn of(summary: Option<&ReconciliationSummary>) -> Self {
        let Some(summary) = summary else {
            return ReconciliationOutcome::ProcessingError;
        };
        if !summary.active {
            ReconciliationOutcome::Inactive
        } else if summary.failed > 0 {
            ReconciliationOutcome::WithFailures
        } else if summary.executed > 0
            || summary.scheduled_daily_backfill
            || summary.added_due_to_cycle_failure
        {
            ReconciliationOutcome::Executed
        } else {
            ReconciliationOutcome::NoAction
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            ReconciliationOutcome::Executed => "EXECUTADA",
            ReconciliationOutcome::WithFailures => "COM_FALHAS",
            ReconciliationOutcome::Inactive => "INATIVA",
            ReconciliationOutcome::NoAction => "SEM_ACAO",
            ReconciliationOutcome::ProcessingError => "ERRO_PROCESSAMENTO",
        }
    }
}

#[derive(Clone, Debug)]
pub struct HistoryWriter {
    paths: DaemonPaths,
}

impl HistoryWriter {
    pub fn new(paths: DaemonPaths) -> Self {
        Self { paths }
    }

    /// Create the log file for a cycle starting at `started_at`.
    pub fn create_cycle_log(&self, started_at: PrimitiveDateTime) -> io::Result<PathBuf> {
        let dir = self
            .paths
            .cycles_dir()
            .join(clock::format_date(started_at.date()));
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "{CYCLE_LOG_PREFIX}{}.log",
            clock::format_file_stamp(started_at)
        ));
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(path)
    }

    pub fn append_cycle_line(
        &self,
        log: &Path,
        at: PrimitiveDateTime,
        line: &str,
    ) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(log)?;
        file.write_all(format!("[{}] {line}\n", clock::format_timestamp(at)).as_bytes())
    }

    pub fn append_cycle_summary(&self, log: &Path, summary: &CycleSummary) -> io::Result<()> {
        let block = format!(
            "\n==== cycle summary ====\n\
             started_at: {}\n\
             finished_at: {}\n\
             duration_s: {}\n\
             status: {}\n\
             total_records: {}\n\
             warnings: {}\n\
             errors: {}\n\
             detail: {}\n",
            clock::format_timestamp(summary.started_at),
            clock::format_timestamp(summary.finished_at),
            summary.duration_secs(),
            summary.status,
            summary.total_records,
            summary.warnings,
            summary.errors,
            summary.detail,
        );
        let mut file = OpenOptions::new().create(true).append(true).open(log)?;
        file.write_all(block.as_bytes())
    }

    /// Append a row to this month's cycle history. Returns the file written.
    pub fn record_cycle(&self, summary: &CycleSummary) -> io::Result<PathBuf> {
        let row = [
            clock::format_timestamp(summary.finished_at),
            summary.status.as_str().to_string(),
            summary.duration_secs().to_string(),
            summary.total_records.to_string(),
            CYCLE_TYPE.to_string(),
            sanitize_field(&summarize(&summary.detail, HISTORY_MESSAGE_LIMIT)),
            clock::format_timestamp(summary.started_at),
            summary.warnings.to_string(),
            summary.errors.to_string(),
            log_reference(summary.cycle_log.as_deref()),
        ];
        let path = self.paths.history_dir().join(format!(
            "daemon_cycles_{}.csv",
            clock::format_month(summary.finished_at.date())
        ));
        append_row(&path, CYCLE_HISTORY_HEADER, &row)?;
        Ok(path)
    }

    /// Append a row describing what reconciliation did after `cycle`.
    ///
    /// `summary` is `None` when the engine failed to produce one.
    pub fn record_reconciliation(
        &self,
        at: PrimitiveDateTime,
        cycle: &CycleSummary,
        cycle_succeeded: bool,
        summary: Option<&ReconciliationSummary>,
    ) -> io::Result<PathBuf> {
        let outcome = ReconciliationOutcome::of(summary);
        let row = [
            clock::format_timestamp(at),
            outcome.code().to_string(),
            summary.map_or(0, |s| s.executed).to_string(),
            summary.map_or(0, |s| s.failed).to_string(),
            summary
                .map_or(-1, |s| i64::try_from(s.remaining.len()).unwrap_or(i64::MAX))
                .to_string(),
            log_reference(cycle.cycle_log.as_deref()),
            clock::format_timestamp(cycle.started_at),
            clock::format_timestamp(cycle.finished_at),
            cycle_succeeded.to_string(),
            summary.is_some_and(|s| s.active).to_string(),
            summary.is_some_and(|s| s.scheduled_daily_backfill).to_string(),
            summary.is_some_and(|s| s.added_due_to_cycle_failure).to_string(),
            sanitize_field(&reconciliation_detail(summary)),
        ];
        let path = self.paths.reconciliation_history_dir().join(format!(
            "reconciliation_{}.csv",
            clock::format_month(at.date())
        ));
        append_row(&path, RECONCILIATION_HISTORY_HEADER, &row)?;
        Ok(path)
    }

    /// Move cycle logs left directly in `cycles/` into their date folder.
    pub fn organize_legacy_cycle_logs(&self) -> io::Result<usize> {
        let cycles = self.paths.cycles_dir();
        let entries = match fs::read_dir(&cycles) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let mut moved = 0;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(date) = name.to_str().and_then(legacy_log_date) else {
                continue;
            };
            let dir = cycles.join(date);
            let target = dir.join(&name);
            if target.exists() {
                tracing::warn!(path = %target.display(), "cycle log already organized, leaving legacy copy");
                continue;
            }
            fs::create_dir_all(&dir)?;
            fs::rename(entry.path(), &target)?;
            moved += 1;
        }
        Ok(moved)
    }
}

fn legacy_log_date(name: &str) -> Option<&str> {
    let rest = name.strip_prefix(CYCLE_LOG_PREFIX)?;
    if !name.ends_with(".log") {
        return None;
    }
    let date = rest.get(..10)?;
    clock::parse_date(date).ok().map(|_| date)
}

fn log_reference(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}

fn reconciliation_detail(summary: Option<&ReconciliationSummary>) -> String {
    let Some(summary) = summary else {
        return "reconciliation did not produce a summary".to_string();
    };
    let pending = if summary.remaining.is_empty() {
        "none".to_string()
    } else {
        summary
            .remaining
            .iter()
            .map(|date| clock::format_date(*date))
            .collect::<Vec<_>>()
            .join(",")
    };
    let mut detail = format!("pending={pending}");
    if !summary.failures.is_empty() {
        detail.push_str(" | failures=");
        detail.push_str(&summary.failures.join(" | "));
    }
    summarize(&detail, HISTORY_MESSAGE_LIMIT)
}

fn append_row(path: &Path, header: &str, fields: &[String]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let needs_header = fs::metadata(path).map_or(true, |meta| meta.len() == 0);
    let mut text = String::new();
    if needs_header {
        text.push_str(header);
        text.push('\n');
    }
    text.push_str(&fields.join(";"));
    text.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())
}

/// Make `raw` safe for a single `;`-delimited field.
pub fn sanitize_field(raw: &str) -> String {
    raw.replace(['\r', '\n'], " ").replace(';', ",").trim().to_string()
}

/// One-line summary of `raw`, at most `max_chars` characters plus `...`.
pub fn summarize(raw: &str, max_chars: usize) -> String {
    let flat = raw.replace(['\r', '\n'], " ");
    let flat = flat.trim();
    if flat.is_empty() {
        return "no details".to_string();
    }
    if flat.chars().count() <= max_chars {
        return flat.to_string();
    }
    let mut cut: String = flat.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}
