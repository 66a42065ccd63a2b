//! Human and JSON renderers for CLI outputs.
//!
//! Pure formatting; handlers gather the data.

use serde_json::{Value, json};
use time::PrimitiveDateTime;

use crate::clock;
use crate::daemon::lifecycle::{ForceRunOutcome, StartOutcome, StatusReport, StopOutcome};
use crate::daemon::reconcile::ReconciliationState;

pub fn start_outcome(outcome: StartOutcome) -> String {
    match outcome {
        StartOutcome::Started { pid } => format!("daemon started (pid {pid})"),
        StartOutcome::AlreadyRunning { pid } => {
            format!("daemon already running (pid {pid}); force-run requested")
        }
    }
}

pub fn stop_outcome(outcome: StopOutcome) -> String {
    match outcome {
        StopOutcome::Stopped { pid, forced: false } => format!("daemon stopped (pid {pid})"),
        StopOutcome::Stopped { pid, forced: true } => {
            format!("daemon stopped after signal (pid {pid})")
        }
        StopOutcome::NotRunning => "daemon not running".into(),
    }
}

pub fn force_run_outcome(outcome: ForceRunOutcome) -> String {
    match outcome {
        ForceRunOutcome::Requested { pid } => format!("force-run requested (pid {pid})"),
        ForceRunOutcome::NotRunning => "daemon not running; nothing to force".into(),
    }
}

pub fn status_json(report: &StatusReport) -> Value {
    let state = &report.state;
    json!({
        "status": state.status.as_str(),
        "pid": state.pid,
        "alive": report.alive_pid.is_some(),
        "repaired": report.repaired,
        "detail": state.detail,
        "updated_at": stamp(state.updated_at),
        "cycle_started_at": stamp(state.cycle_started_at),
        "cycle_finished_at": stamp(state.cycle_finished_at),
        "next_cycle_at": stamp(state.next_cycle_at),
        "console_log": report.console_log.display().to_string(),
        "log_dir": report.log_dir.display().to_string(),
    })
}

pub fn reconciliation_state(state: &ReconciliationState) -> String {
    let date = |value: Option<time::Date>| value.map_or_else(|| "-".to_string(), clock::format_date);
    let pending = if state.pending.is_empty() {
        "none".to_string()
    } else {
        state
            .pending
            .iter()
            .map(|d| clock::format_date(*d))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut out = String::new();
    out.push_str(&format!("pending:          {pending}\n"));
    out.push_str(&format!(
        "last successful:  {}\n",
        date(state.last_successful)
    ));
    out.push_str(&format!(
        "daily scheduled:  {}\n",
        date(state.last_daily_scheduled)
    ));
    out.push_str(&format!(
        "updated:          {}",
        state
            .updated_at
            .map_or_else(|| "-".to_string(), clock::format_timestamp)
    ));
    if !state.last_error.is_empty() {
        out.push_str(&format!("\nlast error:       {}", state.last_error));
    }
    out
}

pub fn reconciliation_json(state: &ReconciliationState) -> Value {
    json!({
        "pending": state.pending.iter().map(|d| clock::format_date(*d)).collect::<Vec<_>>(),
        "last_successful": state.last_successful.map(clock::format_date),
        "last_daily_scheduled": state.last_daily_scheduled.map(clock::format_date),
        "last_error": state.last_error,
        "updated_at": stamp(state.updated_at),
    })
}

fn stamp(value: Option<PrimitiveDateTime>) -> Option<String> {
    value.map(clock::format_timestamp)
}
