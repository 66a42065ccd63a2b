//! Backfill bookkeeping after each cycle.
//!
//! After every cycle the engine:
//! - schedules yesterday once per calendar day (daily backfill)
//! - schedules the failed cycle's window plus a look-back margin
//! - runs the oldest due dates through the executor, up to a per-cycle budget
//! - persists the backlog; a date leaves it only after a successful run

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use time::{Date, Duration, PrimitiveDateTime};

use super::history::summarize;
use super::state_store::{StateError, StateStore};
use crate::clock::{self, Clock};
use crate::config::ReconciliationConfig;

const FAILURE_SUMMARY_LIMIT: usize = 180;

/// Durable backlog owned by [`ReconciliationEngine`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconciliationState {
    pub last_daily_scheduled: Option<Date>,
    /// Never decreases.
    pub last_successful: Option<Date>,
    pub pending: BTreeSet<Date>,
    pub last_error: String,
    pub updated_at: Option<PrimitiveDateTime>,
}

/// Result of one [`ReconciliationEngine::process_after_cycle`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconciliationSummary {
    pub active: bool,
    pub executed: usize,
    pub failed: usize,
    /// Still pending after this call, ascending.
    pub remaining: Vec<Date>,
    /// `"<date>: <summary>"` per failed attempt.
    pub failures: Vec<String>,
    pub scheduled_daily_backfill: bool,
    pub added_due_to_cycle_failure: bool,
}

impl ReconciliationSummary {
    pub fn inactive() -> Self {
        Self::default()
    }

    pub fn has_failures(&self) -> bool {
        self.active && self.failed > 0
    }
}

impl fmt::Display for ReconciliationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.active {
            return f.write_str("reconciliation[inactive]");
        }
        write!(
            f,
            "reconciliation[executed={}, failed={}, pending={}, daily_scheduled={}, for_failure={}",
            self.executed,
            self.failed,
            self.remaining.len(),
            self.scheduled_daily_backfill,
            self.added_due_to_cycle_failure,
        )?;
        if !self.failures.is_empty() {
            write!(f, ", error={}", self.failures.join(" | "))?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct BackfillError {
    message: String,
}

impl BackfillError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Re-runs extraction for one calendar date.
pub trait ReconciliationExecutor: Send + Sync {
    fn execute(&self, date: Date, include_optional: bool) -> Result<(), BackfillError>;
}

impl<F> ReconciliationExecutor for F
where
    F: Fn(Date, bool) -> Result<(), BackfillError> + Send + Sync,
{
    fn execute(&self, date: Date, include_optional: bool) -> Result<(), BackfillError> {
        self(date, include_optional)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconciliationSettings {
    pub enabled: bool,
    /// At least 1.
    pub max_attempts_per_cycle: usize,
    pub failure_lookback_days: u32,
}

impl ReconciliationSettings {
    pub fn from_config(config: &ReconciliationConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts_per_cycle: usize::try_from(config.max_attempts_per_cycle.max(1))
                .unwrap_or(usize::MAX),
            failure_lookback_days: u32::try_from(config.failure_lookback_days.max(0))
                .unwrap_or(u32::MAX),
        }
    }
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self::from_config(&ReconciliationConfig::default())
    }
}

pub struct ReconciliationEngine {
    store: StateStore,
    clock: Arc<dyn Clock>,
    settings: ReconciliationSettings,
    executor: Box<dyn ReconciliationExecutor>,
}

impl ReconciliationEngine {
    pub fn new(
        store: StateStore,
        clock: Arc<dyn Clock>,
        settings: ReconciliationSettings,
        executor: Box<dyn ReconciliationExecutor>,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            executor,
        }
    }

    pub fn settings(&self) -> ReconciliationSettings {
        self.settings
    }

    /// Schedule and run backfill after a cycle spanning `cycle_start..cycle_end`.
    ///
    /// `include_optional` is passed to every executor call unchanged. State
    /// store failures are logged; the returned summary still reflects the work
    /// done in this call.
    pub fn process_after_cycle(
        &self,
        cycle_start: PrimitiveDateTime,
        cycle_end: PrimitiveDateTime,
        cycle_succeeded: bool,
        include_optional: bool,
    ) -> ReconciliationSummary {
        if !self.settings.enabled {
            return ReconciliationSummary::inactive();
        }

        // Only a missing or quarantined record may be replaced. Anything else
        // is left on disk untouched for this cycle.
        let (mut state, persist) = match self.store.load_reconciliation_state() {
            Ok(state) => (state, true),
            Err(err @ StateError::Corrupt { .. }) => {
                tracing::warn!("reconciliation state corrupt, starting empty: {err}");
                (ReconciliationState::default(), true)
            }
            Err(err) => {
                tracing::warn!("reconciliation state unreadable, leaving it in place: {err}");
                (ReconciliationState::default(), false)
            }
        };

        let today = self.clock.today();
        let scheduled_daily_backfill = schedule_daily(&mut state, today);
        let added_due_to_cycle_failure = !cycle_succeeded
            && schedule_failure_window(
                &mut state,
                cycle_start.date(),
                cycle_end.date(),
                self.settings.failure_lookback_days,
            );

        let due: Vec<Date> = state
            .pending
            .iter()
            .copied()
            .take_while(|date| *date <= today)
            .take(self.settings.max_attempts_per_cycle)
            .collect();

        let mut executed = 0;
        let mut failures = Vec::new();
        for date in due {
            match self.executor.execute(date, include_optional) {
                Ok(()) => {
                    state.pending.remove(&date);
                    state.last_successful = state.last_successful.max(Some(date));
                    executed += 1;
                    tracing::info!(
                        date = %clock::format_date(date),
                        "reconciliation date completed"
                    );
                }
                Err(err) => {
                    let summary = summarize(&err.to_string(), FAILURE_SUMMARY_LIMIT);
                    tracing::warn!(
                        date = %clock::format_date(date),
                        "reconciliation attempt failed: {summary}"
                    );
                    failures.push(format!("{}: {summary}", clock::format_date(date)));
                }
            }
        }

        state.last_error = failures.join(" | ");
        state.updated_at = Some(self.clock.now());
        if persist && let Err(err) = self.store.save_reconciliation_state(&state) {
            log_save_failure(&err);
        }

        ReconciliationSummary {
            active: true,
            executed,
            failed: failures.len(),
            remaining: state.pending.iter().copied().collect(),
            failures,
            scheduled_daily_backfill,
            added_due_to_cycle_failure,
        }
    }
}

fn log_save_failure(err: &StateError) {
    tracing::warn!("failed to persist reconciliation state: {err}");
}

/// Enqueue yesterday unless it (or a later day) was already enqueued.
fn schedule_daily(state: &mut ReconciliationState, today: Date) -> bool {
    let Some(yesterday) = today.previous_day() else {
        return false;
    };
    if state
        .last_daily_scheduled
        .is_some_and(|last| last >= yesterday)
    {
        return false;
    }
    state.pending.insert(yesterday);
    state.last_daily_scheduled = Some(yesterday);
    true
}

/// Enqueue `[start - lookback, end]`. `true` if any date was new.
fn schedule_failure_window(
    state: &mut ReconciliationState,
    start: Date,
    end: Date,
    lookback_days: u32,
) -> bool {
    let mut first = start
        .checked_sub(Duration::days(i64::from(lookback_days)))
        .unwrap_or(Date::MIN);
    if first > end {
        first = end;
    }

    let mut added = false;
    let mut day = Some(first);
    while let Some(date) = day.filter(|date| *date <= end) {
        added |= state.pending.insert(date);
        day = date.next_day();
    }
    added
}
