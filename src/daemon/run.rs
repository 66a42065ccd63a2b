//! Daemon control loop.
//!
//! One iteration: mark RUNNING, run every entity through the pipeline and
//! classify it, hand the cycle to reconciliation, write history, persist the
//! waiting status, then wait for the next slot or a stop/force-run request.
//! Every exit path clears the control files and persists STOPPED.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use time::{Date, Duration, PrimitiveDateTime};

use super::DaemonError;
use super::classify::{Classification, Classifier, ExtractionStatus};
use super::history::{CycleStatus, CycleSummary, HistoryWriter};
use super::reconcile::{ReconciliationEngine, ReconciliationSettings, ReconciliationSummary};
use super::state_store::{DaemonState, DaemonStatus, StateStore};
use crate::clock::{self, Clock};
use crate::config::{Config, ConfigError, DaemonConfig, EntityConfig};
use crate::paths::DaemonPaths;
use crate::pipeline::{
    CommandPipeline, DateWindow, EntityReport, Pipeline, PipelineBackfill, PipelineError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    TimedOut,
    StopRequested,
    ForceRunRequested,
}

/// Suspension between cycles.
pub trait CycleWait {
    fn wait_until(&self, deadline: PrimitiveDateTime) -> WaitResult;
}

/// Sleeps in `poll_interval` slices, re-checking the control files and the
/// process shutdown flag on every tick.
pub struct PollingWait {
    store: StateStore,
    clock: Arc<dyn Clock>,
    poll_interval: StdDuration,
    shutdown: Arc<AtomicBool>,
}

impl PollingWait {
    pub fn new(store: StateStore, clock: Arc<dyn Clock>, poll_interval: StdDuration) -> Self {
        Self {
            store,
            clock,
            poll_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_shutdown_flag(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }
}

impl CycleWait for PollingWait {
    fn wait_until(&self, deadline: PrimitiveDateTime) -> WaitResult {
        loop {
            if self.shutdown.load(Ordering::SeqCst) || self.store.stop_requested() {
                return WaitResult::StopRequested;
            }
            match self.store.consume_force_run() {
                Ok(true) => return WaitResult::ForceRunRequested,
                Ok(false) => {}
                Err(err) => tracing::warn!("failed to consume force-run request: {err}"),
            }
            let now = self.clock.now();
            if now >= deadline {
                return WaitResult::TimedOut;
            }
            let remaining = StdDuration::try_from(deadline - now).unwrap_or(StdDuration::ZERO);
            std::thread::sleep(self.poll_interval.min(remaining));
        }
    }
}

/// Route SIGTERM and SIGINT into a flag the wait loop observes.
pub fn register_shutdown_signals() -> std::io::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))?;
    Ok(flag)
}

#[derive(Clone, Debug)]
pub struct RunSettings {
    pub entities: Vec<EntityConfig>,
    /// Forwarded unchanged to every backfill triggered by this run.
    pub include_optional: bool,
    pub interval: Duration,
    pub window_days: u32,
    pub pid: u32,
}

impl RunSettings {
    pub fn from_config(config: &DaemonConfig, include_optional: bool) -> Self {
        let interval_secs = config.interval_minutes.max(1).saturating_mul(60);
        Self {
            entities: config.entities.clone(),
            include_optional,
            interval: Duration::seconds(i64::try_from(interval_secs).unwrap_or(i64::MAX)),
            window_days: config.window_days,
            pid: std::process::id(),
        }
    }

    fn selected_entities(&self) -> impl Iterator<Item = &EntityConfig> {
        self.entities
            .iter()
            .filter(|entity| self.include_optional || !entity.optional)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunReport {
    pub cycles: u32,
}

pub struct DaemonRunner {
    store: StateStore,
    history: HistoryWriter,
    clock: Arc<dyn Clock>,
    pipeline: Arc<dyn Pipeline>,
    classifier: Classifier,
    reconciler: ReconciliationEngine,
    waiter: Box<dyn CycleWait>,
    shutdown: Arc<AtomicBool>,
    settings: RunSettings,
}

impl DaemonRunner {
    pub fn new(
        store: StateStore,
        clock: Arc<dyn Clock>,
        pipeline: Arc<dyn Pipeline>,
        reconciler: ReconciliationEngine,
        waiter: Box<dyn CycleWait>,
        settings: RunSettings,
    ) -> Self {
        Self {
            history: HistoryWriter::new(store.paths().clone()),
            store,
            clock,
            pipeline,
            classifier: Classifier::new(),
            reconciler,
            waiter,
            shutdown: Arc::new(AtomicBool::new(false)),
            settings,
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_shutdown_flag(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run cycles until a stop is requested.
    ///
    /// Errors before the first cycle (directories, pid file) are returned;
    /// everything inside the loop is logged and folded into the persisted state.
    pub fn run(&self) -> Result<RunReport, DaemonError> {
        self.store.ensure_dirs()?;
        match self.history.organize_legacy_cycle_logs() {
            Ok(0) => {}
            Ok(moved) => tracing::info!(moved, "organized legacy cycle logs"),
            Err(err) => tracing::warn!("failed to organize legacy cycle logs: {err}"),
        }
        self.store.clear_signal_files()?;
        self.store.write_pid(self.settings.pid)?;

        let mut guard = ShutdownGuard::new(&self.store);
        let mode = if self.settings.include_optional {
            "optional entities included"
        } else {
            "optional entities skipped"
        };
        tracing::info!(pid = self.settings.pid, mode, "daemon started");
        self.persist(&DaemonState::active(
            DaemonStatus::Running,
            self.settings.pid,
            format!("daemon started ({mode})"),
        ));

        let mut cycles = 0;
        loop {
            if self.stop_signalled() {
                guard.detail = "stopped on request".to_string();
                break;
            }
            let cycle = self.run_cycle();
            guard.last_cycle = Some((cycle.started_at, cycle.finished_at));
            cycles += 1;

            match self.waiter.wait_until(cycle.next_cycle_at) {
                WaitResult::StopRequested => {
                    guard.detail = "stopped on request".to_string();
                    break;
                }
                WaitResult::ForceRunRequested => {
                    tracing::info!("force-run requested, starting next cycle now");
                }
                WaitResult::TimedOut => {}
            }
        }

        tracing::info!(cycles, "daemon stopping");
        Ok(RunReport { cycles })
    }

    fn stop_signalled(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.store.stop_requested()
    }

    fn run_cycle(&self) -> FinishedCycle {
        let pid = self.settings.pid;
        let started_at = self.clock.now();
        self.persist(
            &DaemonState::active(DaemonStatus::Running, pid, "cycle in progress")
                .with_cycle(Some(started_at), None),
        );

        let cycle_log = match self.history.create_cycle_log(started_at) {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::warn!("failed to create cycle log: {err}");
                None
            }
        };

        let window = self.window_for(started_at.date());
        let mut tally = CycleTally::default();
        for entity in self.settings.selected_entities() {
            let line = match self.pipeline.run_entity(entity, window) {
                Ok(report) => {
                    let result = self.classifier.classify_entity(
                        &entity.name,
                        &report.extraction,
                        &report.save,
                    );
                    tally.record(&entity.name, &report, result);
                    entity_line(&entity.name, &report, result)
                }
                Err(err) if err.is_integrity() => {
                    tracing::warn!(entity = %entity.name, "integrity failure, ending cycle early: {err}");
                    tally.integrity_alert = Some(err.to_string());
                    format!("entity={} status=ALERT error={err}", entity.name)
                }
                Err(err) => {
                    tracing::error!(entity = %entity.name, "entity failed: {err}");
                    tally.record_failure(&entity.name, &err);
                    format!("entity={} status=FAILED error={err}", entity.name)
                }
            };
            self.log_line(cycle_log.as_deref(), &line);
            if tally.integrity_alert.is_some() {
                break;
            }
        }

        let finished_at = self.clock.now();
        let succeeded = tally.succeeded();
        let cycle = CycleSummary {
            started_at,
            finished_at,
            status: tally.status(),
            total_records: tally.records,
            warnings: tally.warnings(),
            errors: tally.errors,
            detail: tally.detail(),
            cycle_log,
        };

        let reconciliation = self.reconcile(started_at, finished_at, succeeded);
        if let Err(err) = self.history.record_reconciliation(
            self.clock.now(),
            &cycle,
            succeeded,
            reconciliation.as_ref(),
        ) {
            tracing::warn!("failed to write reconciliation history: {err}");
        }
        if let Some(log) = cycle.cycle_log.as_deref()
            && let Err(err) = self.history.append_cycle_summary(log, &cycle)
        {
            tracing::warn!("failed to append cycle summary: {err}");
        }
        if let Err(err) = self.history.record_cycle(&cycle) {
            tracing::warn!("failed to write cycle history: {err}");
        }

        let next_cycle_at = finished_at.saturating_add(self.settings.interval);
        let with_error = !succeeded
            || reconciliation
                .as_ref()
                .is_none_or(ReconciliationSummary::has_failures);
        let status = if with_error {
            DaemonStatus::WaitingNextCycleWithError
        } else {
            DaemonStatus::WaitingNextCycle
        };
        let detail = format!(
            "{} | {}",
            cycle.detail,
            reconciliation.as_ref().map_or_else(
                || "reconciliation[processing_error=true]".to_string(),
                ToString::to_string
            )
        );
        tracing::info!(
            status = %cycle.status,
            records = cycle.total_records,
            next = %clock::format_timestamp(next_cycle_at),
            "cycle finished"
        );
        self.persist(
            &DaemonState::active(status, pid, detail)
                .with_cycle(Some(started_at), Some(finished_at))
                .with_next_cycle(Some(next_cycle_at)),
        );

        FinishedCycle {
            started_at,
            finished_at,
            next_cycle_at,
        }
    }

    fn reconcile(
        &self,
        started_at: PrimitiveDateTime,
        finished_at: PrimitiveDateTime,
        succeeded: bool,
    ) -> Option<ReconciliationSummary> {
        let include_optional = self.settings.include_optional;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.reconciler
                .process_after_cycle(started_at, finished_at, succeeded, include_optional)
        }));
        match outcome {
            Ok(summary) => Some(summary),
            Err(_) => {
                tracing::error!("reconciliation panicked, recording a processing error");
                None
            }
        }
    }

    fn window_for(&self, today: Date) -> DateWindow {
        let start = today
            .checked_sub(Duration::days(i64::from(self.settings.window_days)))
            .unwrap_or(Date::MIN);
        DateWindow { start, end: today }
    }

    fn log_line(&self, log: Option<&Path>, line: &str) {
        if let Some(log) = log
            && let Err(err) = self.history.append_cycle_line(log, self.clock.now(), line)
        {
            tracing::warn!("failed to write cycle log: {err}");
        }
    }

    fn persist(&self, state: &DaemonState) {
        if let Err(err) = self.store.save_daemon_state(state) {
            tracing::warn!("failed to persist daemon state: {err}");
        }
    }
}

struct FinishedCycle {
    started_at: PrimitiveDateTime,
    finished_at: PrimitiveDateTime,
    next_cycle_at: PrimitiveDateTime,
}

/// Clears control files and persists STOPPED when the loop exits, including
/// by panic.
struct ShutdownGuard<'a> {
    store: &'a StateStore,
    detail: String,
    last_cycle: Option<(PrimitiveDateTime, PrimitiveDateTime)>,
}

impl<'a> ShutdownGuard<'a> {
    fn new(store: &'a StateStore) -> Self {
        Self {
            store,
            detail: "daemon exited unexpectedly".to_string(),
            last_cycle: None,
        }
    }
}

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.store.clear_control_files() {
            tracing::warn!("failed to clear control files: {err}");
        }
        let (started, finished) = self.last_cycle.unzip();
        let state = DaemonState::stopped(self.detail.clone()).with_cycle(started, finished);
        if let Err(err) = self.store.save_daemon_state(&state) {
            tracing::warn!("failed to persist STOPPED state: {err}");
        }
    }
}

#[derive(Default)]
struct CycleTally {
    entities: u32,
    complete: u32,
    /// Non-complete classifications other than `ERRO_API`.
    incomplete: u32,
    /// Pipeline failures plus `ERRO_API` classifications.
    errors: u32,
    records: u64,
    problems: Vec<String>,
    integrity_alert: Option<String>,
}

impl CycleTally {
    fn record(&mut self, entity: &str, report: &EntityReport, result: Classification) {
        self.entities += 1;
        self.records += report.save.persisted;
        match result.status {
            ExtractionStatus::Complete => self.complete += 1,
            ExtractionStatus::ApiError => {
                self.errors += 1;
                self.problems.push(format!("{entity}={}", result.status));
            }
            status => {
                self.incomplete += 1;
                self.problems
                    .push(format!("{entity}={status}({})", result.reason.code()));
            }
        }
    }

    fn record_failure(&mut self, entity: &str, err: &PipelineError) {
        self.entities += 1;
        self.errors += 1;
        self.problems.push(format!("{entity}: {err}"));
    }

    fn succeeded(&self) -> bool {
        self.incomplete == 0 && self.errors == 0
    }

    fn warnings(&self) -> u32 {
        self.incomplete + u32::from(self.integrity_alert.is_some())
    }

    fn status(&self) -> CycleStatus {
        if self.errors > 0 {
            CycleStatus::Error
        } else if self.warnings() > 0 {
            CycleStatus::Alert
        } else {
            CycleStatus::Success
        }
    }

    fn detail(&self) -> String {
        let mut detail = format!(
            "entities={} complete={} records={}",
            self.entities, self.complete, self.records
        );
        if !self.problems.is_empty() {
            detail.push_str(" | problems: ");
            detail.push_str(&self.problems.join(", "));
        }
        if let Some(alert) = &self.integrity_alert {
            detail.push_str(" | integrity alert: ");
            detail.push_str(alert);
        }
        detail
    }
}

fn entity_line(entity: &str, report: &EntityReport, result: Classification) -> String {
    format!(
        "entity={entity} status={} reason={} fetched={} unique={} persisted={} duplicates={} invalid={}",
        result.status,
        result.reason.code(),
        report.extraction.fetched,
        report.extraction.unique,
        report.save.persisted,
        report.save.duplicates,
        report.save.invalid,
    )
}

/// Build a runner from config and run it in the foreground.
pub fn run_from_config(
    config: &Config,
    paths: DaemonPaths,
    clock: Arc<dyn Clock>,
    include_optional: bool,
) -> crate::Result<RunReport> {
    let pipeline: Arc<dyn Pipeline> = Arc::new(
        CommandPipeline::from_config(&config.pipeline).ok_or(ConfigError::MissingPipelineProgram)?,
    );
    let classifier = Classifier::from_config(&config.classification);
    let store = StateStore::new(paths, clock.clone());

    let backfill = PipelineBackfill::new(
        pipeline.clone(),
        config.daemon.entities.clone(),
        classifier.clone(),
    );
    let reconciler = ReconciliationEngine::new(
        store.clone(),
        clock.clone(),
        ReconciliationSettings::from_config(&config.reconciliation),
        Box::new(backfill),
    );

    let shutdown = register_shutdown_signals().map_err(DaemonError::Signals)?;
    let poll = StdDuration::from_millis(config.daemon.poll_interval_ms.max(10));
    let waiter = PollingWait::new(store.clone(), clock.clone(), poll)
        .with_shutdown_flag(shutdown.clone());

    let runner = DaemonRunner::new(
        store,
        clock,
        pipeline,
        reconciler,
        Box::new(waiter),
        RunSettings::from_config(&config.daemon, include_optional),
    )
    .with_classifier(classifier)
    .with_shutdown_flag(shutdown);
    Ok(runner.run()?)
}
