use std::collections::BTreeSet;
use std::fs;
use std::sync::{Arc, Mutex};

use ingest_loop::daemon::reconcile::{BackfillError, ReconciliationSettings};
use time::Date;
use time::macros::{date, datetime};

use crate::fixtures::daemon_dir::{START, TestDaemon};

fn settings(max_attempts_per_cycle: usize) -> ReconciliationSettings {
    ReconciliationSettings {
        enabled: true,
        max_attempts_per_cycle,
        failure_lookback_days: 1,
    }
}

#[test]
fn backlog_survives_restart_and_drains_within_budget() {
    let daemon = TestDaemon::new();
    let failing = Arc::new(Mutex::new(true));

    let flag = failing.clone();
    let engine = daemon.engine(settings(1), move |date: Date, _: bool| {
        if *flag.lock().expect("flag lock") {
            Err(BackfillError::new(format!("upstream down for {date}")))
        } else {
            Ok(())
        }
    });
    let first = engine.process_after_cycle(START, START, false, true);
    assert_eq!(first.executed, 0);
    assert_eq!(first.failed, 1);
    assert_eq!(first.remaining, [date!(2024-07-31), date!(2024-08-01)]);
    drop(engine);

    // A new process over the same directory picks the backlog up.
    *failing.lock().expect("flag lock") = false;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let restarted = ingest_loop::daemon::reconcile::ReconciliationEngine::new(
        daemon.reopen(),
        daemon.clock.clone(),
        settings(1),
        Box::new(move |date: Date, _: bool| -> Result<(), BackfillError> {
            record.lock().expect("seen lock").push(date);
            Ok(())
        }),
    );

    let second = restarted.process_after_cycle(START, START, true, true);
    assert_eq!(second.executed, 1);
    assert_eq!(second.remaining, [date!(2024-08-01)]);
    let third = restarted.process_after_cycle(START, START, true, true);
    assert_eq!(third.executed, 1);
    assert!(third.remaining.is_empty());
    assert_eq!(
        seen.lock().expect("seen").as_slice(),
        [date!(2024-07-31), date!(2024-08-01)]
    );

    let state = daemon.reopen().load_reconciliation_state().expect("load");
    assert!(state.pending.is_empty());
    assert_eq!(state.last_successful, Some(date!(2024-08-01)));
    assert_eq!(state.last_daily_scheduled, Some(date!(2024-07-31)));
    assert!(state.last_error.is_empty());
}

#[test]
fn daily_backfill_is_scheduled_once_per_day() {
    let daemon = TestDaemon::new();
    let engine = daemon.engine(settings(2), |_: Date, _: bool| -> Result<(), BackfillError> {
        Ok(())
    });

    let morning = engine.process_after_cycle(START, START, true, false);
    assert!(morning.scheduled_daily_backfill);
    assert_eq!(morning.executed, 1);

    daemon.clock.set(datetime!(2024-08-01 18:00:00));
    let evening = engine.process_after_cycle(START, START, true, false);
    assert!(!evening.scheduled_daily_backfill);
    assert_eq!(evening.executed, 0);

    daemon.clock.set(datetime!(2024-08-02 00:30:00));
    let next_day = engine.process_after_cycle(START, START, true, false);
    assert!(next_day.scheduled_daily_backfill);
    assert_eq!(next_day.executed, 1);
}

#[test]
fn corrupt_state_is_quarantined_and_replaced() {
    let daemon = TestDaemon::new();
    let path = daemon.paths().reconciliation_state_file();
    fs::write(&path, "pending = [[[not toml").expect("write corrupt state");

    let engine = daemon.engine(settings(2), |_: Date, _: bool| -> Result<(), BackfillError> {
        Ok(())
    });
    let summary = engine.process_after_cycle(START, START, true, true);
    assert!(summary.active);
    assert!(summary.scheduled_daily_backfill);

    let quarantined: Vec<String> = fs::read_dir(daemon.paths().runtime_dir())
        .expect("read runtime dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".corrupt-"))
        .collect();
    assert_eq!(quarantined.len(), 1, "{quarantined:?}");

    let state = daemon.reopen().load_reconciliation_state().expect("reload");
    assert_eq!(state.pending, BTreeSet::new());
    assert_eq!(state.last_successful, Some(date!(2024-07-31)));
}

#[test]
fn undecodable_backlog_is_quarantined_not_overwritten() {
    let daemon = TestDaemon::new();
    let path = daemon.paths().reconciliation_state_file();
    let mut damaged = b"pending_dates = \"2024-06-01,2024-06-02\"\n".to_vec();
    damaged.extend_from_slice(&[0xFF, 0xFE]);
    fs::write(&path, &damaged).expect("write damaged state");

    let engine = daemon.engine(settings(2), |_: Date, _: bool| -> Result<(), BackfillError> {
        Ok(())
    });
    let summary = engine.process_after_cycle(START, START, true, true);
    assert!(summary.scheduled_daily_backfill);

    let moved: Vec<_> = fs::read_dir(daemon.paths().runtime_dir())
        .expect("read runtime dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"))
        .collect();
    assert_eq!(moved.len(), 1);
    assert_eq!(fs::read(moved[0].path()).expect("read moved record"), damaged);
}

#[test]
fn disabled_engine_never_touches_state() {
    let daemon = TestDaemon::new();
    let engine = daemon.engine(
        ReconciliationSettings {
            enabled: false,
            ..settings(2)
        },
        |_: Date, _: bool| -> Result<(), BackfillError> { panic!("must not run") },
    );
    let summary = engine.process_after_cycle(START, START, false, true);
    assert!(!summary.active);
    assert_eq!(summary.to_string(), "reconciliation[inactive]");
    assert!(!daemon.paths().reconciliation_state_file().exists());
}
