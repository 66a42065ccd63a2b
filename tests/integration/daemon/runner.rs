use std::sync::{Arc, Mutex};

use ingest_loop::config::EntityConfig;
use ingest_loop::daemon::reconcile::{BackfillError, ReconciliationSettings};
use ingest_loop::{DaemonStatus, StopReason};
use time::Date;
use time::macros::date;

use crate::fixtures::daemon_dir::TestDaemon;
use crate::fixtures::pipeline::{Scripted, ScriptedPipeline, stopped};
use crate::fixtures::wait::{Signal, SignalScript};

type Calls = Arc<Mutex<Vec<(Date, bool)>>>;

fn recording_executor() -> (
    Calls,
    impl Fn(Date, bool) -> Result<(), BackfillError> + Send + Sync + 'static,
) {
    let calls: Calls = Arc::default();
    let seen = calls.clone();
    let executor = move |date: Date, include_optional: bool| -> Result<(), BackfillError> {
        seen.lock().expect("calls lock").push((date, include_optional));
        Ok(())
    };
    (calls, executor)
}

#[test]
fn stop_leaves_no_control_files_and_persists_stopped() {
    let daemon = TestDaemon::new();
    // A stale stop request from a previous run must not prevent startup.
    daemon.store.request_stop().expect("stale stop");

    let pipeline = Arc::new(ScriptedPipeline::new());
    let (_, executor) = recording_executor();
    let script = SignalScript::new(&daemon.store, daemon.clock.clone(), &[Signal::Stop]);
    let runner = daemon.runner(
        pipeline.clone(),
        vec![EntityConfig::new("freight")],
        true,
        daemon.engine(ReconciliationSettings::default(), executor),
        Box::new(script),
    );

    let report = runner.run().expect("run");
    assert_eq!(report.cycles, 1);
    assert_eq!(pipeline.calls(), ["freight"]);

    let paths = daemon.paths();
    assert!(!paths.pid_file().exists());
    assert!(!paths.stop_file().exists());
    assert!(!paths.force_run_file().exists());

    let state = daemon.reopen().load_daemon_state().expect("load");
    assert_eq!(state.status, DaemonStatus::Stopped);
    assert_eq!(state.pid, None);
    assert_eq!(state.detail, "stopped on request");
    assert!(state.cycle_finished_at.is_some());
}

#[test]
fn force_run_starts_exactly_one_extra_cycle() {
    let daemon = TestDaemon::new();
    let pipeline = Arc::new(ScriptedPipeline::new());
    let (_, executor) = recording_executor();
    let script = SignalScript::new(
        &daemon.store,
        daemon.clock.clone(),
        &[Signal::ForceRun, Signal::Stop],
    );
    let snapshots = script.snapshots();
    let runner = daemon.runner(
        pipeline.clone(),
        vec![EntityConfig::new("freight")],
        true,
        daemon.engine(ReconciliationSettings::default(), executor),
        Box::new(script),
    );

    let report = runner.run().expect("run");
    assert_eq!(report.cycles, 2);
    assert_eq!(pipeline.calls(), ["freight", "freight"]);
    assert!(!daemon.paths().force_run_file().exists());

    let snapshots = snapshots.lock().expect("snapshots");
    assert_eq!(snapshots.len(), 2);
    for state in snapshots.iter() {
        assert_eq!(state.status, DaemonStatus::WaitingNextCycle);
        assert_eq!(state.pid, Some(std::process::id()));
        assert!(state.next_cycle_at > state.cycle_finished_at);
    }
}

#[test]
fn skip_optional_reaches_cycle_and_every_backfill() {
    let daemon = TestDaemon::new();
    let pipeline = Arc::new(
        ScriptedPipeline::new().with(
            "freight",
            Scripted::Report(stopped(40, StopReason::PageLimit)),
        ),
    );
    let (calls, executor) = recording_executor();
    let settings = ReconciliationSettings {
        max_attempts_per_cycle: 10,
        ..ReconciliationSettings::default()
    };
    let script = SignalScript::new(
        &daemon.store,
        daemon.clock.clone(),
        &[Signal::ForceRun, Signal::Stop],
    );
    let runner = daemon.runner(
        pipeline.clone(),
        vec![
            EntityConfig::new("freight"),
            EntityConfig::optional("invoices_graphql"),
        ],
        false,
        daemon.engine(settings, executor),
        Box::new(script),
    );

    runner.run().expect("run");

    assert!(!pipeline.calls().iter().any(|name| name == "invoices_graphql"));
    let calls = calls.lock().expect("calls");
    assert!(!calls.is_empty(), "incomplete cycles must trigger backfill");
    assert!(calls.iter().all(|(_, include_optional)| !include_optional));
    let dates: Vec<Date> = calls.iter().map(|(date, _)| *date).collect();
    assert!(dates.contains(&date!(2024-07-31)));
    assert!(dates.contains(&date!(2024-08-01)));
}

#[test]
fn integrity_failure_ends_sweep_as_alert() {
    let daemon = TestDaemon::new();
    let pipeline = Arc::new(
        ScriptedPipeline::new().with("pickups", Scripted::Integrity("totals mismatch".into())),
    );
    let (calls, executor) = recording_executor();
    let script = SignalScript::new(&daemon.store, daemon.clock.clone(), &[Signal::Stop]);
    let snapshots = script.snapshots();
    let runner = daemon.runner(
        pipeline.clone(),
        vec![
            EntityConfig::new("freight"),
            EntityConfig::new("pickups"),
            EntityConfig::new("invoices"),
        ],
        true,
        daemon.engine(ReconciliationSettings::default(), executor),
        Box::new(script),
    );

    runner.run().expect("run");

    assert_eq!(pipeline.calls(), ["freight", "pickups"]);
    let state = &snapshots.lock().expect("snapshots")[0];
    assert_eq!(state.status, DaemonStatus::WaitingNextCycle);
    assert!(state.detail.contains("integrity alert"), "{}", state.detail);

    assert!(daemon.cycle_history().contains(";ALERT;"));
    // Only the daily backfill; the cycle itself did not fail.
    assert_eq!(
        calls.lock().expect("calls").as_slice(),
        [(date!(2024-07-31), true)]
    );
}

#[test]
fn entity_failure_does_not_stop_the_cycle() {
    let daemon = TestDaemon::new();
    let pipeline = Arc::new(
        ScriptedPipeline::new().with("freight", Scripted::Fail("connection refused".into())),
    );
    let (calls, executor) = recording_executor();
    let script = SignalScript::new(&daemon.store, daemon.clock.clone(), &[Signal::Stop]);
    let snapshots = script.snapshots();
    let runner = daemon.runner(
        pipeline.clone(),
        vec![EntityConfig::new("freight"), EntityConfig::new("pickups")],
        true,
        daemon.engine(ReconciliationSettings::default(), executor),
        Box::new(script),
    );

    runner.run().expect("run");

    assert_eq!(pipeline.calls(), ["freight", "pickups"]);
    let state = &snapshots.lock().expect("snapshots")[0];
    assert_eq!(state.status, DaemonStatus::WaitingNextCycleWithError);
    assert!(state.detail.contains("connection refused"));
    assert!(state.detail.contains("for_failure=true"));

    assert!(daemon.cycle_history().contains(";ERROR;"));
    let backfilled: Vec<Date> = calls
        .lock()
        .expect("calls")
        .iter()
        .map(|(date, _)| *date)
        .collect();
    assert_eq!(backfilled, [date!(2024-07-31), date!(2024-08-01)]);
}

#[test]
fn reconciliation_panic_is_recorded_as_processing_error() {
    let daemon = TestDaemon::new();
    let executor = |_: Date, _: bool| -> Result<(), BackfillError> {
        panic!("executor exploded");
    };
    let script = SignalScript::new(&daemon.store, daemon.clock.clone(), &[Signal::Stop]);
    let snapshots = script.snapshots();
    let runner = daemon.runner(
        Arc::new(ScriptedPipeline::new()),
        vec![EntityConfig::new("freight")],
        true,
        daemon.engine(ReconciliationSettings::default(), executor),
        Box::new(script),
    );

    let report = runner.run().expect("run survives");
    assert_eq!(report.cycles, 1);

    let state = &snapshots.lock().expect("snapshots")[0];
    assert_eq!(state.status, DaemonStatus::WaitingNextCycleWithError);
    assert!(state.detail.contains("processing_error"));
    assert!(daemon.reconciliation_history().contains(";ERRO_PROCESSAMENTO;"));
    assert!(daemon.cycle_history().contains(";SUCCESS;"));
}

#[test]
fn unwritable_state_records_do_not_stop_the_daemon() {
    let daemon = TestDaemon::new();
    std::fs::create_dir_all(daemon.paths().state_file()).expect("block daemon state");
    std::fs::create_dir_all(daemon.paths().reconciliation_state_file())
        .expect("block reconciliation state");

    let pipeline = Arc::new(ScriptedPipeline::new());
    let (calls, executor) = recording_executor();
    let script = SignalScript::new(&daemon.store, daemon.clock.clone(), &[Signal::Stop]);
    let runner = daemon.runner(
        pipeline.clone(),
        vec![EntityConfig::new("freight")],
        true,
        daemon.engine(ReconciliationSettings::default(), executor),
        Box::new(script),
    );

    let report = runner.run().expect("run completes");
    assert_eq!(report.cycles, 1);
    assert_eq!(pipeline.calls(), ["freight"]);
    assert_eq!(
        calls.lock().expect("calls").as_slice(),
        [(date!(2024-07-31), true)]
    );
    assert!(daemon.cycle_history().contains(";SUCCESS;"));
    assert!(daemon.reconciliation_history().contains(";EXECUTADA;"));
    assert!(!daemon.paths().pid_file().exists());
    assert!(!daemon.paths().stop_file().exists());
}

#[test]
fn cycle_log_is_written_under_its_date() {
    let daemon = TestDaemon::new();
    let (_, executor) = recording_executor();
    let script = SignalScript::new(&daemon.store, daemon.clock.clone(), &[Signal::Stop]);
    let runner = daemon.runner(
        Arc::new(ScriptedPipeline::new()),
        vec![EntityConfig::new("freight")],
        true,
        daemon.engine(ReconciliationSettings::default(), executor),
        Box::new(script),
    );
    runner.run().expect("run");

    let log = daemon
        .paths()
        .cycles_dir()
        .join("2024-08-01")
        .join("cycle_2024-08-01_12-00-00.log");
    let text = std::fs::read_to_string(&log).expect("cycle log");
    assert!(text.contains("entity=freight status=COMPLETO reason=OK"));
    assert!(text.contains("==== cycle summary ===="));
    assert!(text.contains("total_records: 10"));
}
