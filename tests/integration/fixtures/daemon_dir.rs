//! Scratch daemon working directory with a manual clock.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use ingest_loop::ManualClock;
use ingest_loop::config::EntityConfig;
use ingest_loop::daemon::reconcile::{
    ReconciliationEngine, ReconciliationExecutor, ReconciliationSettings,
};
use ingest_loop::daemon::run::{CycleWait, DaemonRunner, RunSettings};
use ingest_loop::daemon::state_store::StateStore;
use ingest_loop::paths::DaemonPaths;
use ingest_loop::pipeline::Pipeline;
use tempfile::TempDir;
use time::macros::datetime;
use time::{Duration, PrimitiveDateTime};

pub const START: PrimitiveDateTime = datetime!(2024-08-01 12:00:00);

pub struct TestDaemon {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub store: StateStore,
}

impl TestDaemon {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let clock = Arc::new(ManualClock::new(START));
        let store = StateStore::new(DaemonPaths::new(dir.path()), clock.clone());
        store.ensure_dirs().expect("ensure daemon dirs");
        Self { dir, clock, store }
    }

    pub fn paths(&self) -> &DaemonPaths {
        self.store.paths()
    }

    /// A store over the same directory, as a restarted process would see it.
    pub fn reopen(&self) -> StateStore {
        StateStore::new(DaemonPaths::new(self.dir.path()), self.clock.clone())
    }

    pub fn engine(
        &self,
        settings: ReconciliationSettings,
        executor: impl ReconciliationExecutor + 'static,
    ) -> ReconciliationEngine {
        ReconciliationEngine::new(
            self.store.clone(),
            self.clock.clone(),
            settings,
            Box::new(executor),
        )
    }

    pub fn runner(
        &self,
        pipeline: Arc<dyn Pipeline>,
        entities: Vec<EntityConfig>,
        include_optional: bool,
        engine: ReconciliationEngine,
        waiter: Box<dyn CycleWait>,
    ) -> DaemonRunner {
        let settings = RunSettings {
            entities,
            include_optional,
            interval: Duration::minutes(30),
            window_days: 1,
            pid: std::process::id(),
        };
        DaemonRunner::new(
            self.store.clone(),
            self.clock.clone(),
            pipeline,
            engine,
            waiter,
            settings,
        )
    }

    pub fn cycle_history(&self) -> String {
        read(self.paths().history_dir().join("daemon_cycles_2024_08.csv"))
    }

    pub fn reconciliation_history(&self) -> String {
        read(
            self.paths()
                .reconciliation_history_dir()
                .join("reconciliation_2024_08.csv"),
        )
    }
}

fn read(path: PathBuf) -> String {
    fs::read_to_string(&path).unwrap_or_else(|err| panic!("read {}: {err}", path.display()))
}
