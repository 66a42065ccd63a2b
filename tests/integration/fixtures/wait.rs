//! Scripted operator signals delivered through the real control files.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ingest_loop::daemon::run::{CycleWait, PollingWait, WaitResult};
use ingest_loop::daemon::state_store::{DaemonState, StateStore};
use ingest_loop::Clock;
use time::PrimitiveDateTime;

#[derive(Clone, Copy, Debug)]
pub enum Signal {
    ForceRun,
    Stop,
}

/// On every wait, writes the next scripted control file and then waits like
/// the daemon would. Snapshots the persisted daemon state first (when it is
/// readable), so tests can inspect what each cycle left behind.
pub struct SignalScript {
    store: StateStore,
    inner: PollingWait,
    signals: Mutex<VecDeque<Signal>>,
    snapshots: Arc<Mutex<Vec<DaemonState>>>,
}

impl SignalScript {
    pub fn new(store: &StateStore, clock: Arc<dyn Clock>, signals: &[Signal]) -> Self {
        Self {
            store: store.clone(),
            inner: PollingWait::new(store.clone(), clock, Duration::from_millis(5)),
            signals: Mutex::new(signals.iter().copied().collect()),
            snapshots: Arc::default(),
        }
    }

    pub fn snapshots(&self) -> Arc<Mutex<Vec<DaemonState>>> {
        self.snapshots.clone()
    }
}

impl CycleWait for SignalScript {
    fn wait_until(&self, deadline: PrimitiveDateTime) -> WaitResult {
        if let Ok(state) = self.store.load_daemon_state() {
            self.snapshots.lock().expect("snapshots lock").push(state);
        }

        let next = self
            .signals
            .lock()
            .expect("signals lock")
            .pop_front()
            .unwrap_or(Signal::Stop);
        match next {
            Signal::ForceRun => self.store.request_force_run().expect("request force-run"),
            Signal::Stop => self.store.request_stop().expect("request stop"),
        }
        self.inner.wait_until(deadline)
    }
}
