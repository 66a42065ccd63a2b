//! Operator actions against a daemon working directory.
//!
//! These run in short-lived CLI processes next to the daemon. They only touch
//! the control files and the daemon state record, plus OS signals as the last
//! resort in `stop`.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;

use super::state_store::{DaemonState, DaemonStatus, StateError, StateStore};
use crate::clock;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("failed to launch daemon process: {0}")]
    Spawn(#[source] io::Error),
    #[error("daemon exited during startup ({status}); see {}", .log.display())]
    StartFailed { status: String, log: PathBuf },
    #[error("daemon still running after stop; surviving pids: {pids:?}")]
    StillRunning { pids: Vec<u32> },
    #[error("failed to send {signal} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: Signal,
        #[source]
        source: Errno,
    },
}

/// Grace periods for `start` and `stop`.
#[derive(Clone, Copy, Debug)]
pub struct LifecycleTimings {
    pub startup_probe: Duration,
    pub stop_grace: Duration,
    pub term_grace: Duration,
    pub kill_grace: Duration,
    pub poll: Duration,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self {
            startup_probe: Duration::from_millis(1200),
            stop_grace: Duration::from_secs(20),
            term_grace: Duration::from_secs(2),
            kill_grace: Duration::from_secs(1),
            poll: Duration::from_millis(200),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// A live daemon was found; it was asked to run a cycle now instead.
    AlreadyRunning { pid: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { pid: u32, forced: bool },
    NotRunning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForceRunOutcome {
    Requested { pid: u32 },
    NotRunning,
}

pub struct Lifecycle {
    store: StateStore,
    program: PathBuf,
    timings: LifecycleTimings,
}

impl Lifecycle {
    /// Operate on `store`, spawning the current executable for `start`.
    pub fn new(store: StateStore) -> Self {
        let program = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("ingest-loop"));
        Self {
            store,
            program,
            timings: LifecycleTimings::default(),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timings(mut self, timings: LifecycleTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn start(&self, include_optional: bool) -> Result<StartOutcome, LifecycleError> {
        if let Some(pid) = self.live_pid()? {
            tracing::info!(pid, "daemon already running, requesting force-run");
            self.store.request_force_run()?;
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        self.store.ensure_dirs()?;
        self.store.clear_control_files()?;
        let previous = self.store.load_daemon_state()?;
        if !previous.is_stopped() {
            self.store.save_daemon_state(
                &DaemonState::stopped("previous daemon no longer running")
                    .with_cycle(previous.cycle_started_at, previous.cycle_finished_at),
            )?;
        }

        let paths = self.store.paths();
        let console = paths.console_log();
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&console)
            .map_err(|source| StateError::io(&console, source))?;
        let log_err = log
            .try_clone()
            .map_err(|source| StateError::io(&console, source))?;

        let mut command = Command::new(&self.program);
        command
            .arg("--dir")
            .arg(paths.root())
            .arg("daemon")
            .arg("run");
        if !include_optional {
            command.arg("--skip-optional");
        }
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(LifecycleError::Spawn)?;

        let pid = child.id();
        self.mark_starting(pid)?;
        tracing::info!(pid, "daemon spawned");

        thread::sleep(self.timings.startup_probe);
        match child.try_wait() {
            Ok(Some(status)) => {
                self.store.clear_pid()?;
                let current = self.store.load_daemon_state()?;
                if !current.is_stopped() {
                    self.store.save_daemon_state(&DaemonState::stopped(format!(
                        "daemon exited during startup ({status})"
                    )))?;
                }
                Err(LifecycleError::StartFailed {
                    status: status.to_string(),
                    log: console,
                })
            }
            Ok(None) => Ok(StartOutcome::Started { pid }),
            Err(err) => {
                tracing::warn!(pid, "could not probe daemon after spawn: {err}");
                Ok(StartOutcome::Started { pid })
            }
        }
    }

    pub fn stop(&self) -> Result<StopOutcome, LifecycleError> {
        let Some(pid) = self.live_pid()? else {
            self.mark_stopped("daemon not running")?;
            return Ok(StopOutcome::NotRunning);
        };

        self.store.request_stop()?;
        self.store.save_daemon_state(&DaemonState::active(
            DaemonStatus::Stopping,
            pid,
            "stop requested",
        ))?;
        tracing::info!(pid, "stop requested, waiting for daemon to exit");

        if self.wait_for_exit(pid, self.timings.stop_grace) {
            self.finish_stop("stopped on request")?;
            return Ok(StopOutcome::Stopped { pid, forced: false });
        }

        for (sig, grace) in [
            (Signal::SIGTERM, self.timings.term_grace),
            (Signal::SIGKILL, self.timings.kill_grace),
        ] {
            tracing::warn!(pid, signal = %sig, "daemon did not exit in time, signalling");
            send_signal(pid, sig)?;
            if self.wait_for_exit(pid, grace) {
                self.finish_stop(&format!("stopped after {sig}"))?;
                return Ok(StopOutcome::Stopped { pid, forced: true });
            }
        }

        self.store.save_daemon_state(&DaemonState::active(
            DaemonStatus::Stopping,
            pid,
            format!("stop failed; surviving pids: {pid}"),
        ))?;
        Err(LifecycleError::StillRunning { pids: vec![pid] })
    }

    /// Read the daemon state, repairing it to STOPPED when the recorded
    /// process is gone.
    pub fn status(&self) -> Result<StatusReport, LifecycleError> {
        let mut state = self.store.load_daemon_state()?;
        let recorded = match state.pid {
            Some(pid) => Some(pid),
            None => self.store.read_pid()?,
        };
        let alive = recorded.filter(|pid| process_alive(*pid));

        let mut repaired = false;
        if let Some(pid) = recorded
            && alive.is_none()
        {
            tracing::info!(pid, "recorded daemon process is gone, repairing state");
            self.store.clear_control_files()?;
            if !state.is_stopped() {
                let detail = format!("process {pid} no longer running; last: {}", state.detail);
                state = self.store.save_daemon_state(
                    &DaemonState::stopped(detail)
                        .with_cycle(state.cycle_started_at, state.cycle_finished_at),
                )?;
            }
            repaired = true;
        }

        let paths = self.store.paths();
        Ok(StatusReport {
            state,
            alive_pid: alive,
            repaired,
            console_log: paths.console_log(),
            log_dir: paths.log_dir(),
        })
    }

    pub fn force_run(&self) -> Result<ForceRunOutcome, LifecycleError> {
        match self.live_pid()? {
            Some(pid) => {
                self.store.request_force_run()?;
                Ok(ForceRunOutcome::Requested { pid })
            }
            None => Ok(ForceRunOutcome::NotRunning),
        }
    }

    /// First live pid among the pid file and the state record.
    fn live_pid(&self) -> Result<Option<u32>, LifecycleError> {
        let from_file = self.store.read_pid()?;
        let from_state = self.store.load_daemon_state()?.pid;
        Ok([from_file, from_state]
            .into_iter()
            .flatten()
            .find(|pid| process_alive(*pid)))
    }

    fn wait_for_exit(&self, pid: u32, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if !process_alive(pid) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(self.timings.poll.min(deadline - now));
        }
    }

    /// Record `STARTING` unless the spawned daemon already wrote its own state.
    fn mark_starting(&self, pid: u32) -> Result<(), LifecycleError> {
        let state = self.store.load_daemon_state()?;
        if state.is_stopped() {
            self.store.save_daemon_state(&DaemonState::active(
                DaemonStatus::Starting,
                pid,
                "daemon starting",
            ))?;
        }
        Ok(())
    }

    fn finish_stop(&self, detail: &str) -> Result<(), LifecycleError> {
        self.store.clear_control_files()?;
        let state = self.store.load_daemon_state()?;
        if !state.is_stopped() {
            self.store.save_daemon_state(
                &DaemonState::stopped(detail)
                    .with_cycle(state.cycle_started_at, state.cycle_finished_at),
            )?;
        }
        Ok(())
    }

    fn mark_stopped(&self, detail: &str) -> Result<(), LifecycleError> {
        self.store.clear_control_files()?;
        let state = self.store.load_daemon_state()?;
        if !state.is_stopped() {
            self.store.save_daemon_state(&DaemonState::stopped(detail))?;
        }
        Ok(())
    }
}

fn send_signal(pid: u32, sig: Signal) -> Result<(), LifecycleError> {
    let Ok(raw) = i32::try_from(pid) else {
        return Ok(());
    };
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(LifecycleError::Signal {
            pid,
            signal: sig,
            source,
        }),
    }
}

/// Whether `pid` names a live, non-zombie process.
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // Field 3 follows the parenthesised command name, which may contain spaces.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state == "Z")
}

#[derive(Clone, Debug)]
pub struct StatusReport {
    pub state: DaemonState,
    pub alive_pid: Option<u32>,
    /// The record pointed at a dead process and was rewritten as STOPPED.
    pub repaired: bool,
    pub console_log: PathBuf,
    pub log_dir: PathBuf,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stamp = |value: Option<time::PrimitiveDateTime>| {
            value.map_or_else(|| "-".to_string(), clock::format_timestamp)
        };
        let state = &self.state;
        writeln!(f, "status:         {}", state.status)?;
        match (state.pid, self.alive_pid) {
            (Some(pid), Some(_)) => writeln!(f, "pid:            {pid} (alive)")?,
            (Some(pid), None) => writeln!(f, "pid:            {pid} (not running)")?,
            (None, _) => writeln!(f, "pid:            -")?,
        }
        writeln!(f, "updated:        {}", stamp(state.updated_at))?;
        writeln!(f, "cycle started:  {}", stamp(state.cycle_started_at))?;
        writeln!(f, "cycle finished: {}", stamp(state.cycle_finished_at))?;
        writeln!(f, "next cycle:     {}", stamp(state.next_cycle_at))?;
        if !state.detail.is_empty() {
            writeln!(f, "detail:         {}", state.detail)?;
        }
        if self.repaired {
            writeln!(f, "note:           stale daemon record repaired")?;
        }
        writeln!(f, "console log:    {}", self.console_log.display())?;
        write!(f, "logs:           {}", self.log_dir.display())
    }
}
