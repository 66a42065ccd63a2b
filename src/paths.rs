//! Directory helpers for daemon state, config and logs.

use std::io;
use std::path::{Path, PathBuf};

/// Base directory for the daemon's working tree (state, control files, history).
///
/// Uses `INGEST_LOOP_DIR` if set, otherwise `$XDG_DATA_HOME/ingest-loop` or
/// `~/.local/share/ingest-loop`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("INGEST_LOOP_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("ingest-loop")
}

/// Base directory for configuration files.
///
/// Uses `INGEST_LOOP_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/ingest-loop`
/// or `~/.config/ingest-loop`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("INGEST_LOOP_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("ingest-loop")
}

/// Default directory for rolling diagnostic logs.
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Layout of one daemon working directory.
///
/// ```text
/// <root>/
///   runtime/daemon.state          daemon run state record
///   runtime/reconciliation.state  reconciliation backlog record
///   runtime/daemon.pid            process id of the active runner
///   runtime/daemon.stop           stop request flag
///   runtime/daemon.force_run      force-run request flag
///   cycles/<date>/cycle_*.log     one log per cycle
///   history/daemon_cycles_*.csv   monthly cycle history
///   history/reconciliation/...    monthly reconciliation history
///   logs/                         rolling diagnostic logs
///   daemon_console.log            stdout/stderr of a detached daemon
/// ```
#[derive(Clone, Debug)]
pub struct DaemonPaths {
    root: PathBuf,
    reconciliation_history_dir: Option<PathBuf>,
}

impl DaemonPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            reconciliation_history_dir: None,
        }
    }

    /// Place reconciliation history somewhere other than `history/reconciliation`.
    pub fn with_reconciliation_history_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.reconciliation_history_dir = dir;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join("runtime")
    }

    pub fn state_file(&self) -> PathBuf {
        self.runtime_dir().join("daemon.state")
    }

    pub fn reconciliation_state_file(&self) -> PathBuf {
        self.runtime_dir().join("reconciliation.state")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.runtime_dir().join("daemon.pid")
    }

    pub fn stop_file(&self) -> PathBuf {
        self.runtime_dir().join("daemon.stop")
    }

    pub fn force_run_file(&self) -> PathBuf {
        self.runtime_dir().join("daemon.force_run")
    }

    pub fn cycles_dir(&self) -> PathBuf {
        self.root.join("cycles")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    pub fn reconciliation_history_dir(&self) -> PathBuf {
        self.reconciliation_history_dir
            .clone()
            .unwrap_or_else(|| self.history_dir().join("reconciliation"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn console_log(&self) -> PathBuf {
        self.root.join("daemon_console.log")
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [
            self.runtime_dir(),
            self.cycles_dir(),
            self.history_dir(),
            self.reconciliation_history_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
