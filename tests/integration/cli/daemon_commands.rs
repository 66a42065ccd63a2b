//! Runs the `ingest-loop` binary against scratch directories.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct Sandbox {
    root: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let root = TempDir::new().expect("create sandbox");
        fs::create_dir_all(root.path().join("config")).expect("config dir");
        fs::create_dir_all(root.path().join("daemon")).expect("daemon dir");
        Self { root }
    }

    fn daemon_dir(&self) -> PathBuf {
        self.root.path().join("daemon")
    }

    fn write_config(&self, toml: &str) {
        fs::write(self.root.path().join("config").join("config.toml"), toml)
            .expect("write config");
    }

    fn cmd(&self) -> Command {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("ingest-loop");
        cmd.current_dir(self.root.path());
        cmd.env("INGEST_LOOP_CONFIG_DIR", self.root.path().join("config"));
        cmd.env("INGEST_LOOP_DIR", self.daemon_dir());
        cmd.env("INGEST_LOOP_TESTING", "1");
        cmd.env_remove("INGEST_LOOP_LOG");
        cmd
    }

    fn state_file(&self) -> PathBuf {
        self.daemon_dir().join("runtime").join("daemon.state")
    }
}

fn wait_for(path: &Path, needle: &str, timeout: Duration) -> String {
    let deadline = Instant::now() + timeout;
    loop {
        let contents = fs::read_to_string(path).unwrap_or_default();
        if contents.contains(needle) {
            return contents;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {needle:?} in {}: {contents}",
            path.display()
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn status_on_fresh_directory_is_stopped() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("status:         STOPPED"))
        .stdout(predicate::str::contains("daemon_console.log"));
}

#[test]
fn status_json_is_machine_readable() {
    let sandbox = Sandbox::new();
    let output = sandbox
        .cmd()
        .args(["daemon", "status", "--json"])
        .output()
        .expect("run status");
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(value["status"], "STOPPED");
    assert_eq!(value["alive"], false);
    assert!(value["pid"].is_null());
}

#[test]
fn stop_and_force_run_without_daemon_are_harmless() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon not running"));
    sandbox
        .cmd()
        .args(["daemon", "force-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to force"));
    assert!(!sandbox.daemon_dir().join("runtime").join("daemon.force_run").exists());
}

#[test]
fn reconciliation_show_on_empty_backlog() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["reconciliation", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pending:          none"));
}

#[test]
fn foreground_run_without_pipeline_is_a_config_error() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["daemon", "run"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("pipeline.program is not configured"));
}

#[test]
fn start_reports_daemon_that_dies_during_startup() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["daemon", "start"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("exited during startup"));

    sandbox
        .cmd()
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("STOPPED"));
    assert!(!sandbox.daemon_dir().join("runtime").join("daemon.pid").exists());
}

#[test]
fn start_run_cycle_then_stop() {
    let sandbox = Sandbox::new();
    sandbox.write_config(
        r#"
[daemon]
interval_minutes = 60
poll_interval_ms = 50

[[daemon.entities]]
name = "freight"

[[daemon.entities]]
name = "invoices_graphql"
optional = true

[pipeline]
program = "sh"
args = ["-c", "echo '{\"extraction\":{\"fetched\":3,\"unique\":3},\"save\":{\"persisted\":3}}'", "pipeline", "{entity}"]
"#,
    );

    sandbox
        .cmd()
        .args(["daemon", "start", "--skip-optional"])
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon started"));

    let state = wait_for(
        &sandbox.state_file(),
        "WAITING_NEXT_CYCLE",
        Duration::from_secs(20),
    );
    assert!(state.contains("records=3"), "{state}");

    sandbox
        .cmd()
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon stopped"));

    sandbox
        .cmd()
        .args(["daemon", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("status:         STOPPED"));
    let runtime = sandbox.daemon_dir().join("runtime");
    assert!(!runtime.join("daemon.pid").exists());
    assert!(!runtime.join("daemon.stop").exists());

    let history = fs::read_dir(sandbox.daemon_dir().join("history"))
        .expect("history dir")
        .filter_map(|entry| entry.ok())
        .any(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("daemon_cycles_")
        });
    assert!(history, "cycle history written");
}
