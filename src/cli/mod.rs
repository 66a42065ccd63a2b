//! CLI surface for ingest-loop.
//!
//! Thin handlers: parse, map onto a daemon [`Mode`], dispatch.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::clock::{Clock, SystemClock};
use crate::config::{self, Config};
use crate::daemon::lifecycle::Lifecycle;
use crate::daemon::{Dispatcher, Mode, StateStore, run_from_config};
use crate::paths::{self, DaemonPaths};
use crate::Result;

mod render;

// =============================================================================
// Entry + global options
// =============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "ingest-loop",
    version,
    about = "Scheduled ingestion daemon with automatic reconciliation",
    infer_subcommands = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Machine-readable JSON output.
    #[arg(long, global = true)]
    pub json: bool,

    /// Daemon working directory (default: $INGEST_LOOP_DIR or the user data dir).
    #[arg(long, global = true, value_name = "PATH")]
    pub dir: Option<PathBuf>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Daemon control.
    Daemon {
        #[command(subcommand)]
        cmd: DaemonCmd,
    },

    /// Inspect the reconciliation backlog.
    #[command(alias = "recon")]
    Reconciliation {
        #[command(subcommand)]
        cmd: ReconciliationCmd,
    },
}

#[derive(Subcommand, Debug)]
pub enum DaemonCmd {
    /// Start the daemon in the background (or force a cycle if it is running).
    Start(EntityArgs),
    /// Ask the daemon to stop, escalating to signals if it does not.
    Stop,
    /// Show daemon status.
    Status,
    /// Run the daemon in the foreground (used by `start`).
    Run(EntityArgs),
    /// Start the next cycle now.
    #[command(alias = "force")]
    ForceRun,
}

impl DaemonCmd {
    pub fn mode(&self) -> (Mode, bool) {
        match self {
            DaemonCmd::Start(args) => (Mode::Start, args.include_optional()),
            DaemonCmd::Stop => (Mode::Stop, true),
            DaemonCmd::Status => (Mode::Status, true),
            DaemonCmd::Run(args) => (Mode::Run, args.include_optional()),
            DaemonCmd::ForceRun => (Mode::ForceRun, true),
        }
    }
}

#[derive(Args, Debug, Clone, Copy, Default)]
pub struct EntityArgs {
    /// Skip entities marked `optional` in config, including during backfill.
    #[arg(long)]
    pub skip_optional: bool,
}

impl EntityArgs {
    fn include_optional(self) -> bool {
        !self.skip_optional
    }
}

#[derive(Subcommand, Debug)]
pub enum ReconciliationCmd {
    /// Print pending dates and the last reconciliation outcome.
    Show,
}

impl Cli {
    /// `daemon run`, the long-lived process.
    pub fn is_daemon_run(&self) -> bool {
        matches!(
            self.command,
            Commands::Daemon {
                cmd: DaemonCmd::Run(_)
            }
        )
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(paths::data_dir)
    }
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let raw: Vec<OsString> = args.into_iter().map(|t| t.into()).collect();
    Cli::parse_from(normalize_args(raw))
}

/// Run the CLI (used by bin).
pub fn run(cli: Cli) -> Result<()> {
    let ctx = Ctx::load(&cli);
    match cli.command {
        Commands::Daemon { cmd } => {
            let (mode, include_optional) = cmd.mode();
            dispatcher(&ctx).dispatch(mode, include_optional)
        }
        Commands::Reconciliation {
            cmd: ReconciliationCmd::Show,
        } => show_reconciliation(&ctx),
    }
}

// =============================================================================
// Handlers
// =============================================================================

struct Ctx {
    config: Config,
    paths: DaemonPaths,
    clock: Arc<dyn Clock>,
    json: bool,
}

impl Ctx {
    fn load(cli: &Cli) -> Self {
        let config = config::load_or_init();
        let paths = DaemonPaths::new(cli.daemon_dir())
            .with_reconciliation_history_dir(config.history.reconciliation_dir.clone());
        Self {
            config,
            paths,
            clock: Arc::new(SystemClock),
            json: cli.json,
        }
    }

    fn store(&self) -> StateStore {
        StateStore::new(self.paths.clone(), self.clock.clone())
    }

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::new(self.store())
    }

    fn print(&self, human: String, json: serde_json::Value) {
        if self.json {
            println!("{json}");
        } else {
            println!("{human}");
        }
    }
}

fn dispatcher(ctx: &Ctx) -> Dispatcher<'_> {
    Dispatcher::new()
        .on(Mode::Start, move |include_optional: bool| -> Result<()> {
            let outcome = ctx.lifecycle().start(include_optional)?;
            let text = render::start_outcome(outcome);
            ctx.print(text.clone(), serde_json::json!({ "result": text }));
            Ok(())
        })
        .on(Mode::Stop, move |_: bool| -> Result<()> {
            let outcome = ctx.lifecycle().stop()?;
            let text = render::stop_outcome(outcome);
            ctx.print(text.clone(), serde_json::json!({ "result": text }));
            Ok(())
        })
        .on(Mode::Status, move |_: bool| -> Result<()> {
            let report = ctx.lifecycle().status()?;
            ctx.print(report.to_string(), render::status_json(&report));
            Ok(())
        })
        .on(Mode::Run, move |include_optional: bool| -> Result<()> {
            let report = run_from_config(
                &ctx.config,
                ctx.paths.clone(),
                ctx.clock.clone(),
                include_optional,
            )?;
            tracing::info!(cycles = report.cycles, "daemon exited");
            Ok(())
        })
        .on(Mode::ForceRun, move |_: bool| -> Result<()> {
            let outcome = ctx.lifecycle().force_run()?;
            let text = render::force_run_outcome(outcome);
            ctx.print(text.clone(), serde_json::json!({ "result": text }));
            Ok(())
        })
}

fn show_reconciliation(ctx: &Ctx) -> Result<()> {
    let state = ctx.store().load_reconciliation_state()?;
    ctx.print(
        render::reconciliation_state(&state),
        render::reconciliation_json(&state),
    );
    Ok(())
}

// =============================================================================
// Arg normalization
// =============================================================================

/// Accept `--skip_optional` and `--SKIP-OPTIONAL` as `--skip-optional`.
fn normalize_args(mut raw: Vec<OsString>) -> Vec<OsString> {
    if raw.is_empty() {
        return raw;
    }

    let mut out = Vec::with_capacity(raw.len());
    out.push(raw.remove(0)); // program name

    for arg in raw {
        let s = arg.to_string_lossy();
        if s.starts_with("--") {
            let mut pieces = s.splitn(2, '=');
            let flag = pieces.next().unwrap_or("");
            let canon = flag.to_lowercase().replace('_', "-");
            match pieces.next() {
                Some(v) => out.push(OsString::from(format!("{canon}={v}"))),
                None => out.push(OsString::from(canon)),
            }
        } else {
            out.push(arg);
        }
    }
    out
}
