use ingest_loop::paths::DaemonPaths;
use ingest_loop::{cli, config, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());

    let _telemetry_guard = init_tracing(&cli);

    if let Err(e) = cli::run(cli) {
        tracing::error!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn init_tracing(cli: &cli::Cli) -> telemetry::TelemetryGuard {
    let mut cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("config load failed, using defaults: {err}");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    if cli.is_daemon_run() {
        let paths = DaemonPaths::new(cli.daemon_dir());
        telemetry::apply_daemon_logging_defaults(&mut cfg.logging, &paths.log_dir());
    }
    let telemetry_cfg = telemetry::TelemetryConfig::new(cli.verbose, cfg.logging);
    telemetry::init(telemetry_cfg)
}
