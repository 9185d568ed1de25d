mod application;
mod logging;
mod registered_modules;

use std::path::PathBuf;
use std::process::ExitCode;

use application::Application;
use clap::Parser;
use tokio_util::sync::CancellationToken;

/// Labstation measurement-application runtime.
#[derive(Parser)]
#[command(name = "labstation-server")]
#[command(about = "Modular measurement-application runtime for instrument control")]
#[command(version)]
struct Cli {
    /// Run headless, without the manager window.
    #[arg(short = 'g', long = "no-gui")]
    no_gui: bool,

    /// Raise the default log level to debug.
    #[arg(short, long)]
    debug: bool,

    /// Path to the YAML configuration file. Defaults to the
    /// platform-standard config location if omitted.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory rotated log files are written to. Defaults to the
    /// platform-standard app-data directory if omitted.
    #[arg(short, long, value_name = "PATH")]
    logdir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let app_state_dir = labstation_core::paths::app_state_dir(None);
    let log_dir = cli
        .logdir
        .clone()
        .unwrap_or_else(|| labstation_core::paths::log_dir(&app_state_dir));

    let _guard = match logging::init(&log_dir, cli.debug) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start the tokio runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli, app_state_dir)) {
        Ok(()) => ExitCode::from(0),
        Err(Failure::Startup(e)) => {
            tracing::error!(error = %e, "fatal startup error");
            ExitCode::from(1)
        }
        Err(Failure::Runtime(e)) => {
            tracing::error!(error = %e, "uncaught error escaped the event loop");
            ExitCode::from(2)
        }
    }
}

/// Distinguishes a failure before the application was up (exit code 1)
/// from one that escaped an already-running instance (exit code 2).
enum Failure {
    Startup(anyhow::Error),
    Runtime(anyhow::Error),
}

async fn run(cli: Cli, app_state_dir: PathBuf) -> Result<(), Failure> {
    let config_path = cli
        .config
        .unwrap_or_else(|| app_state_dir.join("config.yml"));

    let cfg = labstation_core::config::load(&config_path)
        .map_err(|errors| {
            let joined = errors
                .iter()
                .map(std::string::ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            anyhow::anyhow!("invalid configuration at {}: {joined}", config_path.display())
        })
        .map_err(Failure::Startup)?;

    let app = Application::bootstrap(&cfg, app_state_dir).map_err(Failure::Startup)?;

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::warn!("failed to install ctrl-c handler; shutdown must be triggered externally");
        }
        cancel_for_signal.cancel();
    });

    tracing::info!(headless = cli.no_gui, "labstation-server starting");

    app.run_until_shutdown(cancel).await.map_err(Failure::Runtime)
}
