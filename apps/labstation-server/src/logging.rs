//! Logging initialization: console + rotating file
//! layer built on `tracing-subscriber`/`tracing-appender`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_PREFIX: &str = "labstation.log";
const KEPT_SESSIONS: usize = 5;

/// Installs the process-wide subscriber and prunes rotated log files beyond
/// the last [`KEPT_SESSIONS`]. The returned [`WorkerGuard`] must be held for the process
/// lifetime so buffered file records are flushed on drop.
///
/// # Errors
/// Returns an error if `log_dir` cannot be created or a subscriber is
/// already installed.
pub fn init(log_dir: &Path, debug: bool) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    labstation_core::paths::prune_rotated_logs(log_dir, LOG_FILE_PREFIX, KEPT_SESSIONS)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let console_layer = fmt::layer().with_target(false);
    let file_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(guard)
}
