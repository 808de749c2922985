//! Tracing setup for the command-line tool.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::SyncError;

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level is `info` for this crate
/// (`debug` with `verbose`) and `warn` for everything else. Logs go to stderr,
/// and also to `log_file` when given. Keep the returned guard alive until exit
/// so buffered file output gets flushed.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>, SyncError> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_default_env(),
        _ => {
            let level = if verbose { "debug" } else { "info" };
            EnvFilter::try_new(format!("warn,drive_sync={level}"))
                .map_err(|e| SyncError::Config(e.to_string()))?
        }
    };

    let mut guard = None;
    let file_layer = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir).map_err(|e| SyncError::local_io(dir, e))?;
            let file_name = path
                .file_name()
                .ok_or_else(|| SyncError::Config(format!("log file {} has no name", path.display())))?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, worker) = tracing_appender::non_blocking(appender);
            guard = Some(worker);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| SyncError::Config(e.to_string()))?;

    Ok(guard)
}
