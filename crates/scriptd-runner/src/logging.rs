use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paths::ScriptdPaths;

const MAX_LOG_SIZE: u64 = 1024 * 1024; // 1MB

/// Initialize logging for a component at the default `info` level.
///
/// - `component`: log file stem, e.g. "service" or "cli"
/// - `file`: also write to `<data_dir>/logs/<component>.log`
///
/// The returned guard flushes the file writer and must outlive the program's
/// logging.
pub fn init_logging(component: &str, file: bool) -> io::Result<Option<WorkerGuard>> {
    init_logging_with_default(component, file, "info")
}

/// Like [`init_logging`], with a filter used when `RUST_LOG` is unset
pub fn init_logging_with_default(
    component: &str,
    file: bool,
    default_filter: &str,
) -> io::Result<Option<WorkerGuard>> {
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if !file {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(io::stderr)
            .init();
        return Ok(None);
    }

    let log_dir = log_directory()?;
    let log_path = open_log_path(&log_dir, component)?;
    let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
    let (non_blocking_file, guard) = tracing_appender::non_blocking(BufWriter::new(file));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(io::stderr).with_ansi(true))
        .with(
            fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_target(true),
        )
        .init();

    tracing::info!(target: "runner", "Logging to file: {}", log_path.display());
    Ok(Some(guard))
}

fn log_directory() -> io::Result<PathBuf> {
    ScriptdPaths::new()
        .map(|paths| paths.log_dir())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Failed to find home directory"))
}

/// Create `dir` if needed and return the component's log path, emptied if oversized
fn open_log_path(dir: &Path, component: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let log_path = dir.join(format!("{}.log", component));
    truncate_if_needed(&log_path)?;
    Ok(log_path)
}

fn truncate_if_needed(log_path: &Path) -> io::Result<()> {
    if log_path.exists() && fs::metadata(log_path)?.len() > MAX_LOG_SIZE {
        File::create(log_path)?.set_len(0)?;
    }
    Ok(())
}
