use std::fs;
use std::path::Path;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::Subscriber;
use tracing_subscriber::EnvFilter;

use crate::errors::Result;

static LOG_GUARD: OnceCell<Mutex<Option<WorkerGuard>>> = OnceCell::new();

pub fn init(log_dir: &Path) -> Result<()> {
    fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "caved.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(Mutex::new(Some(guard)));

    // A daemon runs unattended and has no terminal to read from, so the
    // env filter defaults quiet the request-per-connection chatter from
    // reqwest/hyper that would otherwise dominate the file log at `info`.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn"));

    let subscriber = Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| crate::errors::CoreError::Config(err.to_string()))?;

    Ok(())
}

/// Joins the non-blocking writer's background thread so buffered log lines
/// are flushed before the process exits. Needed because the daemon's
/// destiny-pid watchdog and signal handlers call `std::process::exit`
/// directly, which skips `WorkerGuard`'s drop glue.
pub fn flush() {
    if let Some(lock) = LOG_GUARD.get() {
        drop(lock.lock().unwrap().take());
    }
}
