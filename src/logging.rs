use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Same stamp as the Apache-style upload log the archive has always kept.
const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S";

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the process-wide subscriber. Logs go to `log_file` when it can be
/// opened, otherwise to stderr. Calling this twice is harmless.
pub fn init(log_file: Option<&Path>) {
    let file = match log_file.map(open_log_file) {
        Some(Ok(file)) => Some(file),
        Some(Err(err)) => {
            eprintln!("warning: {err:#}; logging to stderr");
            None
        }
        None => None,
    };

    let timer = ChronoLocal::new(TIMESTAMP_FORMAT.to_string());
    let installed = match file {
        Some(file) => tracing_subscriber::registry()
            .with(env_filter())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(timer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
            .try_init(),
        None => tracing_subscriber::registry()
            .with(env_filter())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(timer)
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
