pub mod reconcile;
pub mod status;
pub mod upload_cgi;

use anyhow::Result;
use serde::Serialize;

use crate::incoming::config::{ArchiveConfig, load_config, unknown_env_keys};

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }
}

/// Load configuration, then start logging where it says.
pub fn load_runtime() -> Result<ArchiveConfig> {
    let cfg = load_config()?;
    crate::logging::init(cfg.paths.log_file.as_deref());
    warn_unknown_env();
    Ok(cfg)
}

pub fn warn_unknown_env() {
    for key in unknown_env_keys() {
        tracing::warn!(key = %key, "unknown IFARCH_ environment variable ignored");
    }
}
