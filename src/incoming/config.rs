use crate::incoming::sanitize::FilenamePolicy;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

include!(concat!(env!("OUT_DIR"), "/ifarch_env_allowlist.rs"));

const DEFAULT_CONFIG_PATH: &str = "/var/ifarchive/lib/ifarch.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivePaths {
    pub incoming_dir: PathBuf,
    pub ledger_db: PathBuf,
    pub index_file: PathBuf,
    pub log_file: Option<PathBuf>,
    pub template_dir: Option<PathBuf>,
}

impl Default for ArchivePaths {
    fn default() -> Self {
        Self {
            incoming_dir: PathBuf::from("/var/ifarchive/incoming"),
            ledger_db: PathBuf::from("/var/ifarchive/lib/uploads.db"),
            index_file: PathBuf::from("/var/ifarchive/lib/ifids.json"),
            log_file: Some(PathBuf::from("/var/ifarchive/logs/web-upload.log")),
            template_dir: Some(PathBuf::from("/var/ifarchive/lib/uploader")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    pub max_incoming_bytes: u64,
    #[serde(default)]
    pub filename_policy: FilenamePolicy,
    #[serde(default = "default_incoming_dir_mode")]
    pub incoming_dir_mode: u32,
    #[serde(default = "default_index_file_mode")]
    pub index_file_mode: u32,
}

fn default_incoming_dir_mode() -> u32 {
    0o772
}

fn default_index_file_mode() -> u32 {
    0o666
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_incoming_bytes: 1_073_741_824,
            filename_policy: FilenamePolicy::Permissive,
            incoming_dir_mode: default_incoming_dir_mode(),
            index_file_mode: default_index_file_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub report_email: Option<String>,
    pub sendmail_bin: PathBuf,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            report_email: None,
            sendmail_bin: PathBuf::from("/usr/sbin/sendmail"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfdbConfig {
    pub commit_url: String,
    pub api_key: String,
    pub public_root: PathBuf,
    pub timeout_secs: u64,
}

impl Default for IfdbConfig {
    fn default() -> Self {
        Self {
            commit_url: "https://ifdb.org/ifarchive-commit".to_string(),
            api_key: String::new(),
            public_root: PathBuf::from("/var/ifarchive/htdocs"),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ArchiveConfig {
    pub paths: ArchivePaths,
    pub intake: IntakeConfig,
    pub notify: NotifyConfig,
    pub ifdb: IfdbConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialArchiveConfig {
    paths: Option<ArchivePaths>,
    intake: Option<IntakeConfig>,
    notify: Option<NotifyConfig>,
    ifdb: Option<IfdbConfig>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

fn env_or_optional_path(var: &str, fallback: Option<PathBuf>) -> Option<PathBuf> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(PathBuf::from(v.trim())),
        _ => fallback,
    }
}

fn env_or_optional_string(var: &str, fallback: Option<String>) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => fallback,
    }
}

fn env_or_policy(var: &str, fallback: FilenamePolicy) -> FilenamePolicy {
    match env::var(var) {
        Ok(v) => FilenamePolicy::parse(&v).unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn validate(cfg: &ArchiveConfig) -> Result<()> {
    if cfg.intake.max_incoming_bytes == 0 {
        return Err(anyhow!(
            "invalid max incoming bytes: must be >= 1 byte"
        ));
    }
    if cfg.intake.incoming_dir_mode > 0o777 {
        return Err(anyhow!(
            "invalid incoming dir mode {:o}: must be <= 777",
            cfg.intake.incoming_dir_mode
        ));
    }
    if cfg.intake.index_file_mode > 0o777 {
        return Err(anyhow!(
            "invalid index file mode {:o}: must be <= 777",
            cfg.intake.index_file_mode
        ));
    }
    if cfg.ifdb.commit_url.trim().is_empty() {
        return Err(anyhow!("invalid ifdb commit url: cannot be empty"));
    }
    if cfg.ifdb.timeout_secs == 0 {
        return Err(anyhow!("invalid ifdb timeout: must be >= 1 second"));
    }
    Ok(())
}

fn resolve_config_path() -> PathBuf {
    if let Ok(custom) = env::var("IFARCH_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

fn merge_toml(base: &mut ArchiveConfig, raw: &str) -> Result<()> {
    let parsed: PartialArchiveConfig = toml::from_str(raw)?;
    if let Some(paths) = parsed.paths {
        base.paths = paths;
    }
    if let Some(intake) = parsed.intake {
        base.intake = intake;
    }
    if let Some(notify) = parsed.notify {
        base.notify = notify;
    }
    if let Some(ifdb) = parsed.ifdb {
        base.ifdb = ifdb;
    }
    Ok(())
}

fn merge_file_config(base: &mut ArchiveConfig) -> Result<()> {
    let path = resolve_config_path();
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    merge_toml(base, &raw)
        .map_err(|err| anyhow!("failed to parse archive config {}: {err}", path.display()))
}

pub fn load_config() -> Result<ArchiveConfig> {
    let mut cfg = ArchiveConfig::default();
    merge_file_config(&mut cfg)?;

    cfg.paths.incoming_dir = env_or_path("IFARCH_INCOMING_DIR", cfg.paths.incoming_dir);
    cfg.paths.ledger_db = env_or_path("IFARCH_LEDGER_DB", cfg.paths.ledger_db);
    cfg.paths.index_file = env_or_path("IFARCH_INDEX_FILE", cfg.paths.index_file);
    cfg.paths.log_file = env_or_optional_path("IFARCH_LOG_FILE", cfg.paths.log_file);
    cfg.paths.template_dir = env_or_optional_path("IFARCH_TEMPLATE_DIR", cfg.paths.template_dir);
    cfg.intake.max_incoming_bytes =
        env_or_u64("IFARCH_MAX_INCOMING_BYTES", cfg.intake.max_incoming_bytes);
    cfg.intake.filename_policy =
        env_or_policy("IFARCH_FILENAME_POLICY", cfg.intake.filename_policy);
    cfg.notify.report_email =
        env_or_optional_string("IFARCH_REPORT_EMAIL", cfg.notify.report_email);
    cfg.notify.sendmail_bin = env_or_path("IFARCH_SENDMAIL_BIN", cfg.notify.sendmail_bin);
    cfg.ifdb.commit_url = env_or_string("IFARCH_IFDB_URL", &cfg.ifdb.commit_url);
    cfg.ifdb.api_key = env_or_string("IFARCH_IFDB_KEY", &cfg.ifdb.api_key);
    cfg.ifdb.public_root = env_or_path("IFARCH_PUBLIC_ROOT", cfg.ifdb.public_root);
    cfg.ifdb.timeout_secs = env_or_u64("IFARCH_IFDB_TIMEOUT_SECS", cfg.ifdb.timeout_secs);

    validate(&cfg)?;
    Ok(cfg)
}

/// `IFARCH_*` variables present in the environment that nothing reads.
pub fn unknown_env_keys() -> Vec<String> {
    let mut out = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("IFARCH_"))
        .filter(|key| !GENERATED_IFARCH_ENV_ALLOWLIST.contains(&key.as_str()))
        .collect::<Vec<_>>();
    out.sort();
    out
}
