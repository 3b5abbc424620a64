use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// External identifier recorded for one content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub id: String,
    /// Seconds since the epoch, with fraction.
    pub time: f64,
}

/// Hash → external id store shared by every intake process and the
/// reconciliation tool.
///
/// The data file is only ever replaced by rename, under an exclusive lock on
/// a sidecar `.lock` file; readers take the same lock shared. Both files are
/// kept at `mode` regardless of the umask of whichever process created them.
#[derive(Debug, Clone)]
pub struct FingerprintIndex {
    path: PathBuf,
    lock_path: PathBuf,
    mode: u32,
}

struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(unix)]
fn enforce_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let current = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .permissions()
        .mode()
        & 0o777;
    if current == mode {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set mode {mode:o} on {}", path.display()))
}

#[cfg(not(unix))]
fn enforce_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

impl FingerprintIndex {
    pub fn open(path: impl Into<PathBuf>, mode: u32) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let index = Self::attach(path, mode);

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index.lock_path)
            .with_context(|| format!("failed to open {}", index.lock_path.display()))?;
        enforce_mode(&index.lock_path, mode)?;
        if index.path.exists() {
            enforce_mode(&index.path, mode)?;
        }
        Ok(index)
    }

    /// Handle that creates nothing and changes no modes until a `put`.
    pub fn attach(path: impl Into<PathBuf>, mode: u32) -> Self {
        let path = path.into();
        let mut lock_name = path.clone().into_os_string();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
            mode,
        }
    }

    fn acquire(&self, exclusive: bool) -> Result<LockGuard> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.lock_path)
            .with_context(|| format!("failed to open {}", self.lock_path.display()))?;

        let started = Instant::now();
        loop {
            let attempt = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match attempt {
                Ok(()) => return Ok(LockGuard { file }),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if started.elapsed() >= LOCK_TIMEOUT {
                        anyhow::bail!(
                            "fingerprint index {} still locked after {}s",
                            self.path.display(),
                            LOCK_TIMEOUT.as_secs()
                        );
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to lock {}", self.lock_path.display())
                    });
                }
            }
        }
    }

    fn load(&self) -> Result<BTreeMap<String, FingerprintEntry>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let parsed = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(parsed)
    }

    fn save(&self, map: &BTreeMap<String, FingerprintEntry>) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        let data = serde_json::to_string_pretty(map)?;
        tmp.write_all(format!("{data}\n").as_bytes())?;
        tmp.as_file().sync_all()?;
        enforce_mode(tmp.path(), self.mode)?;
        tmp.persist(&self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    pub fn get(&self, hash: &str) -> Result<Option<FingerprintEntry>> {
        if hash.trim().is_empty() {
            return Ok(None);
        }
        let _guard = self.acquire(false)?;
        Ok(self.load()?.get(hash).cloned())
    }

    /// Last writer wins.
    pub fn put(&self, hash: &str, entry: FingerprintEntry) -> Result<()> {
        if hash.trim().is_empty() {
            anyhow::bail!("content hash cannot be empty");
        }
        if entry.id.trim().is_empty() {
            anyhow::bail!("external id cannot be empty");
        }

        let _guard = self.acquire(true)?;
        let mut map = self.load()?;
        map.insert(hash.to_string(), entry);
        self.save(&map)
    }

    /// Without a lock file nobody has written through this index yet, so the
    /// data file is read unlocked.
    pub fn len(&self) -> Result<usize> {
        let _guard = if self.lock_path.exists() {
            Some(self.acquire(false)?)
        } else {
            None
        };
        Ok(self.load()?.len())
    }
}
