use crate::error::IntakeError;
use crate::incoming::digest::content_hash;
use crate::incoming::util::{epoch_now, epoch_stamp};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::time::Duration;

const MAX_COLLISION_ATTEMPTS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandedFile {
    pub basename: String,
    /// Empty, or `.<secs>.<micros>` when `basename` was already taken.
    pub collision_suffix: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub content_hash: String,
}

impl LandedFile {
    pub fn landed_name(&self) -> String {
        format!("{}{}", self.basename, self.collision_suffix)
    }
}

/// Write-once view of the shared incoming directory.
#[derive(Debug, Clone)]
pub struct LandingArea {
    dir: PathBuf,
    dir_mode: u32,
}

impl LandingArea {
    pub fn new(dir: impl Into<PathBuf>, dir_mode: u32) -> Self {
        Self {
            dir: dir.into(),
            dir_mode,
        }
    }

    /// Create the directory if absent. The mode is applied explicitly so the
    /// result does not depend on the process umask.
    pub fn ensure_dir(&self) -> std::io::Result<()> {
        if self.dir.is_dir() {
            return Ok(());
        }
        match fs::create_dir(&self.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(()),
            Err(err) => return Err(err),
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(self.dir_mode))?;
        }
        Ok(())
    }

    /// Land `bytes` under `basename`, or under `basename.<stamp>` when the
    /// name is taken. Every candidate is opened with exclusive create, so an
    /// existing path is never opened for writing; losing a race to another
    /// process just moves on to a fresh stamp.
    pub fn land(
        &self,
        basename: &str,
        bytes: &[u8],
        uploaded_at: Duration,
    ) -> Result<LandedFile, IntakeError> {
        self.ensure_dir().map_err(|source| IntakeError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut suffix = String::new();
        let mut next_stamp = uploaded_at;
        for _ in 0..=MAX_COLLISION_ATTEMPTS {
            let path = self.dir.join(format!("{basename}{suffix}"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let written = file.write_all(bytes).and_then(|()| file.sync_all());
                    if let Err(source) = written {
                        return Err(IntakeError::Io { path, source });
                    }
                    return Ok(LandedFile {
                        basename: basename.to_string(),
                        collision_suffix: suffix,
                        path,
                        size_bytes: bytes.len() as u64,
                        content_hash: content_hash(bytes),
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    suffix = format!(".{}", epoch_stamp(next_stamp));
                    // strictly later than the stamp just tried
                    next_stamp = epoch_now()
                        .unwrap_or(next_stamp)
                        .max(next_stamp + Duration::from_micros(1));
                }
                Err(source) => return Err(IntakeError::Io { path, source }),
            }
        }

        Err(IntakeError::Io {
            path: self.dir.join(basename),
            source: std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("no free name after {MAX_COLLISION_ATTEMPTS} attempts"),
            ),
        })
    }
}
