use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit { occupancy: u64, ceiling: u64 },
    Reject { occupancy: u64, ceiling: u64 },
}

impl Admission {
    pub fn admits(self) -> bool {
        matches!(self, Self::Admit { .. })
    }

    pub fn occupancy(self) -> u64 {
        match self {
            Self::Admit { occupancy, .. } | Self::Reject { occupancy, .. } => occupancy,
        }
    }
}

/// Sum of regular-file sizes directly inside `dir`. A missing directory is
/// empty.
pub fn scan_occupancy(dir: &Path) -> Result<u64> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    let mut total = 0u64;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Ok(meta) = fs::metadata(&path) else {
            // removed by the archiver mid-scan
            continue;
        };
        if meta.is_file() {
            total = total.saturating_add(meta.len());
        }
    }
    Ok(total)
}

pub fn decide(occupancy: u64, ceiling: u64) -> Admission {
    if occupancy >= ceiling {
        Admission::Reject { occupancy, ceiling }
    } else {
        Admission::Admit { occupancy, ceiling }
    }
}

/// Point-in-time check with no reservation: requests admitted together can
/// jointly overshoot the ceiling.
pub fn check_capacity(dir: &Path, ceiling: u64) -> Result<Admission> {
    Ok(decide(scan_occupancy(dir)?, ceiling))
}
