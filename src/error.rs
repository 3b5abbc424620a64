use std::path::PathBuf;

use thiserror::Error;

/// Failure classes of the intake and reconciliation paths.
///
/// Only `Validation` and `Capacity` are shown to submitters in their own
/// words; everything else is logged in full and surfaced generically.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("incoming area full: {occupancy} of {ceiling} bytes in use")]
    Capacity { occupancy: u64, ceiling: u64 },
    #[error("failed to land {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("catalog call failed: {0}")]
    Remote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeErrorCode {
    E101Validation,
    E102Capacity,
    E103Io,
    E104Persistence,
    E105Remote,
}

impl IntakeErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E101Validation => "E101_VALIDATION",
            Self::E102Capacity => "E102_CAPACITY",
            Self::E103Io => "E103_IO",
            Self::E104Persistence => "E104_PERSISTENCE",
            Self::E105Remote => "E105_REMOTE",
        }
    }
}

impl IntakeError {
    pub fn code(&self) -> IntakeErrorCode {
        match self {
            Self::Validation(_) => IntakeErrorCode::E101Validation,
            Self::Capacity { .. } => IntakeErrorCode::E102Capacity,
            Self::Io { .. } => IntakeErrorCode::E103Io,
            Self::Persistence(_) => IntakeErrorCode::E104Persistence,
            Self::Remote(_) => IntakeErrorCode::E105Remote,
        }
    }
}
