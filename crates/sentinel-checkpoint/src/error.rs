//! Error types for the sentinel-checkpoint crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::scope::ScopeDrift;

#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The file failed signature verification or is not a valid container.
    #[error("Integrity check failed for checkpoint {path}: {reason}")]
    Integrity { path: PathBuf, reason: String },

    #[error("Unsupported checkpoint schema version {found} in {path} (expected {expected})")]
    UnsupportedSchema {
        path: PathBuf,
        found: u16,
        expected: u16,
    },

    #[error(transparent)]
    ScopeDrift(#[from] ScopeDrift),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CheckpointError {
    pub(crate) fn integrity(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Integrity {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CheckpointError>;
