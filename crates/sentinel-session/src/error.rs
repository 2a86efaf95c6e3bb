//! Error types for the sentinel-session crate.

use std::path::PathBuf;

use thiserror::Error;

use sentinel_checkpoint::CheckpointError;
use sentinel_core::EngagementId;

use crate::state::{EngagementState, InvalidTransition};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Engagement not registered: {0}")]
    NotFound(EngagementId),

    #[error("Engagement {0} is already registered")]
    AlreadyRegistered(EngagementId),

    #[error("Engagement {id} is {state}; only running or paused engagements can be modified")]
    NotLive {
        id: EngagementId,
        state: EngagementState,
    },

    #[error("Engagement {0} is being checkpointed; its context can no longer change")]
    StopInProgress(EngagementId),

    #[error("Engagement {0} has no restored context; restore it before relaunching")]
    NotRestored(EngagementId),

    #[error("Checkpoint {path} belongs to engagement {found}, not {expected}")]
    EngagementMismatch {
        path: PathBuf,
        expected: EngagementId,
        found: EngagementId,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Worker(String),
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Worker(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
