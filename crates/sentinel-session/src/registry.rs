//! In-process registry of known engagements.
//!
//! Owned by the daemon for the life of the process and shared by reference
//! with command handlers. Keyed by engagement id, so registering the same
//! engagement twice never produces two entries.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use sentinel_checkpoint::{CheckpointMetadata, Digest};
use sentinel_core::events::{AuditEvent, AuditPayload};
use sentinel_core::{EngagementContext, EngagementId};

use crate::error::{Result, SessionError};
use crate::state::{transition, EngagementState, LifecycleEvent};

/// Where and when an engagement was last checkpointed.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub scope_hash: Digest,
}

impl CheckpointInfo {
    pub fn from_metadata(path: PathBuf, metadata: &CheckpointMetadata) -> Self {
        Self {
            path,
            created_at: metadata.created_at,
            scope_hash: metadata.scope_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    pub state: EngagementState,
    /// Present while live, and after a restore until relaunch or eviction.
    pub context: Option<EngagementContext>,
    pub checkpoint: Option<CheckpointInfo>,
    /// Set while a stop is writing the checkpoint; the context is frozen.
    pub stopping: bool,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: RwLock<BTreeMap<EngagementId, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, id: &EngagementId) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn state(&self, id: &EngagementId) -> Option<EngagementState> {
        self.entries.read().get(id).map(|e| e.state)
    }

    pub fn snapshot(&self, id: &EngagementId) -> Option<SessionEntry> {
        self.entries.read().get(id).cloned()
    }

    /// Register a freshly started engagement in `Running`.
    pub fn insert_running(&self, context: EngagementContext) -> Result<()> {
        let mut entries = self.entries.write();
        let id = context.engagement_id().clone();
        if entries.contains_key(&id) {
            return Err(SessionError::AlreadyRegistered(id));
        }
        tracing::info!(engagement_id = %id, "Engagement registered as running");
        entries.insert(
            id,
            SessionEntry {
                state: EngagementState::Running,
                context: Some(context),
                checkpoint: None,
                stopping: false,
            },
        );
        Ok(())
    }

    /// Register a verified on-disk checkpoint: `Discovered`, then promoted to `Stopped`.
    ///
    /// Returns `false` without touching anything if the id is already known.
    pub fn register_discovered(&self, metadata: &CheckpointMetadata, path: PathBuf) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&metadata.engagement_id) {
            return false;
        }

        let mut entry = SessionEntry {
            state: EngagementState::Discovered,
            context: None,
            checkpoint: Some(CheckpointInfo::from_metadata(path, metadata)),
            stopping: false,
        };
        // Discovered → Stopped is always defined.
        if let Ok(next) = transition(entry.state, LifecycleEvent::Promote) {
            entry.state = next;
        }
        entries.insert(metadata.engagement_id.clone(), entry);
        true
    }

    /// Register a context rebuilt from a checkpoint, in `Stopped`.
    ///
    /// Replaces a stopped entry for the same id; refuses to replace a live one.
    pub fn register_restored(
        &self,
        context: EngagementContext,
        checkpoint: CheckpointInfo,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        let id = context.engagement_id().clone();
        if let Some(existing) = entries.get(&id) {
            if existing.state.is_live() {
                return Err(SessionError::AlreadyRegistered(id));
            }
        }
        entries.insert(
            id,
            SessionEntry {
                state: EngagementState::Stopped,
                context: Some(context),
                checkpoint: Some(checkpoint),
                stopping: false,
            },
        );
        Ok(())
    }

    /// Run `f` against an entry while holding the write lock.
    pub fn update<T>(
        &self,
        id: &EngagementId,
        f: impl FnOnce(&mut SessionEntry) -> Result<T>,
    ) -> Result<T> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        f(entry)
    }

    /// Apply a lifecycle event, then let `on_commit` adjust the entry.
    ///
    /// Nothing changes if the transition is invalid.
    pub fn apply(
        &self,
        id: &EngagementId,
        event: LifecycleEvent,
        on_commit: impl FnOnce(&mut SessionEntry),
    ) -> Result<EngagementState> {
        let (from, to) = self.update(id, |entry| {
            let from = entry.state;
            let to = transition(from, event)?;
            entry.state = to;
            on_commit(entry);
            Ok((from, to))
        })?;

        tracing::info!(engagement_id = %id, %from, %to, %event, "Engagement state changed");
        AuditEvent::new(
            id.clone(),
            AuditPayload::StateChanged {
                from: from.to_string(),
                to: to.to_string(),
            },
        )
        .emit();
        Ok(to)
    }

    /// Stopped engagements with a known checkpoint, ordered by id.
    pub fn stopped(&self) -> Vec<(EngagementId, CheckpointInfo)> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| e.state == EngagementState::Stopped)
            .filter_map(|(id, e)| e.checkpoint.clone().map(|c| (id.clone(), c)))
            .collect()
    }

    /// Drop every entry. Called on daemon shutdown.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
