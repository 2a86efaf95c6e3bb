//! Command-layer facade.
//!
//! Wraps [`SessionManager`] with caller-side timeouts and flattens every
//! failure into a [`CommandFailure`] whose [`FailureKind`] maps to a
//! distinct message prefix and process exit code.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use sentinel_checkpoint::CheckpointError;
use sentinel_core::{CheckpointConfig, EngagementId};

use crate::error::SessionError;
use crate::manager::{DiscoveredSummary, SessionManager};
use crate::state::EngagementState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Signature mismatch, corrupt container, or wrong engagement in file.
    Integrity,
    /// Scope artifact changed since capture and no override was given.
    ScopeDrift,
    /// Lifecycle edge not allowed from the current state.
    InvalidTransition,
    Io,
    NotFound,
    InvalidInput,
    Timeout,
    Internal,
}

impl FailureKind {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Internal => 1,
            Self::InvalidInput => 2,
            Self::Integrity => 10,
            Self::ScopeDrift => 11,
            Self::InvalidTransition => 12,
            Self::Io => 13,
            Self::NotFound => 14,
            Self::Timeout => 15,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integrity => "integrity error",
            Self::ScopeDrift => "scope drift",
            Self::InvalidTransition => "invalid transition",
            Self::Io => "io error",
            Self::NotFound => "not found",
            Self::InvalidInput => "invalid input",
            Self::Timeout => "timeout",
            Self::Internal => "internal error",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure returned to the command layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CommandFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl CommandFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.kind.exit_code()
    }
}

impl From<CheckpointError> for CommandFailure {
    fn from(err: CheckpointError) -> Self {
        let kind = match &err {
            CheckpointError::Integrity { .. } | CheckpointError::UnsupportedSchema { .. } => {
                FailureKind::Integrity
            }
            CheckpointError::ScopeDrift(_) => FailureKind::ScopeDrift,
            CheckpointError::Io(_) => FailureKind::Io,
            CheckpointError::Serialization(_) => FailureKind::Internal,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<SessionError> for CommandFailure {
    fn from(err: SessionError) -> Self {
        let kind = match err {
            SessionError::Checkpoint(inner) => return inner.into(),
            SessionError::InvalidTransition(_)
            | SessionError::AlreadyRegistered(_)
            | SessionError::NotLive { .. }
            | SessionError::StopInProgress(_)
            | SessionError::NotRestored(_) => FailureKind::InvalidTransition,
            SessionError::NotFound(_) => FailureKind::NotFound,
            SessionError::EngagementMismatch { .. } => FailureKind::Integrity,
            SessionError::Io(_) => FailureKind::Io,
            SessionError::Worker(_) => FailureKind::Internal,
        };
        Self::new(kind, err.to_string())
    }
}

/// Caller-side time limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub save_base: Duration,
    pub save_per_row: Duration,
    pub verify: Duration,
}

impl Timeouts {
    /// Saves get more time the more rows they write.
    pub fn save(&self, rows: usize) -> Duration {
        let rows = u32::try_from(rows).unwrap_or(u32::MAX);
        self.save_base + self.save_per_row.saturating_mul(rows)
    }
}

impl From<&CheckpointConfig> for Timeouts {
    fn from(config: &CheckpointConfig) -> Self {
        Self {
            save_base: config.save_timeout_base(),
            save_per_row: config.save_timeout_per_row(),
            verify: config.verify_timeout(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from(&CheckpointConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopReply {
    pub engagement_id: EngagementId,
    pub state: EngagementState,
    pub checkpoint_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreReply {
    pub engagement_id: EngagementId,
    pub state: EngagementState,
    pub agent_count: usize,
    pub finding_count: usize,
    /// Set when the restore went ahead despite scope drift.
    pub scope_drift_warning: Option<String>,
}

/// Entry points the daemon's command dispatcher calls.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    manager: SessionManager,
    timeouts: Timeouts,
}

impl CommandHandler {
    pub fn new(manager: SessionManager, timeouts: Timeouts) -> Self {
        Self { manager, timeouts }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Checkpoint and stop a live engagement.
    ///
    /// On timeout the checkpoint write keeps running in the background and
    /// the engagement becomes stopped once it completes.
    pub async fn stop(&self, engagement_id: &str) -> Result<StopReply, CommandFailure> {
        let id = parse_id(engagement_id)?;
        let rows = self.manager.live_row_count(&id).unwrap_or(0);
        let limit = self.timeouts.save(rows);

        let outcome = tokio::time::timeout(limit, self.manager.stop(&id))
            .await
            .map_err(|_| timed_out("stop", &id, limit))??;

        Ok(StopReply {
            engagement_id: id,
            state: outcome.state,
            checkpoint_path: outcome.checkpoint_path,
        })
    }

    /// Scan the checkpoint root and register what is found.
    pub async fn discover(&self) -> Result<Vec<DiscoveredSummary>, CommandFailure> {
        Ok(self.manager.discover_on_startup().await?)
    }

    pub fn list_discovered(&self) -> Vec<DiscoveredSummary> {
        self.manager.list_discovered()
    }

    /// Restore a stopped engagement into the registry (state stays stopped).
    pub async fn restore(
        &self,
        engagement_id: &str,
        override_scope_drift: bool,
    ) -> Result<RestoreReply, CommandFailure> {
        let id = parse_id(engagement_id)?;
        let path = self.manager.store().checkpoint_path(&id);
        self.restore_from(&id, path, override_scope_drift).await
    }

    /// Restore from an explicit checkpoint path.
    pub async fn restore_from(
        &self,
        id: &EngagementId,
        path: PathBuf,
        override_scope_drift: bool,
    ) -> Result<RestoreReply, CommandFailure> {
        let limit = self.timeouts.save(0);
        let outcome = tokio::time::timeout(
            limit,
            self.manager.restore_from(id, path, override_scope_drift),
        )
        .await
        .map_err(|_| timed_out("restore", id, limit))??;

        Ok(RestoreReply {
            engagement_id: outcome.engagement_id,
            state: outcome.state,
            agent_count: outcome.context.agents().len(),
            finding_count: outcome.context.findings().len(),
            scope_drift_warning: outcome.scope_drift.map(|d| d.to_string()),
        })
    }

    /// Check a checkpoint file's signature.
    pub async fn verify(&self, path: &Path) -> Result<bool, CommandFailure> {
        let store = self.manager.store.clone();
        let path = path.to_path_buf();
        let limit = self.timeouts.verify;
        let task = tokio::task::spawn_blocking(move || store.verify(&path));

        let joined = tokio::time::timeout(limit, task).await.map_err(|_| {
            CommandFailure::new(
                FailureKind::Timeout,
                format!("verify exceeded {}ms", limit.as_millis()),
            )
        })?;
        let verified =
            joined.map_err(|e| CommandFailure::new(FailureKind::Internal, e.to_string()))??;
        Ok(verified)
    }
}

fn parse_id(raw: &str) -> Result<EngagementId, CommandFailure> {
    EngagementId::parse(raw)
        .map_err(|e| CommandFailure::new(FailureKind::InvalidInput, e.to_string()))
}

fn timed_out(op: &str, id: &EngagementId, limit: Duration) -> CommandFailure {
    CommandFailure::new(
        FailureKind::Timeout,
        format!("{op} of {id} exceeded {}ms", limit.as_millis()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_checkpoint::CheckpointStore;
    use sentinel_core::{AgentState, EngagementContext};

    fn handler(dir: &Path) -> CommandHandler {
        let store = CheckpointStore::new(dir.join("root")).unwrap();
        CommandHandler::new(SessionManager::new(store), Timeouts::default())
    }

    #[test]
    fn exit_codes_are_distinct() {
        let kinds = [
            FailureKind::Integrity,
            FailureKind::ScopeDrift,
            FailureKind::InvalidTransition,
            FailureKind::Io,
            FailureKind::NotFound,
            FailureKind::InvalidInput,
            FailureKind::Timeout,
            FailureKind::Internal,
        ];
        let mut codes: Vec<_> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(codes.iter().all(|&c| c != 0));
    }

    #[test]
    fn save_timeout_scales_with_rows() {
        let t = Timeouts {
            save_base: Duration::from_secs(10),
            save_per_row: Duration::from_millis(2),
            verify: Duration::from_secs(1),
        };
        assert_eq!(t.save(0), Duration::from_secs(10));
        assert_eq!(t.save(500), Duration::from_secs(11));
    }

    #[tokio::test]
    async fn invalid_id_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let failure = handler(dir.path()).stop("../escape").await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::InvalidInput);
        assert_eq!(failure.exit_code(), 2);
    }

    #[tokio::test]
    async fn missing_checkpoint_restore_is_integrity_failure() {
        let dir = tempfile::tempdir().unwrap();
        let failure = handler(dir.path()).restore("eng-9", false).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Integrity);
    }

    #[tokio::test]
    async fn drift_maps_to_scope_drift_kind() {
        let dir = tempfile::tempdir().unwrap();
        let scope = dir.path().join("scope.json");
        std::fs::write(&scope, b"a").unwrap();
        let handler = handler(dir.path());

        let mut ctx = EngagementContext::new(EngagementId::parse("eng-1").unwrap(), &scope);
        ctx.upsert_agent(AgentState::new("a1", "recon", serde_json::json!({})));
        handler.manager().register_running(ctx).unwrap();
        handler.stop("eng-1").await.unwrap();

        std::fs::write(&scope, b"b").unwrap();
        let failure = handler.restore("eng-1", false).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::ScopeDrift);
        assert_eq!(failure.exit_code(), 11);
        assert!(failure.to_string().starts_with("scope drift: "));

        let reply = handler.restore("eng-1", true).await.unwrap();
        assert_eq!(reply.state, EngagementState::Stopped);
        assert!(reply.scope_drift_warning.is_some());
    }

    #[tokio::test]
    async fn stop_twice_is_invalid_transition() {
        let dir = tempfile::tempdir().unwrap();
        let scope = dir.path().join("scope.json");
        std::fs::write(&scope, b"a").unwrap();
        let handler = handler(dir.path());
        let ctx = EngagementContext::new(EngagementId::parse("eng-1").unwrap(), &scope);
        handler.manager().register_running(ctx).unwrap();

        handler.stop("eng-1").await.unwrap();
        let failure = handler.stop("eng-1").await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::InvalidTransition);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_timeout_reports_timeout_and_write_completes() {
        let dir = tempfile::tempdir().unwrap();
        let scope = dir.path().join("scope.json");
        std::fs::write(&scope, b"a").unwrap();
        let store = CheckpointStore::new(dir.path().join("root")).unwrap();
        let handler = CommandHandler::new(
            SessionManager::new(store),
            Timeouts {
                save_base: Duration::ZERO,
                save_per_row: Duration::ZERO,
                verify: Duration::from_secs(5),
            },
        );

        let eng = EngagementId::parse("eng-1").unwrap();
        let mut ctx = EngagementContext::new(eng.clone(), &scope);
        ctx.upsert_agent(AgentState::new("a1", "recon", serde_json::json!({})));
        for n in 0..5_000 {
            ctx.add_finding(sentinel_core::Finding::new(
                &format!("f{n}"),
                "a1",
                serde_json::json!({"n": n}),
            ));
        }
        handler.manager().register_running(ctx).unwrap();

        let failure = handler.stop("eng-1").await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(failure.exit_code(), 15);

        for _ in 0..1_000 {
            if handler.manager().state(&eng) == Some(EngagementState::Stopped) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.manager().state(&eng), Some(EngagementState::Stopped));
        let path = handler.manager().store().checkpoint_path(&eng);
        assert!(handler.verify(&path).await.unwrap());
    }

    #[tokio::test]
    async fn verify_reports_false_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let ok = handler(dir.path())
            .verify(&dir.path().join("nope.sckp"))
            .await
            .unwrap();
        assert!(!ok);
    }
}
