//! Session manager: checkpoint-on-stop and restore-from-checkpoint.
//!
//! Blocking checkpoint I/O always runs on tokio's blocking pool so the
//! command dispatcher is never stalled. Stop and restore hold the
//! engagement's lock; distinct engagements proceed in parallel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use sentinel_checkpoint::{CheckpointMetadata, CheckpointStore, Digest, LoadOptions, ScopeDrift};
use sentinel_core::events::{AuditEvent, AuditPayload};
use sentinel_core::{AuditEntry, EngagementContext, EngagementId};

use crate::error::{Result, SessionError};
use crate::locks::EngagementLocks;
use crate::registry::{CheckpointInfo, SessionEntry, SessionRegistry};
use crate::state::{transition, EngagementState, InvalidTransition, LifecycleEvent};

const ACTOR: &str = "sentinel-session";

/// Result of a successful stop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopOutcome {
    pub state: EngagementState,
    pub checkpoint_path: PathBuf,
}

/// Result of a successful restore.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub engagement_id: EngagementId,
    pub context: EngagementContext,
    pub state: EngagementState,
    /// Present when the scope changed and the caller chose to override.
    pub scope_drift: Option<ScopeDrift>,
}

/// A stopped engagement that can be restored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredSummary {
    pub engagement_id: EngagementId,
    pub created_at: DateTime<Utc>,
    pub scope_hash: Digest,
    pub checkpoint_path: PathBuf,
}

impl DiscoveredSummary {
    pub(crate) fn new(engagement_id: EngagementId, info: CheckpointInfo) -> Self {
        Self {
            engagement_id,
            created_at: info.created_at,
            scope_hash: info.scope_hash,
            checkpoint_path: info.path,
        }
    }
}

/// Orchestrates engagement lifecycle against the checkpoint store.
///
/// Clone is cheap; all clones share one registry.
#[derive(Debug, Clone)]
pub struct SessionManager {
    pub(crate) store: Arc<CheckpointStore>,
    pub(crate) registry: Arc<SessionRegistry>,
    locks: Arc<EngagementLocks>,
}

impl SessionManager {
    pub fn new(store: CheckpointStore) -> Self {
        Self {
            store: Arc::new(store),
            registry: Arc::new(SessionRegistry::new()),
            locks: Arc::new(EngagementLocks::new()),
        }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn state(&self, id: &EngagementId) -> Option<EngagementState> {
        self.registry.state(id)
    }

    pub fn snapshot(&self, id: &EngagementId) -> Option<SessionEntry> {
        self.registry.snapshot(id)
    }

    /// Take ownership of a newly started engagement.
    pub fn register_running(&self, context: EngagementContext) -> Result<()> {
        self.registry.insert_running(context)
    }

    /// Mutate the context of a live engagement.
    pub fn with_context_mut<T>(
        &self,
        id: &EngagementId,
        f: impl FnOnce(&mut EngagementContext) -> T,
    ) -> Result<T> {
        self.registry.update(id, |entry| {
            let state = entry.state;
            if entry.stopping {
                return Err(SessionError::StopInProgress(id.clone()));
            }
            match entry.context.as_mut() {
                Some(ctx) if state.is_live() => Ok(f(ctx)),
                _ => Err(SessionError::NotLive {
                    id: id.clone(),
                    state,
                }),
            }
        })
    }

    /// Agent plus finding count of a live engagement, used to size save timeouts.
    pub fn live_row_count(&self, id: &EngagementId) -> Option<usize> {
        self.registry
            .snapshot(id)
            .and_then(|e| e.context)
            .map(|ctx| ctx.agents().len() + ctx.findings().len())
    }

    /// Dispatch a lifecycle command.
    ///
    /// Events that persist state go through [`stop`](Self::stop); the rest
    /// only change the in-memory registry.
    pub async fn handle_event(
        &self,
        id: &EngagementId,
        event: LifecycleEvent,
    ) -> Result<EngagementState> {
        if event.writes_checkpoint() {
            return self.stop(id).await.map(|outcome| outcome.state);
        }
        match event {
            LifecycleEvent::Relaunch => self.relaunch(id),
            _ => self.registry.apply(id, event, |_| {}),
        }
    }

    /// Suspend a running engagement in memory. Never touches disk.
    pub fn pause(&self, id: &EngagementId) -> Result<EngagementState> {
        self.registry.apply(id, LifecycleEvent::Pause, |_| {})
    }

    pub fn resume(&self, id: &EngagementId) -> Result<EngagementState> {
        self.registry.apply(id, LifecycleEvent::Resume, |_| {})
    }

    /// Checkpoint a running or paused engagement and mark it stopped.
    ///
    /// The context is frozen when the stop begins: later mutations fail with
    /// [`SessionError::StopInProgress`] instead of being lost. The engagement
    /// is only marked stopped after the checkpoint is durably written and
    /// re-verified; on failure it keeps its prior state and context and is
    /// writable again. The work runs in a detached task, so dropping the
    /// returned future does not interrupt a write in progress.
    pub async fn stop(&self, id: &EngagementId) -> Result<StopOutcome> {
        let lock = self.locks.handle(id);
        let this = self.clone();
        let id = id.clone();

        let task = tokio::spawn(async move {
            let guard = lock.lock_owned().await;
            let result = this.stop_locked(&id).await;
            drop(guard);
            this.locks.release(&id);
            result
        });
        task.await?
    }

    async fn stop_locked(&self, id: &EngagementId) -> Result<StopOutcome> {
        let (from, mut context) = self.registry.update(id, |entry| {
            transition(entry.state, LifecycleEvent::Stop)?;
            let context = entry.context.clone().ok_or(InvalidTransition {
                from: entry.state,
                event: LifecycleEvent::Stop,
            })?;
            entry.stopping = true;
            Ok((entry.state, context))
        })?;

        context.record_audit(AuditEntry::new(
            ACTOR,
            "checkpoint",
            serde_json::json!({ "from_state": from.as_str() }),
        ));

        let (path, metadata) = match self.write_checkpoint(context).await {
            Ok(written) => written,
            Err(e) => {
                // Gone after shutdown; nothing to unfreeze.
                let _ = self.registry.update(id, |entry| {
                    entry.stopping = false;
                    Ok(())
                });
                return Err(e);
            }
        };

        let info = CheckpointInfo::from_metadata(path.clone(), &metadata);
        let state = self.registry.apply(id, LifecycleEvent::Stop, |entry| {
            entry.stopping = false;
            entry.context = None;
            entry.checkpoint = Some(info);
        })?;

        Ok(StopOutcome {
            state,
            checkpoint_path: path,
        })
    }

    async fn write_checkpoint(
        &self,
        context: EngagementContext,
    ) -> Result<(PathBuf, CheckpointMetadata)> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            let path = store.save(&context)?;
            let metadata = store.read_metadata(&path)?;
            Ok::<_, SessionError>((path, metadata))
        })
        .await?
    }

    /// Restore an engagement from its checkpoint under the store root.
    pub async fn restore(
        &self,
        id: &EngagementId,
        override_scope_drift: bool,
    ) -> Result<RestoreOutcome> {
        let path = self.store.checkpoint_path(id);
        self.restore_from(id, path, override_scope_drift).await
    }

    /// Fully load a checkpoint and register the engagement as stopped.
    ///
    /// Scope drift fails the restore unless `override_scope_drift` is set,
    /// in which case the drift is logged and returned in the outcome. The
    /// engagement is not relaunched.
    pub async fn restore_from(
        &self,
        id: &EngagementId,
        path: PathBuf,
        override_scope_drift: bool,
    ) -> Result<RestoreOutcome> {
        let guard = self.locks.handle(id).lock_owned().await;
        let result = self.restore_locked(id, path, override_scope_drift).await;
        drop(guard);
        self.locks.release(id);
        result
    }

    async fn restore_locked(
        &self,
        id: &EngagementId,
        path: PathBuf,
        override_scope_drift: bool,
    ) -> Result<RestoreOutcome> {
        if self.registry.state(id).is_some_and(EngagementState::is_live) {
            return Err(SessionError::AlreadyRegistered(id.clone()));
        }

        let started = Instant::now();
        let store = self.store.clone();
        let load_path = path.clone();
        let options = LoadOptions {
            allow_scope_drift: override_scope_drift,
        };
        let data = tokio::task::spawn_blocking(move || store.load(&load_path, options)).await??;

        if &data.metadata.engagement_id != id {
            return Err(SessionError::EngagementMismatch {
                path,
                expected: id.clone(),
                found: data.metadata.engagement_id,
            });
        }

        if let Some(drift) = &data.scope_drift {
            tracing::warn!(
                engagement_id = %id,
                %drift,
                "Restoring engagement with scope drift (override set)"
            );
        }

        let info = CheckpointInfo::from_metadata(path.clone(), &data.metadata);
        let scope_drift = data.scope_drift.clone();
        let agent_count = data.metadata.agent_count;
        let finding_count = data.metadata.finding_count;
        let context = data.into_context();
        self.registry.register_restored(context.clone(), info)?;

        AuditEvent::new(
            id.clone(),
            AuditPayload::CheckpointRestored {
                path: path.display().to_string(),
                agent_count,
                finding_count,
                scope_drift_overridden: scope_drift.is_some(),
                duration_ms: started.elapsed().as_millis() as u64,
            },
        )
        .emit();

        Ok(RestoreOutcome {
            engagement_id: id.clone(),
            context,
            state: EngagementState::Stopped,
            scope_drift,
        })
    }

    /// Move a restored engagement back to running.
    ///
    /// Only engagements whose context was rebuilt by [`restore`](Self::restore)
    /// can be relaunched; an entry known only from discovery has no context.
    pub fn relaunch(&self, id: &EngagementId) -> Result<EngagementState> {
        let has_context = self
            .registry
            .snapshot(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?
            .context
            .is_some();
        if !has_context {
            return Err(SessionError::NotRestored(id.clone()));
        }
        self.registry.apply(id, LifecycleEvent::Relaunch, |_| {})
    }

    /// Stopped engagements available for restore, ordered by id.
    pub fn list_discovered(&self) -> Vec<DiscoveredSummary> {
        self.registry
            .stopped()
            .into_iter()
            .map(|(id, info)| DiscoveredSummary::new(id, info))
            .collect()
    }

    /// Tear down the registry at daemon shutdown.
    pub fn shutdown(&self) {
        let known = self.registry.len();
        self.registry.clear();
        self.locks.prune();
        tracing::info!(engagements = known, "Session registry cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::{AgentState, Finding};

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: SessionManager,
        scope: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let scope = dir.path().join("scope.json");
        std::fs::write(&scope, br#"{"in_scope":["10.0.1.0/24"]}"#).unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoints")).unwrap();
        Fixture {
            _dir: dir,
            manager: SessionManager::new(store),
            scope,
        }
    }

    fn id(raw: &str) -> EngagementId {
        EngagementId::parse(raw).unwrap()
    }

    fn running(fx: &Fixture, raw: &str) -> EngagementId {
        let mut ctx = EngagementContext::new(id(raw), &fx.scope);
        ctx.upsert_agent(AgentState::new("a1", "recon", serde_json::json!({"port": 22})));
        ctx.add_finding(Finding::new("f1", "a1", serde_json::json!({"service": "ssh"})));
        fx.manager.register_running(ctx).unwrap();
        id(raw)
    }

    #[tokio::test]
    async fn pause_and_resume_never_write() {
        let fx = fixture();
        let eng = running(&fx, "eng-1");
        let path = fx.manager.store().checkpoint_path(&eng);

        assert_eq!(fx.manager.pause(&eng).unwrap(), EngagementState::Paused);
        assert!(!path.exists());
        assert_eq!(fx.manager.resume(&eng).unwrap(), EngagementState::Running);
        assert!(!path.exists());

        fx.manager.pause(&eng).unwrap();
        let outcome = fx.manager.stop(&eng).await.unwrap();
        assert_eq!(outcome.state, EngagementState::Stopped);
        assert_eq!(outcome.checkpoint_path, path);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn stop_evicts_context_and_records_checkpoint() {
        let fx = fixture();
        let eng = running(&fx, "eng-1");
        fx.manager.stop(&eng).await.unwrap();

        let entry = fx.manager.registry().snapshot(&eng).unwrap();
        assert!(entry.context.is_none());
        assert!(entry.checkpoint.is_some());
        assert!(matches!(
            fx.manager.with_context_mut(&eng, |_| ()),
            Err(SessionError::NotLive { .. })
        ));
    }

    #[tokio::test]
    async fn failed_save_keeps_engagement_live() {
        let fx = fixture();
        let eng = running(&fx, "eng-1");
        fx.manager.pause(&eng).unwrap();
        std::fs::remove_file(&fx.scope).unwrap();

        let err = fx.manager.stop(&eng).await.unwrap_err();
        assert!(matches!(err, SessionError::Checkpoint(_)));
        assert_eq!(fx.manager.state(&eng), Some(EngagementState::Paused));
        assert!(fx.manager.registry().snapshot(&eng).unwrap().context.is_some());
        assert!(!fx.manager.store().checkpoint_path(&eng).exists());

        // Unfrozen again once the stop has failed.
        fx.manager
            .with_context_mut(&eng, |ctx| {
                ctx.add_finding(Finding::new("f2", "a1", serde_json::json!({})))
            })
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mutations_during_stop_are_rejected_not_lost() {
        let fx = fixture();
        let mut ctx = EngagementContext::new(id("eng-1"), &fx.scope);
        ctx.upsert_agent(AgentState::new("a1", "recon", serde_json::json!({})));
        for n in 0..20_000 {
            ctx.add_finding(Finding::new(&format!("f{n}"), "a1", serde_json::json!({"n": n})));
        }
        fx.manager.register_running(ctx).unwrap();
        let eng = id("eng-1");

        let stop = {
            let manager = fx.manager.clone();
            let eng = eng.clone();
            tokio::spawn(async move { manager.stop(&eng).await })
        };

        let mut accepted = 0usize;
        let rejection = loop {
            let added = fx.manager.with_context_mut(&eng, |ctx| {
                ctx.add_finding(Finding::new(
                    &format!("late-{accepted}"),
                    "a1",
                    serde_json::json!({}),
                ))
            });
            match added {
                Ok(()) => accepted += 1,
                Err(e) => break e,
            }
            tokio::task::yield_now().await;
        };
        assert!(matches!(
            rejection,
            SessionError::StopInProgress(_) | SessionError::NotLive { .. }
        ));

        let outcome = stop.await.unwrap().unwrap();
        let data = fx
            .manager
            .store()
            .load(&outcome.checkpoint_path, LoadOptions::default())
            .unwrap();
        let persisted = data
            .findings
            .iter()
            .filter(|f| f.finding_id.starts_with("late-"))
            .count();
        assert_eq!(persisted, accepted);
    }

    #[tokio::test]
    async fn handle_event_routes_stop_through_checkpoint() {
        let fx = fixture();
        let eng = running(&fx, "eng-1");

        assert_eq!(
            fx.manager.handle_event(&eng, LifecycleEvent::Pause).await.unwrap(),
            EngagementState::Paused
        );
        assert!(!fx.manager.store().checkpoint_path(&eng).exists());

        assert_eq!(
            fx.manager.handle_event(&eng, LifecycleEvent::Stop).await.unwrap(),
            EngagementState::Stopped
        );
        assert!(fx.manager.store().checkpoint_path(&eng).exists());

        assert!(matches!(
            fx.manager.handle_event(&eng, LifecycleEvent::Relaunch).await,
            Err(SessionError::NotRestored(_))
        ));
        assert!(matches!(
            fx.manager.handle_event(&eng, LifecycleEvent::Promote).await,
            Err(SessionError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn locks_are_released_after_stop_and_restore() {
        let fx = fixture();
        let eng = running(&fx, "eng-1");
        fx.manager.stop(&eng).await.unwrap();
        assert!(fx.manager.locks.is_empty());

        fx.manager.restore(&eng, false).await.unwrap();
        assert!(fx.manager.locks.is_empty());

        // Failed operations release too.
        fx.manager.stop(&id("ghost")).await.unwrap_err();
        assert!(fx.manager.locks.is_empty());
    }

    #[tokio::test]
    async fn stopped_cannot_pause_directly() {
        let fx = fixture();
        let eng = running(&fx, "eng-1");
        fx.manager.stop(&eng).await.unwrap();

        let err = fx.manager.pause(&eng).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition(InvalidTransition {
                from: EngagementState::Stopped,
                event: LifecycleEvent::Pause,
            })
        ));
    }

    #[tokio::test]
    async fn stop_unknown_engagement_is_not_found() {
        let fx = fixture();
        let err = fx.manager.stop(&id("ghost")).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn relaunch_requires_restore() {
        let fx = fixture();
        let eng = running(&fx, "eng-1");
        fx.manager.stop(&eng).await.unwrap();
        assert!(matches!(
            fx.manager.relaunch(&eng),
            Err(SessionError::NotRestored(_))
        ));

        let restored = fx.manager.restore(&eng, false).await.unwrap();
        assert_eq!(restored.state, EngagementState::Stopped);
        assert_eq!(fx.manager.state(&eng), Some(EngagementState::Stopped));

        assert_eq!(fx.manager.relaunch(&eng).unwrap(), EngagementState::Running);
        fx.manager
            .with_context_mut(&eng, |ctx| {
                ctx.add_finding(Finding::new("f2", "a1", serde_json::json!({})))
            })
            .unwrap();

        // A later stop of the resumed run replaces the checkpoint.
        let outcome = fx.manager.stop(&eng).await.unwrap();
        let data = fx
            .manager
            .store()
            .load(&outcome.checkpoint_path, LoadOptions::default())
            .unwrap();
        assert_eq!(data.findings.len(), 2);
    }

    #[tokio::test]
    async fn restore_refuses_live_engagement() {
        let fx = fixture();
        let eng = running(&fx, "eng-1");
        let err = fx.manager.restore(&eng, false).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn restore_rejects_checkpoint_of_other_engagement() {
        let fx = fixture();
        let eng = running(&fx, "eng-1");
        let outcome = fx.manager.stop(&eng).await.unwrap();

        let err = fx
            .manager
            .restore_from(&id("eng-2"), outcome.checkpoint_path, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::EngagementMismatch { .. }));
        assert!(!fx.manager.registry().contains(&id("eng-2")));
    }

    #[tokio::test]
    async fn shutdown_clears_registry() {
        let fx = fixture();
        running(&fx, "eng-1");
        fx.manager.shutdown();
        assert!(fx.manager.registry().is_empty());
    }
}
