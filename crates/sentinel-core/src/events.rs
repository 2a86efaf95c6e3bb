//! Audit events for checkpoint and lifecycle activity.
//!
//! Events are emitted as structured JSON on the `sentinel::audit` tracing
//! target so the log pipeline can route them separately from diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::EngagementId;

/// Tracing target used for every audit event.
pub const AUDIT_TARGET: &str = "sentinel::audit";

/// Unique identifier for an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// An audit event about one engagement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: EventId,
    pub engagement_id: EngagementId,
    pub timestamp: DateTime<Utc>,
    pub payload: AuditPayload,
}

impl AuditEvent {
    pub fn new(engagement_id: EngagementId, payload: AuditPayload) -> Self {
        Self {
            id: EventId::new(),
            engagement_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Write the event to the audit tracing target.
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => tracing::info!(
                target: AUDIT_TARGET,
                engagement_id = %self.engagement_id,
                event = %json,
                "audit"
            ),
            Err(e) => tracing::error!(
                target: AUDIT_TARGET,
                engagement_id = %self.engagement_id,
                error = %e,
                "Failed to serialize audit event"
            ),
        }
    }
}

/// The event payload, tagged by type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditPayload {
    /// A checkpoint was durably written.
    CheckpointSaved {
        path: String,
        agent_count: u32,
        finding_count: u32,
        duration_ms: u64,
    },
    /// A checkpoint failed verification and was not trusted.
    CheckpointRejected { path: String, reason: String },
    /// A checkpoint was loaded back into a session.
    CheckpointRestored {
        path: String,
        agent_count: u32,
        finding_count: u32,
        scope_drift_overridden: bool,
        duration_ms: u64,
    },
    /// A stopped engagement was found on disk during startup.
    EngagementDiscovered { path: String, scope_hash: String },
    /// The engagement moved between lifecycle states.
    StateChanged { from: String, to: String },
}
