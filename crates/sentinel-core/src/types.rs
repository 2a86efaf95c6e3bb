//! Core domain types for a tracked engagement.
//!
//! An engagement is one bounded multi-agent operation. Its mutable state
//! (agents, findings, audit trail) lives in an [`EngagementContext`] while the
//! engagement is live and is captured into a checkpoint when it stops.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SentinelError;

// ── Engagement identity ──────────────────────────────────────────

const MAX_ENGAGEMENT_ID_LEN: usize = 128;

/// Stable opaque identifier of an engagement.
///
/// Restricted to `[A-Za-z0-9._-]` so it can double as a directory name
/// under the checkpoint root without escaping it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EngagementId(String);

impl EngagementId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, SentinelError> {
        let id = raw.into();
        let reason = if id.is_empty() {
            Some("must not be empty")
        } else if id.len() > MAX_ENGAGEMENT_ID_LEN {
            Some("longer than 128 bytes")
        } else if id == "." || id == ".." {
            Some("reserved path component")
        } else if !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        {
            Some("only ASCII letters, digits, '.', '_' and '-' are allowed")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(SentinelError::InvalidEngagementId { id, reason }),
            None => Ok(Self(id)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EngagementId {
    type Error = SentinelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EngagementId> for String {
    fn from(id: EngagementId) -> Self {
        id.0
    }
}

impl std::str::FromStr for EngagementId {
    type Err = SentinelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for EngagementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Agents and findings ──────────────────────────────────────────

/// Snapshot of one agent's mutable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    pub agent_id: String,
    /// Agent role (e.g. "recon", "exploit", "reporter").
    pub agent_type: String,
    /// Opaque state payload. Decoded only by the agent runtime.
    pub state: serde_json::Value,
    /// Identifier of the last action the agent completed.
    pub last_action_id: Option<String>,
    /// Free-form justification of the agent's latest decision, kept for audit.
    #[serde(default)]
    pub decision_context: serde_json::Value,
}

impl AgentState {
    pub fn new(agent_id: &str, agent_type: &str, state: serde_json::Value) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            state,
            last_action_id: None,
            decision_context: serde_json::Value::Null,
        }
    }
}

/// An immutable fact discovered during the engagement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub finding_id: String,
    pub payload: serde_json::Value,
    /// Agent that produced the finding.
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Finding {
    pub fn new(finding_id: &str, agent_id: &str, payload: serde_json::Value) -> Self {
        Self {
            finding_id: finding_id.to_string(),
            payload,
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// One entry of the engagement's append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// Who acted: an agent id, "operator", or a subsystem name.
    pub actor: String,
    pub action: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl AuditEntry {
    pub fn new(actor: &str, action: &str, detail: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action: action.to_string(),
            detail,
        }
    }
}

// ── Engagement context ───────────────────────────────────────────

/// Complete mutable state of one engagement.
///
/// Findings and audit entries can only be appended. Agents are upserted by
/// `agent_id`, keeping the order in which each agent first appeared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngagementContext {
    engagement_id: EngagementId,
    /// Handle to the externally owned scope artifact.
    scope_reference: PathBuf,
    #[serde(default)]
    agents: Vec<AgentState>,
    #[serde(default)]
    findings: Vec<Finding>,
    #[serde(default)]
    audit_log: Vec<AuditEntry>,
}

impl EngagementContext {
    pub fn new(engagement_id: EngagementId, scope_reference: impl Into<PathBuf>) -> Self {
        Self {
            engagement_id,
            scope_reference: scope_reference.into(),
            agents: Vec::new(),
            findings: Vec::new(),
            audit_log: Vec::new(),
        }
    }

    /// Rebuild a context from previously captured parts.
    pub fn from_parts(
        engagement_id: EngagementId,
        scope_reference: PathBuf,
        agents: Vec<AgentState>,
        findings: Vec<Finding>,
        audit_log: Vec<AuditEntry>,
    ) -> Self {
        Self {
            engagement_id,
            scope_reference,
            agents,
            findings,
            audit_log,
        }
    }

    pub fn engagement_id(&self) -> &EngagementId {
        &self.engagement_id
    }

    pub fn scope_reference(&self) -> &Path {
        &self.scope_reference
    }

    pub fn agents(&self) -> &[AgentState] {
        &self.agents
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn audit_log(&self) -> &[AuditEntry] {
        &self.audit_log
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentState> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }

    /// Insert a new agent or replace the state of an existing one in place.
    pub fn upsert_agent(&mut self, agent: AgentState) {
        match self.agents.iter_mut().find(|a| a.agent_id == agent.agent_id) {
            Some(existing) => *existing = agent,
            None => self.agents.push(agent),
        }
    }

    pub fn add_finding(&mut self, finding: Finding) {
        self.findings.push(finding);
    }

    pub fn record_audit(&mut self, entry: AuditEntry) {
        self.audit_log.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engagement_id_accepts_safe_names() {
        for raw in ["eng-42", "ENG_2024.q3", "a"] {
            assert_eq!(EngagementId::parse(raw).unwrap().as_str(), raw);
        }
    }

    #[test]
    fn engagement_id_rejects_path_like_names() {
        for raw in ["", ".", "..", "../etc", "a/b", "a b", "é"] {
            assert!(
                matches!(
                    EngagementId::parse(raw),
                    Err(SentinelError::InvalidEngagementId { .. })
                ),
                "{raw:?} should be rejected"
            );
        }
        assert!(EngagementId::parse("x".repeat(129)).is_err());
    }

    #[test]
    fn engagement_id_deserialization_validates() {
        let ok: EngagementId = serde_json::from_str("\"eng-1\"").unwrap();
        assert_eq!(ok.as_str(), "eng-1");
        assert!(serde_json::from_str::<EngagementId>("\"../x\"").is_err());
    }

    #[test]
    fn upsert_agent_keeps_first_seen_order() {
        let id = EngagementId::parse("eng-1").unwrap();
        let mut ctx = EngagementContext::new(id, "/tmp/scope.json");
        ctx.upsert_agent(AgentState::new("a1", "recon", serde_json::json!({"port": 22})));
        ctx.upsert_agent(AgentState::new("a2", "recon", serde_json::json!({"port": 80})));
        ctx.upsert_agent(AgentState::new("a1", "recon", serde_json::json!({"port": 443})));

        let ids: Vec<_> = ctx.agents().iter().map(|a| a.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2"]);
        assert_eq!(ctx.agent("a1").unwrap().state["port"], 443);
    }

    #[test]
    fn context_json_roundtrip() {
        let id = EngagementId::parse("eng-7").unwrap();
        let mut ctx = EngagementContext::new(id, "/srv/scope.yaml");
        ctx.add_finding(Finding::new("f1", "a1", serde_json::json!({"cve": "CVE-2024-1234"})));
        ctx.record_audit(AuditEntry::new("operator", "start", serde_json::Value::Null));

        let json = serde_json::to_string(&ctx).unwrap();
        let back: EngagementContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctx);
    }
}
