//! sentinel-core: Shared engagement types, audit events, configuration, and errors.
//!
//! This crate provides the foundational types used by the checkpoint and
//! session crates:
//! - Engagement context, agent state, findings, and audit entries
//! - Audit event types emitted on the `sentinel::audit` target
//! - Configuration management
//! - Common error types

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::CheckpointConfig;
pub use error::SentinelError;
pub use types::{AgentState, AuditEntry, EngagementContext, EngagementId, Finding};
