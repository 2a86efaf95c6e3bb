//! Sentinel Session: engagement lifecycle and crash recovery.
//!
//! Stopping an engagement writes a signed checkpoint before the engagement
//! is marked stopped. On daemon startup the checkpoint root is scanned and
//! every verified checkpoint is registered so the operator can restore it.

pub mod command;
pub mod discovery;
pub mod error;
pub mod locks;
pub mod manager;
pub mod registry;
pub mod state;

pub use command::{CommandFailure, CommandHandler, FailureKind, RestoreReply, StopReply, Timeouts};
pub use error::{Result, SessionError};
pub use manager::{DiscoveredSummary, RestoreOutcome, SessionManager, StopOutcome};
pub use registry::{CheckpointInfo, SessionEntry, SessionRegistry};
pub use state::{transition, EngagementState, InvalidTransition, LifecycleEvent};
