//! Engagement lifecycle state machine.
//!
//! ```text
//!            Pause                 Stop
//!   RUNNING ───────▶ PAUSED ───────────────▶ STOPPED ◀── Promote ── DISCOVERED
//!      ▲   ◀───────          (writes checkpoint)  │
//!      │    Resume                                │
//!      └─────────────── Relaunch ─────────────────┘
//!        (RUNNING ── Stop ──▶ STOPPED as well)
//! ```
//!
//! [`transition`] is total over (state, event): every pair either yields the
//! next state or an [`InvalidTransition`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementState {
    /// Live and executing.
    Running,
    /// Live but suspended in memory; nothing written to disk.
    Paused,
    /// Captured to disk; the live context may be gone.
    Stopped,
    /// Found on disk during the startup scan, pending promotion to `Stopped`.
    Discovered,
}

impl EngagementState {
    pub const ALL: [EngagementState; 4] = [
        EngagementState::Running,
        EngagementState::Paused,
        EngagementState::Stopped,
        EngagementState::Discovered,
    ];

    /// Whether the engagement's context is held in memory.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Discovered => "discovered",
        }
    }
}

impl std::fmt::Display for EngagementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Pause,
    Resume,
    Stop,
    /// Startup scan verified the checkpoint.
    Promote,
    /// Resume execution of a restored engagement.
    Relaunch,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 5] = [
        LifecycleEvent::Pause,
        LifecycleEvent::Resume,
        LifecycleEvent::Stop,
        LifecycleEvent::Promote,
        LifecycleEvent::Relaunch,
    ];

    /// Only stopping persists state.
    pub fn writes_checkpoint(self) -> bool {
        matches!(self, Self::Stop)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Promote => "promote",
            Self::Relaunch => "relaunch",
        }
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid transition: cannot {event} an engagement that is {from}")]
pub struct InvalidTransition {
    pub from: EngagementState,
    pub event: LifecycleEvent,
}

/// Next state for `event` applied in state `from`.
pub fn transition(
    from: EngagementState,
    event: LifecycleEvent,
) -> Result<EngagementState, InvalidTransition> {
    use EngagementState::*;
    use LifecycleEvent::*;

    match (from, event) {
        (Running, Pause) => Ok(Paused),
        (Paused, Resume) => Ok(Running),
        (Running | Paused, Stop) => Ok(Stopped),
        (Discovered, Promote) => Ok(Stopped),
        (Stopped, Relaunch) => Ok(Running),
        _ => Err(InvalidTransition { from, event }),
    }
}
