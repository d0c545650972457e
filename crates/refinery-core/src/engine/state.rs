//! Merge queue state machine.
//!
//! ```text
//! idle -> scanning -> lock-wait -> rebasing -> testing -> merging -> pushed -> idle
//!                                     ^           |          |
//!                                     |           v          |
//!                                     +---- handling-failure |
//!                                     |           |          |
//!                                     +-----------+----------+ (push rejected)
//!                                                 v
//!                                             rejected -> idle
//! ```
//!
//! Any active state may drop back to `idle` (shutdown, blocked gate). Lock-wait
//! may enter testing, merging or pushed directly when resuming from a
//! checkpoint.

use serde::{Deserialize, Serialize};

use crate::{checkpoint::Stage, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    Idle,
    Scanning,
    LockWait,
    Rebasing,
    Testing,
    HandlingFailure,
    Merging,
    Pushed,
    Rejected,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Scanning => write!(f, "scanning"),
            Self::LockWait => write!(f, "lock-wait"),
            Self::Rebasing => write!(f, "rebasing"),
            Self::Testing => write!(f, "testing"),
            Self::HandlingFailure => write!(f, "handling-failure"),
            Self::Merging => write!(f, "merging"),
            Self::Pushed => write!(f, "pushed"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl EngineState {
    /// Checkpoint stage recorded while in this state, if it mutates the repository.
    pub const fn checkpoint_stage(self) -> Option<Stage> {
        match self {
            Self::Rebasing => Some(Stage::Rebasing),
            Self::Testing => Some(Stage::Testing),
            Self::HandlingFailure => Some(Stage::ResolvingFailure),
            Self::Merging => Some(Stage::Merging),
            _ => None,
        }
    }
}

/// Whether `from -> to` is a legal move.
pub const fn can_transition(from: EngineState, to: EngineState) -> bool {
    use EngineState::{
        HandlingFailure, Idle, LockWait, Merging, Pushed, Rebasing, Rejected, Scanning, Testing,
    };

    match (from, to) {
        (Idle, Scanning)
        | (Scanning, LockWait)
        | (LockWait, Rebasing | Testing | Merging | Pushed)
        | (Rebasing, Testing | Rejected)
        | (Testing, Merging | HandlingFailure | Rejected)
        | (HandlingFailure, Rebasing | Merging | Rejected)
        | (Merging, Pushed | Rebasing | Rejected)
        | (Pushed | Rejected, Scanning) => true,
        (Idle, _) => false,
        (_, Idle) => true,
        _ => false,
    }
}

/// Current state plus transition validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMachine {
    current: EngineState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            current: EngineState::Idle,
        }
    }
}

impl StateMachine {
    pub const fn current(&self) -> EngineState {
        self.current
    }

    /// Move to `to`, or fail with [`Error::InvalidTransition`].
    pub fn transition(&mut self, to: EngineState) -> Result<()> {
        if !can_transition(self.current, to) {
            return Err(Error::InvalidTransition {
                from: self.current.to_string(),
                to: to.to_string(),
            });
        }
        tracing::debug!(from = %self.current, to = %to, "engine transition");
        self.current = to;
        Ok(())
    }
}
