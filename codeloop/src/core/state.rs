//! Controller phase machine.

use std::fmt;

use serde::Serialize;

use crate::core::errors::ControllerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Generating,
    Applying,
    Verifying,
    Deciding,
    Succeeded,
    Exhausted,
    Aborted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted | Self::Aborted)
    }

    /// Whether `self -> next` is a legal edge.
    ///
    /// Generation and apply failures short-circuit to `Deciding`. Any
    /// non-terminal phase may abort.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::{Aborted, Applying, Deciding, Exhausted, Generating, Idle, Succeeded, Verifying};
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Aborted) => true,
            (Idle, Generating) | (Idle, Exhausted) => true,
            (Generating, Applying) | (Generating, Deciding) => true,
            (Applying, Verifying) | (Applying, Deciding) => true,
            (Verifying, Deciding) => true,
            (Deciding, Generating) | (Deciding, Succeeded) | (Deciding, Exhausted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Generating => "generating",
            Self::Applying => "applying",
            Self::Verifying => "verifying",
            Self::Deciding => "deciding",
            Self::Succeeded => "succeeded",
            Self::Exhausted => "exhausted",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Tracks the current phase and rejects illegal transitions.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    current: Phase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self {
            current: Phase::Idle,
        }
    }
}

impl PhaseMachine {
    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn advance(&mut self, next: Phase) -> Result<Phase, ControllerError> {
        if !self.current.can_transition_to(next) {
            return Err(ControllerError::InvalidTransition {
                from: self.current.to_string(),
                to: next.to_string(),
            });
        }
        let prev = self.current;
        self.current = next;
        Ok(prev)
    }
}
