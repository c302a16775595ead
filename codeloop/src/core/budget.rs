//! Retry allowances that bound how long the controller tolerates each kind of
//! recoverable failure.

use serde::{Deserialize, Serialize};

/// Configured retry caps.
///
/// `gate_error` applies per iteration; the other two are per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra gate evaluations after an `error` verdict.
    pub gate_error: u32,
    /// Malformed patches tolerated before the task aborts.
    pub malformed_patch: u32,
    /// `NoActionableChange` responses tolerated before the task aborts.
    pub no_actionable_change: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            gate_error: 2,
            malformed_patch: 1,
            no_actionable_change: 0,
        }
    }
}

/// A counter against a fixed cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allowance {
    limit: u32,
    used: u32,
}

impl Allowance {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Consume one retry. Returns `false` once the cap is exceeded.
    pub fn spend(&mut self) -> bool {
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }
}
