//! Typed failure taxonomy for the iteration loop.
//!
//! Each collaborator reports its own error kind. The controller decides per
//! kind whether a failure is recovered locally (counted against the budget)
//! or surfaced as an aborted task.

use serde::Serialize;
use thiserror::Error;

/// Failure reported by a change generator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Transport failure, timeout or unusable response. Retryable.
    #[error("generator upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    /// The generator declared it cannot produce a patch for this requirement.
    #[error("generator has no actionable change: {0}")]
    NoActionableChange(String),
}

impl GenerationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_))
    }

    /// The generator's explanation without the kind prefix.
    pub fn into_message(self) -> String {
        match self {
            Self::UpstreamUnavailable(message) | Self::NoActionableChange(message) => message,
        }
    }
}

/// Failure while applying a patch. The workspace is untouched in every case.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("path conflict on `{path}`: {reason}")]
    PathConflict { path: String, reason: String },
    #[error("malformed patch: {0}")]
    MalformedPatch(String),
    #[error("i/o failure while applying patch: {0}")]
    IoFailure(String),
    /// Another workspace handle holds write access to the branch.
    #[error("branch `{branch}` is busy")]
    Busy { branch: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RevertError {
    #[error("no applied patch to revert")]
    NothingToRevert,
    #[error("revert failed: {0}")]
    Failed(String),
}

/// Infrastructure failure of a single quality check (not a code defect).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("check `{check}` tool failure: {reason}")]
    ToolFailure { check: String, reason: String },
    #[error("check `{check}` timed out after {secs}s")]
    Timeout { check: String, secs: u64 },
}

/// Read-side or finalize failure of the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("workspace error: {0}")]
pub struct WorkspaceError(pub String);

/// Reason a task stopped without success.
///
/// Serialized into the task report, so variant names are part of the
/// outbound format.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControllerError {
    #[error("iteration budget of {budget} exhausted")]
    BudgetExhausted { budget: u32 },
    #[error("branch `{branch}` is busy")]
    Busy { branch: String },
    #[error("task cancelled")]
    Cancelled,
    #[error("generator declared the requirement unactionable: {message}")]
    Unactionable { message: String },
    #[error("generator kept producing malformed patches: {message}")]
    MalformedPatch { message: String },
    #[error("workspace failure: {message}")]
    Workspace { message: String },
    #[error("invalid phase transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl From<WorkspaceError> for ControllerError {
    fn from(err: WorkspaceError) -> Self {
        Self::Workspace { message: err.0 }
    }
}

impl From<RevertError> for ControllerError {
    fn from(err: RevertError) -> Self {
        Self::Workspace {
            message: err.to_string(),
        }
    }
}
