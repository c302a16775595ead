//! Task, iteration and outcome types shared by the controller and its
//! collaborators.
//!
//! These are plain data. Timestamps and ids are supplied by the caller so the
//! types stay deterministic under test.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::errors::ControllerError;
use crate::core::patch::Patch;
use crate::core::verdict::{Finding, Verdict};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid task: {0}")]
pub struct InvalidTask(pub String);

/// Inbound trigger describing one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub requirement: String,
    /// Local path or clone URL.
    pub repository: String,
    pub base_branch: String,
    /// Defaults to `codeloop/<task-id>` when absent.
    #[serde(default)]
    pub working_branch: Option<String>,
    pub iteration_budget: u32,
}

impl TaskSpec {
    pub fn validate(&self) -> Result<(), InvalidTask> {
        if self.requirement.trim().is_empty() {
            return Err(InvalidTask("requirement must not be empty".to_string()));
        }
        if self.repository.trim().is_empty() {
            return Err(InvalidTask("repository must not be empty".to_string()));
        }
        if self.iteration_budget == 0 {
            return Err(InvalidTask("iteration_budget must be >= 1".to_string()));
        }
        validate_branch_name(&self.base_branch)?;
        if let Some(branch) = &self.working_branch {
            validate_branch_name(branch)?;
            if branch == &self.base_branch {
                return Err(InvalidTask(format!(
                    "working branch must differ from base branch '{branch}'"
                )));
            }
        }
        Ok(())
    }
}

/// Conservative subset of git's ref-name rules.
pub fn validate_branch_name(name: &str) -> Result<(), InvalidTask> {
    if name.is_empty() {
        return Err(InvalidTask("branch name must not be empty".to_string()));
    }
    if name.starts_with('/') || name.ends_with('/') || name.starts_with('-') {
        return Err(InvalidTask(format!("invalid branch name '{name}'")));
    }
    if name.contains("..") || name.contains("//") || name.ends_with(".lock") {
        return Err(InvalidTask(format!("invalid branch name '{name}'")));
    }
    if name
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/')))
    {
        return Err(InvalidTask(format!(
            "branch name must be [A-Za-z0-9._/-] only (got '{name}')"
        )));
    }
    Ok(())
}

/// A started task. Immutable: fields are only readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    id: String,
    requirement: String,
    repository: String,
    base_branch: String,
    working_branch: String,
    budget: u32,
    created_at: DateTime<Utc>,
}

impl Task {
    pub fn start(spec: TaskSpec, id: String, created_at: DateTime<Utc>) -> Result<Self, InvalidTask> {
        spec.validate()?;
        let working_branch = spec
            .working_branch
            .unwrap_or_else(|| format!("codeloop/{id}"));
        validate_branch_name(&working_branch)?;
        Ok(Self {
            id,
            requirement: spec.requirement,
            repository: spec.repository,
            base_branch: spec.base_branch,
            working_branch,
            budget: spec.iteration_budget,
            created_at,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn requirement(&self) -> &str {
        &self.requirement
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn working_branch(&self) -> &str {
        &self.working_branch
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IterationTag {
    AppliedPass,
    AppliedFail,
    ApplyError,
    GenerationError,
    GateError,
}

/// One generate/apply/verify/decide round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iteration {
    /// 1-indexed sequence number.
    pub seq: u32,
    pub tag: IterationTag,
    pub patch: Option<Patch>,
    pub verdict: Option<Verdict>,
    /// Error text for `generation-error` / `apply-error` rounds.
    pub error: Option<String>,
    /// Number of gate evaluations performed (0 when the gate never ran).
    pub gate_attempts: u32,
    pub at: DateTime<Utc>,
}

/// Append-only, ordered iteration record of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct History {
    iterations: Vec<Iteration>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.iterations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iterations.is_empty()
    }

    pub fn next_seq(&self) -> u32 {
        self.iterations.len() as u32 + 1
    }

    /// Append an iteration. Sequence numbers must be contiguous.
    pub fn push(&mut self, iteration: Iteration) -> Result<(), ControllerError> {
        let expected = self.next_seq();
        if iteration.seq != expected {
            return Err(ControllerError::InvalidTransition {
                from: format!("iteration {}", expected - 1),
                to: format!("iteration {}", iteration.seq),
            });
        }
        self.iterations.push(iteration);
        Ok(())
    }

    pub fn iterations(&self) -> &[Iteration] {
        &self.iterations
    }

    pub fn last(&self) -> Option<&Iteration> {
        self.iterations.last()
    }

    /// Findings of the most recent verdict that did not pass.
    ///
    /// Later verdicts replace earlier ones; rounds without a verdict
    /// (generation or apply errors) leave the carried findings unchanged.
    pub fn carried_findings(&self) -> &[Finding] {
        self.iterations
            .iter()
            .rev()
            .filter_map(|it| it.verdict.as_ref())
            .find(|v| !v.passed())
            .map(Verdict::findings)
            .unwrap_or(&[])
    }

    pub fn into_vec(self) -> Vec<Iteration> {
        self.iterations
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub branch: String,
    pub sha: String,
}

/// Terminal state of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { final_commit: CommitRef },
    Exhausted,
    Aborted { reason: ControllerError },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Exhausted => "exhausted",
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// Outbound result handed to the reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub outcome: Outcome,
    pub iterations: Vec<Iteration>,
    pub final_commit: Option<CommitRef>,
}

impl TaskReport {
    pub fn new(task: &Task, outcome: Outcome, history: History) -> Self {
        let final_commit = match &outcome {
            Outcome::Succeeded { final_commit } => Some(final_commit.clone()),
            _ => None,
        };
        Self {
            task_id: task.id().to_string(),
            outcome,
            iterations: history.into_vec(),
            final_commit,
        }
    }
}
