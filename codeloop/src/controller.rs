//! Iteration controller: drives generate → apply → verify → decide until the
//! task succeeds, runs out of budget, or aborts.
//!
//! The controller owns no I/O of its own. It sequences the workspace, the
//! generator and the gate, records exactly one [`Iteration`] per round, and
//! guarantees that a rejected patch is reverted before the next round starts.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::budget::{Allowance, RetryPolicy};
use crate::core::errors::{ApplyError, ControllerError, GenerationError};
use crate::core::patch::Patch;
use crate::core::state::{Phase, PhaseMachine};
use crate::core::types::{History, Iteration, IterationTag, Outcome, Task, TaskReport};
use crate::core::verdict::{Verdict, VerdictStatus};
use crate::io::gate::QualityGate;
use crate::io::generator::{ChangeGenerator, GenerationRequest};
use crate::io::workspace::WorkspaceManager;

/// Per-task knobs for [`run_task`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub retries: RetryPolicy,
    pub generator_timeout: Duration,
    pub cancel: CancelToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            retries: RetryPolicy::default(),
            generator_timeout: Duration::from_secs(180),
            cancel: CancelToken::new(),
        }
    }
}

/// What the current round decided.
enum Step {
    Continue,
    Done(Outcome),
}

/// Run `task` to a terminal outcome.
///
/// `on_iteration` sees every iteration as soon as it is recorded, before the
/// next round begins. The returned report carries the full history.
#[instrument(skip_all, fields(task_id = %task.id(), budget = task.budget()))]
pub fn run_task<W, G, F>(
    task: &Task,
    workspace: &mut W,
    generator: &G,
    gate: &QualityGate,
    options: &RunOptions,
    on_iteration: F,
) -> TaskReport
where
    W: WorkspaceManager,
    G: ChangeGenerator + ?Sized,
    F: FnMut(&Iteration),
{
    let mut controller = Controller {
        task,
        workspace,
        generator,
        gate,
        options,
        phase: PhaseMachine::default(),
        history: History::new(),
        malformed: Allowance::new(options.retries.malformed_patch),
        no_action: Allowance::new(options.retries.no_actionable_change),
        on_iteration,
    };
    let outcome = controller.drive();
    info!(outcome = outcome.label(), iterations = controller.history.len(), "task finished");
    let history = std::mem::take(&mut controller.history);
    TaskReport::new(task, outcome, history)
}

struct Controller<'a, W, G: ?Sized, F> {
    task: &'a Task,
    workspace: &'a mut W,
    generator: &'a G,
    gate: &'a QualityGate,
    options: &'a RunOptions,
    phase: PhaseMachine,
    history: History,
    malformed: Allowance,
    no_action: Allowance,
    on_iteration: F,
}

impl<W, G, F> Controller<'_, W, G, F>
where
    W: WorkspaceManager,
    G: ChangeGenerator + ?Sized,
    F: FnMut(&Iteration),
{
    fn drive(&mut self) -> Outcome {
        loop {
            if self.options.cancel.is_cancelled() {
                return self.abort(ControllerError::Cancelled);
            }
            if self.history.len() >= self.task.budget() as usize {
                if let Err(err) = self.phase.advance(Phase::Exhausted) {
                    return self.abort(err);
                }
                info!(budget = self.task.budget(), "iteration budget exhausted");
                return Outcome::Exhausted;
            }
            match self.round() {
                Ok(Step::Continue) => {}
                Ok(Step::Done(Outcome::Aborted { reason })) => return self.abort(reason),
                Ok(Step::Done(outcome)) => return outcome,
                Err(err) => return self.abort(err),
            }
        }
    }

    /// One generate/apply/verify/decide round.
    fn round(&mut self) -> Result<Step, ControllerError> {
        let seq = self.history.next_seq();
        self.phase.advance(Phase::Generating)?;
        info!(iteration = seq, phase = %Phase::Generating, "iteration started");

        let snapshot = self.workspace.snapshot()?;
        let request = GenerationRequest {
            requirement: self.task.requirement().to_string(),
            snapshot,
            prior_findings: self.history.carried_findings().to_vec(),
            iteration: seq,
            timeout: self.options.generator_timeout,
        };
        let patch = match self.generator.propose(&request) {
            Ok(patch) => patch,
            Err(err) => return self.on_generation_error(seq, err),
        };

        if self.options.cancel.is_cancelled() {
            return Err(ControllerError::Cancelled);
        }
        self.phase.advance(Phase::Applying)?;
        info!(iteration = seq, phase = %Phase::Applying, patch = %patch, "applying patch");
        if let Err(err) = self.workspace.apply(&patch) {
            return self.on_apply_error(seq, patch, err);
        }

        if self.options.cancel.is_cancelled() {
            return Err(ControllerError::Cancelled);
        }
        self.phase.advance(Phase::Verifying)?;
        let (verdict, attempts) = self.verify(seq)?;

        self.phase.advance(Phase::Deciding)?;
        let tag = match verdict.status() {
            VerdictStatus::Pass => IterationTag::AppliedPass,
            VerdictStatus::Fail => IterationTag::AppliedFail,
            VerdictStatus::Error => IterationTag::GateError,
        };
        info!(iteration = seq, phase = %Phase::Deciding, tag = ?tag, findings = verdict.findings().len(), "verdict");
        let passed = verdict.passed();
        self.record(Iteration {
            seq,
            tag,
            patch: Some(patch),
            verdict: Some(verdict),
            error: None,
            gate_attempts: attempts,
            at: Utc::now(),
        })?;

        if passed {
            let final_commit = self.workspace.finalize()?;
            self.phase.advance(Phase::Succeeded)?;
            info!(sha = %final_commit.sha, "task succeeded");
            return Ok(Step::Done(Outcome::Succeeded { final_commit }));
        }

        self.workspace.revert_last()?;
        info!(iteration = seq, "patch reverted");
        Ok(Step::Continue)
    }

    /// Evaluate the gate, re-running it while it errors and retries remain.
    fn verify(&mut self, seq: u32) -> Result<(Verdict, u32), ControllerError> {
        let mut retries = Allowance::new(self.options.retries.gate_error);
        let mut attempts = 0;
        loop {
            let snapshot = self.workspace.snapshot()?;
            let verdict = self.gate.evaluate(&snapshot);
            attempts += 1;
            if verdict.status() != VerdictStatus::Error || !retries.spend() {
                return Ok((verdict, attempts));
            }
            warn!(iteration = seq, attempt = attempts, "gate errored, retrying");
            if self.options.cancel.is_cancelled() {
                return Err(ControllerError::Cancelled);
            }
        }
    }

    fn on_generation_error(&mut self, seq: u32, err: GenerationError) -> Result<Step, ControllerError> {
        self.phase.advance(Phase::Deciding)?;
        warn!(iteration = seq, err = %err, "generation failed");
        self.record(Iteration {
            seq,
            tag: IterationTag::GenerationError,
            patch: None,
            verdict: None,
            error: Some(err.to_string()),
            gate_attempts: 0,
            at: Utc::now(),
        })?;
        if err.is_retryable() || self.no_action.spend() {
            return Ok(Step::Continue);
        }
        Ok(Step::Done(Outcome::Aborted {
            reason: ControllerError::Unactionable {
                message: err.into_message(),
            },
        }))
    }

    fn on_apply_error(&mut self, seq: u32, patch: Patch, err: ApplyError) -> Result<Step, ControllerError> {
        self.phase.advance(Phase::Deciding)?;
        warn!(iteration = seq, err = %err, "apply failed");
        self.record(Iteration {
            seq,
            tag: IterationTag::ApplyError,
            patch: Some(patch),
            verdict: None,
            error: Some(err.to_string()),
            gate_attempts: 0,
            at: Utc::now(),
        })?;
        match err {
            ApplyError::Busy { branch } => Ok(Step::Done(Outcome::Aborted {
                reason: ControllerError::Busy { branch },
            })),
            ApplyError::MalformedPatch(message) if !self.malformed.spend() => {
                Ok(Step::Done(Outcome::Aborted {
                    reason: ControllerError::MalformedPatch { message },
                }))
            }
            ApplyError::PathConflict { .. } | ApplyError::MalformedPatch(_) | ApplyError::IoFailure(_) => {
                Ok(Step::Continue)
            }
        }
    }

    fn record(&mut self, iteration: Iteration) -> Result<(), ControllerError> {
        (self.on_iteration)(&iteration);
        self.history.push(iteration)
    }

    /// Revert any pending patch and enter `Aborted`.
    fn abort(&mut self, reason: ControllerError) -> Outcome {
        if self.workspace.has_pending()
            && let Err(err) = self.workspace.revert_last()
        {
            warn!(err = %err, "failed to revert pending patch while aborting");
        }
        if let Err(err) = self.phase.advance(Phase::Aborted) {
            warn!(err = %err, "abort from terminal phase");
        }
        warn!(reason = %reason, "task aborted");
        Outcome::Aborted { reason }
    }
}
