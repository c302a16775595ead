//! Quality gate: runs every registered check against a workspace state and
//! folds the results into one [`Verdict`].

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::errors::GateError;
use crate::core::verdict::{CheckReport, Verdict, aggregate};
use crate::io::workspace::WorkspaceState;

/// Input handed to each check.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub snapshot: WorkspaceState,
    /// Deadline for this check's tooling.
    pub timeout: Duration,
}

/// One quality check. Implementations normalize their tool's output into
/// findings; infrastructure problems are reported as [`GateError`].
pub trait Check: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, request: &CheckRequest) -> Result<CheckReport, GateError>;
}

/// Ordered set of checks evaluated sequentially.
pub struct QualityGate {
    checks: Vec<Box<dyn Check>>,
    check_timeout: Duration,
}

impl QualityGate {
    pub fn new(check_timeout: Duration) -> Self {
        Self {
            checks: Vec::new(),
            check_timeout,
        }
    }

    pub fn register(&mut self, check: Box<dyn Check>) {
        self.checks.push(check);
    }

    pub fn with_check(mut self, check: impl Check + 'static) -> Self {
        self.register(Box::new(check));
        self
    }

    pub fn check_names(&self) -> Vec<&str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    #[instrument(skip_all, fields(head = %snapshot.head, checks = self.checks.len()))]
    pub fn evaluate(&self, snapshot: &WorkspaceState) -> Verdict {
        let request = CheckRequest {
            snapshot: snapshot.clone(),
            timeout: self.check_timeout,
        };
        let mut results = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            let name = check.name().to_string();
            debug!(check = %name, "running check");
            let result = check.run(&request);
            match &result {
                Ok(report) => debug!(check = %name, status = ?report.status, findings = report.findings.len(), "check finished"),
                Err(err) => warn!(check = %name, err = %err, "check errored"),
            }
            results.push((name, result));
        }
        let verdict = aggregate(results);
        info!(status = ?verdict.status(), findings = verdict.findings().len(), "gate evaluated");
        verdict
    }
}
