//! Verdict model and the aggregation rule for quality checks.
//!
//! Checks report in heterogeneous ways; everything is normalized into
//! [`Finding`]s here so the controller only ever sees one shape.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::errors::GateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub path: String,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Name of the check that produced the finding.
    pub check: String,
    pub severity: Severity,
    pub message: String,
    pub location: Option<Location>,
}

impl Finding {
    pub fn new(check: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            severity,
            message: message.into(),
            location: None,
        }
    }

    pub fn at(mut self, path: impl Into<String>, line: Option<u32>) -> Self {
        self.location = Some(Location {
            path: path.into(),
            line,
        });
        self
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "[{severity}] ")?;
        if let Some(loc) = &self.location {
            match loc.line {
                Some(line) => write!(f, "{}:{line}: ", loc.path)?,
                None => write!(f, "{}: ", loc.path)?,
            }
        }
        write!(f, "{} ({})", self.message, self.check)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictStatus {
    Pass,
    Fail,
    Error,
}

/// Aggregated result of every registered check on one workspace state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    status: VerdictStatus,
    findings: Vec<Finding>,
}

impl Verdict {
    pub fn new(status: VerdictStatus, findings: Vec<Finding>) -> Self {
        Self { status, findings }
    }

    pub fn status(&self) -> VerdictStatus {
        self.status
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn passed(&self) -> bool {
        self.status == VerdictStatus::Pass
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
}

/// What a single check reports when its tooling ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub status: CheckStatus,
    pub findings: Vec<Finding>,
}

impl CheckReport {
    pub fn pass() -> Self {
        Self {
            status: CheckStatus::Pass,
            findings: Vec::new(),
        }
    }

    pub fn fail(findings: Vec<Finding>) -> Self {
        Self {
            status: CheckStatus::Fail,
            findings,
        }
    }
}

/// Combine per-check results, given in registration order, into a verdict.
///
/// - `fail` if any check failed
/// - `error` if any check errored and none failed
/// - `pass` only if every check passed (an empty gate passes)
///
/// Findings are concatenated in registration order and never re-sorted; a
/// check error contributes one `error`-severity finding.
pub fn aggregate(results: Vec<(String, Result<CheckReport, GateError>)>) -> Verdict {
    let mut any_fail = false;
    let mut any_error = false;
    let mut findings = Vec::new();

    for (name, result) in results {
        match result {
            Ok(report) => {
                if report.status == CheckStatus::Fail {
                    any_fail = true;
                }
                findings.extend(report.findings);
            }
            Err(err) => {
                any_error = true;
                findings.push(Finding::new(name, Severity::Error, err.to_string()));
            }
        }
    }

    let status = if any_fail {
        VerdictStatus::Fail
    } else if any_error {
        VerdictStatus::Error
    } else {
        VerdictStatus::Pass
    };
    Verdict::new(status, findings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing(check: &str, msg: &str) -> Result<CheckReport, GateError> {
        Ok(CheckReport::fail(vec![Finding::new(check, Severity::Error, msg)]))
    }

    fn tool_failure(check: &str) -> Result<CheckReport, GateError> {
        Err(GateError::ToolFailure {
            check: check.to_string(),
            reason: "spawn failed".to_string(),
        })
    }

    #[test]
    fn empty_gate_passes() {
        let verdict = aggregate(Vec::new());
        assert_eq!(verdict.status(), VerdictStatus::Pass);
        assert!(verdict.findings().is_empty());
    }

    #[test]
    fn all_pass_is_pass() {
        let verdict = aggregate(vec![
            ("fmt".to_string(), Ok(CheckReport::pass())),
            ("test".to_string(), Ok(CheckReport::pass())),
        ]);
        assert!(verdict.passed());
    }

    #[test]
    fn any_fail_wins_over_error() {
        let verdict = aggregate(vec![
            ("lint".to_string(), tool_failure("lint")),
            ("test".to_string(), failing("test", "1 test failed")),
        ]);
        assert_eq!(verdict.status(), VerdictStatus::Fail);
    }

    #[test]
    fn error_without_fail_is_error() {
        let verdict = aggregate(vec![
            ("fmt".to_string(), Ok(CheckReport::pass())),
            ("lint".to_string(), tool_failure("lint")),
        ]);
        assert_eq!(verdict.status(), VerdictStatus::Error);
        assert_eq!(verdict.findings().len(), 1);
        assert_eq!(verdict.findings()[0].check, "lint");
        assert_eq!(verdict.findings()[0].severity, Severity::Error);
    }

    #[test]
    fn findings_keep_registration_order() {
        let verdict = aggregate(vec![
            ("zeta".to_string(), failing("zeta", "z")),
            ("alpha".to_string(), tool_failure("alpha")),
            ("mid".to_string(), failing("mid", "m")),
        ]);
        let checks: Vec<&str> = verdict.findings().iter().map(|f| f.check.as_str()).collect();
        assert_eq!(checks, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn finding_display_includes_location() {
        let finding = Finding::new("review", Severity::Warning, "unused import").at("src/lib.rs", Some(3));
        assert_eq!(finding.to_string(), "[warning] src/lib.rs:3: unused import (review)");
    }
}
