//! Concrete quality checks: a command whose exit status is the result, and a
//! reviewer command that reads the branch diff and answers with a verdict.

use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::core::errors::GateError;
use crate::core::verdict::{CheckReport, CheckStatus, Finding, Severity};
use crate::io::gate::{Check, CheckRequest};
use crate::io::git::Git;
use crate::io::process::{CommandOutput, head_chars, run_command_with_timeout, tail_chars};

/// Reviewer input beyond this many bytes is cut.
pub const REVIEW_DIFF_LIMIT: usize = 120_000;
/// Output tail kept in a failing command finding.
const FINDING_TAIL_BYTES: usize = 4_000;

static VERDICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*VERDICT:\s*(PASS|FAIL)\s*$").expect("verdict regex is valid")
});
static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(VERDICT|PROBLEMS|NEXT_ACTIONS|TEST_SUGGESTIONS)\s*:\s*(.*)$")
        .expect("section regex is valid")
});
static LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([\w./-]+\.[A-Za-z0-9]+):(\d+)").expect("location regex is valid")
});

/// Passes when the command exits 0.
pub struct CommandCheck {
    name: String,
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandCheck {
    pub fn new(name: impl Into<String>, command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            name: name.into(),
            command,
            output_limit_bytes,
        }
    }
}

impl Check for CommandCheck {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(check = %self.name))]
    fn run(&self, request: &CheckRequest) -> Result<CheckReport, GateError> {
        let output = run_tool(&self.name, &self.command, request, None, self.output_limit_bytes)?;
        if output.status.success() {
            return Ok(CheckReport::pass());
        }
        let message = format!(
            "`{}` exited with status {:?}\n{}",
            self.command.join(" "),
            output.status.code(),
            output.tail(&self.name, FINDING_TAIL_BYTES)
        );
        Ok(CheckReport::fail(vec![Finding::new(
            &self.name,
            Severity::Error,
            message.trim_end(),
        )]))
    }
}

/// Runs a reviewer command with the diff between the base and the current
/// head on stdin and parses its `VERDICT:` answer.
pub struct ReviewCheck {
    name: String,
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl ReviewCheck {
    pub fn new(name: impl Into<String>, command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            name: name.into(),
            command,
            output_limit_bytes,
        }
    }
}

impl Check for ReviewCheck {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(check = %self.name))]
    fn run(&self, request: &CheckRequest) -> Result<CheckReport, GateError> {
        let snapshot = &request.snapshot;
        let diff = Git::new(&snapshot.root)
            .diff_range(&snapshot.base_head, &snapshot.head)
            .map_err(|e| GateError::ToolFailure {
                check: self.name.clone(),
                reason: format!("{e:#}"),
            })?;
        let input = truncate_diff(&diff);
        debug!(diff_bytes = diff.len(), "sending diff to reviewer");

        let output = run_tool(
            &self.name,
            &self.command,
            request,
            Some(input.as_bytes()),
            self.output_limit_bytes,
        )?;
        if !output.status.success() {
            return Err(GateError::ToolFailure {
                check: self.name.clone(),
                reason: format!(
                    "reviewer exited with status {:?}: {}",
                    output.status.code(),
                    tail_chars(output.stderr_text().trim(), 1_000)
                ),
            });
        }
        Ok(parse_review(&self.name, &output.stdout_text()))
    }
}

fn run_tool(
    name: &str,
    command: &[String],
    request: &CheckRequest,
    stdin: Option<&[u8]>,
    output_limit_bytes: usize,
) -> Result<CommandOutput, GateError> {
    let Some((program, args)) = command.split_first() else {
        return Err(GateError::ToolFailure {
            check: name.to_string(),
            reason: "empty command".to_string(),
        });
    };
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(&request.snapshot.root);
    let output = run_command_with_timeout(cmd, stdin, request.timeout, output_limit_bytes)
        .map_err(|e| GateError::ToolFailure {
            check: name.to_string(),
            reason: format!("{e:#}"),
        })?;
    if output.timed_out {
        warn!(check = name, "check timed out");
        return Err(GateError::Timeout {
            check: name.to_string(),
            secs: request.timeout.as_secs(),
        });
    }
    Ok(output)
}

fn truncate_diff(diff: &str) -> String {
    if diff.len() <= REVIEW_DIFF_LIMIT {
        return diff.to_string();
    }
    format!(
        "{}\n\n# NOTE: diff truncated due to size.\n",
        head_chars(diff, REVIEW_DIFF_LIMIT)
    )
}

/// Parse a `VERDICT / PROBLEMS / NEXT_ACTIONS / TEST_SUGGESTIONS` review.
///
/// A missing verdict line counts as `FAIL`. Problems become errors, next
/// actions warnings and test suggestions info. A failing review without any
/// listed item yields one finding holding the review text.
pub fn parse_review(check: &str, text: &str) -> CheckReport {
    let passed = VERDICT_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .is_some_and(|m| m.as_str().eq_ignore_ascii_case("PASS"));

    let mut findings = Vec::new();
    let mut severity = None;
    for line in text.lines() {
        if let Some(caps) = SECTION_RE.captures(line) {
            severity = match caps[1].to_ascii_uppercase().as_str() {
                "PROBLEMS" => Some(Severity::Error),
                "NEXT_ACTIONS" => Some(Severity::Warning),
                "TEST_SUGGESTIONS" => Some(Severity::Info),
                _ => None,
            };
            let inline = caps[2].trim();
            if let Some(sev) = severity
                && !inline.is_empty()
                && !is_none_marker(inline)
            {
                findings.push(review_finding(check, sev, inline));
            }
            continue;
        }
        let Some(sev) = severity else {
            continue;
        };
        let Some(item) = strip_bullet(line) else {
            continue;
        };
        if !is_none_marker(item) {
            findings.push(review_finding(check, sev, item));
        }
    }

    if passed {
        return CheckReport {
            status: CheckStatus::Pass,
            findings,
        };
    }
    if findings.is_empty() {
        let body = text.trim();
        let message = if body.is_empty() {
            "reviewer returned no verdict".to_string()
        } else {
            tail_chars(body, FINDING_TAIL_BYTES).to_string()
        };
        findings.push(Finding::new(check, Severity::Error, message));
    }
    CheckReport::fail(findings)
}

fn strip_bullet(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* ")) {
        return Some(rest.trim());
    }
    let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &trimmed[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some(rest.trim());
        }
    }
    None
}

fn is_none_marker(item: &str) -> bool {
    matches!(
        item.trim_end_matches('.').to_ascii_lowercase().as_str(),
        "none" | "n/a" | "-" | "nothing"
    )
}

fn review_finding(check: &str, severity: Severity, item: &str) -> Finding {
    let finding = Finding::new(check, severity, item);
    match LOCATION_RE.captures(item) {
        Some(caps) => {
            let line = caps[2].parse().ok();
            finding.at(&caps[1], line)
        }
        None => finding,
    }
}
