//! Change generator abstraction.
//!
//! The [`ChangeGenerator`] trait decouples the controller from the backend that
//! proposes patches. [`CommandGenerator`] shells out to a local agent command;
//! the HTTP backend lives in [`crate::io::llm`]. Tests use scripted generators
//! that return predetermined patches without spawning anything.

use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::errors::GenerationError;
use crate::core::patch::Patch;
use crate::core::verdict::Finding;
use crate::io::diff::{DiffError, parse_patch};
use crate::io::process::{run_command_with_timeout, tail_chars};
use crate::io::prompt::PromptRenderer;
use crate::io::workspace::WorkspaceState;

/// Input for one proposal.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub requirement: String,
    pub snapshot: WorkspaceState,
    /// Findings of the most recent failing verdict; empty on iteration 1.
    pub prior_findings: Vec<Finding>,
    /// 1-indexed iteration this proposal is for.
    pub iteration: u32,
    pub timeout: Duration,
}

/// Produces a candidate patch for a requirement.
pub trait ChangeGenerator: Send + Sync {
    fn propose(&self, request: &GenerationRequest) -> Result<Patch, GenerationError>;
}

/// Map raw generator text to a patch or a typed generation failure.
pub fn patch_from_output(output: &str) -> Result<Patch, GenerationError> {
    match parse_patch(output) {
        Ok(patch) => Ok(patch),
        Err(DiffError::Empty) => Err(GenerationError::NoActionableChange(
            "generator returned an empty diff".to_string(),
        )),
        Err(err @ (DiffError::NoDiff | DiffError::Invalid(_))) => {
            Err(GenerationError::UpstreamUnavailable(err.to_string()))
        }
    }
}

/// Generator that runs an agent command in the worktree.
///
/// The rendered prompt goes to stdin; stdout must hold a unified diff.
pub struct CommandGenerator {
    command: Vec<String>,
    output_limit_bytes: usize,
    renderer: PromptRenderer,
}

impl CommandGenerator {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
            renderer: PromptRenderer::new(),
        }
    }
}

impl ChangeGenerator for CommandGenerator {
    #[instrument(skip_all, fields(iteration = request.iteration, timeout_secs = request.timeout.as_secs()))]
    fn propose(&self, request: &GenerationRequest) -> Result<Patch, GenerationError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(GenerationError::UpstreamUnavailable(
                "generator command is empty".to_string(),
            ));
        };
        let prompt = self
            .renderer
            .render(request)
            .map_err(|e| GenerationError::UpstreamUnavailable(format!("render prompt: {e:#}")))?;

        info!(program = %program, "invoking generator command");
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.snapshot.root)
            .env("CODELOOP_ITERATION", request.iteration.to_string())
            .env("CODELOOP_BRANCH", &request.snapshot.branch);

        let output = run_command_with_timeout(
            cmd,
            Some(prompt.combined().as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .map_err(|e| GenerationError::UpstreamUnavailable(format!("{e:#}")))?;

        if output.timed_out {
            warn!("generator command timed out");
            return Err(GenerationError::UpstreamUnavailable(format!(
                "generator timed out after {}s",
                request.timeout.as_secs()
            )));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "generator command failed");
            let stderr = output.stderr_text();
            return Err(GenerationError::UpstreamUnavailable(format!(
                "generator exited with status {:?}: {}",
                output.status.code(),
                tail_chars(stderr.trim(), 2_000)
            )));
        }

        let patch = patch_from_output(&output.stdout_text())?;
        debug!(patch = %patch, "generator proposed patch");
        Ok(patch)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::core::patch::FileEdit;

    fn request(root: PathBuf) -> GenerationRequest {
        GenerationRequest {
            requirement: "create hello.txt".to_string(),
            snapshot: WorkspaceState {
                root,
                branch: "codeloop/t1".to_string(),
                head: "h".to_string(),
                base_head: "h".to_string(),
                files: Vec::new(),
            },
            prior_findings: Vec::new(),
            iteration: 1,
            timeout: Duration::from_secs(10),
        }
    }

    fn sh(script: &str) -> CommandGenerator {
        CommandGenerator::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            64 * 1024,
        )
    }

    #[test]
    fn stdout_diff_becomes_patch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = sh(
            "cat >/dev/null; printf -- '--- /dev/null\\n+++ b/hello.txt\\n@@ -0,0 +1 @@\\n+hi\\n'",
        );
        let patch = generator.propose(&request(temp.path().to_path_buf())).expect("propose");
        assert_eq!(patch.edits(), &[FileEdit::create("hello.txt", "hi\n")]);
    }

    #[test]
    fn empty_output_is_no_actionable_change() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = sh("cat >/dev/null")
            .propose(&request(temp.path().to_path_buf()))
            .unwrap_err();
        assert!(matches!(err, GenerationError::NoActionableChange(_)));
    }

    #[test]
    fn failures_are_upstream_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path().to_path_buf());

        let err = sh("echo boom >&2; exit 2").propose(&req).unwrap_err();
        assert!(matches!(err, GenerationError::UpstreamUnavailable(ref m) if m.contains("boom")));

        let err = sh("echo 'no diff here'").propose(&req).unwrap_err();
        assert!(err.is_retryable());

        let missing = CommandGenerator::new(vec!["/no/such/agent".to_string()], 1024);
        assert!(missing.propose(&req).unwrap_err().is_retryable());
    }

    #[test]
    fn timeout_is_upstream_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path().to_path_buf());
        req.timeout = Duration::from_millis(200);
        let err = sh("sleep 5").propose(&req).unwrap_err();
        assert!(matches!(err, GenerationError::UpstreamUnavailable(ref m) if m.contains("timed out")));
    }
}
