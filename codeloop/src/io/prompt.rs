//! Prompt rendering for generator backends.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::io::generator::GenerationRequest;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const SOLVE_TEMPLATE: &str = include_str!("prompts/solve.md");
const FIX_TEMPLATE: &str = include_str!("prompts/fix.md");

/// File listings beyond this many entries are elided.
const MAX_LISTED_FILES: usize = 200;

/// Rendered system and user messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    /// Both messages as one text, for backends that take a single input.
    pub fn combined(&self) -> String {
        format!("{}\n\n{}", self.system.trim_end(), self.user)
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptRenderer {
    env: Environment<'static>,
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("solve", SOLVE_TEMPLATE)
            .expect("solve template should be valid");
        env.add_template("fix", FIX_TEMPLATE)
            .expect("fix template should be valid");
        Self { env }
    }

    /// Iteration 1, or any iteration without carried findings, uses the solve
    /// template; otherwise the findings are folded into the fix template.
    pub fn render(&self, request: &GenerationRequest) -> Result<Prompt> {
        let files = &request.snapshot.files;
        let listed: Vec<&str> = files
            .iter()
            .take(MAX_LISTED_FILES)
            .map(String::as_str)
            .collect();
        let omitted = files.len().saturating_sub(listed.len());
        let findings: Vec<String> = request
            .prior_findings
            .iter()
            .map(ToString::to_string)
            .collect();

        let name = if findings.is_empty() { "solve" } else { "fix" };
        let template = self.env.get_template(name)?;
        let user = template.render(context! {
            requirement => request.requirement.trim(),
            iteration => request.iteration,
            branch => &request.snapshot.branch,
            files => listed,
            omitted => omitted,
            findings => findings,
        })?;
        Ok(Prompt {
            system: SYSTEM_TEMPLATE.to_string(),
            user,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::core::verdict::{Finding, Severity};
    use crate::io::workspace::WorkspaceState;

    fn request(findings: Vec<Finding>, files: Vec<String>) -> GenerationRequest {
        let iteration = if findings.is_empty() { 1 } else { 2 };
        GenerationRequest {
            requirement: "Add a /health endpoint\n".to_string(),
            snapshot: WorkspaceState {
                root: PathBuf::from("/tmp/repo"),
                branch: "codeloop/t1".to_string(),
                head: "abc".to_string(),
                base_head: "abc".to_string(),
                files,
            },
            prior_findings: findings,
            iteration,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn first_iteration_uses_requirement_only() {
        let prompt = PromptRenderer::new()
            .render(&request(Vec::new(), vec!["src/main.rs".to_string()]))
            .expect("render");
        assert!(prompt.user.contains("Add a /health endpoint"));
        assert!(prompt.user.contains("- src/main.rs"));
        assert!(!prompt.user.contains("Findings"));
        assert!(prompt.system.contains("unified diff"));
    }

    #[test]
    fn carried_findings_switch_to_fix_template() {
        let findings = vec![
            Finding::new("ci", Severity::Error, "test health_returns_ok failed").at("src/main.rs", Some(12)),
        ];
        let prompt = PromptRenderer::new()
            .render(&request(findings, Vec::new()))
            .expect("render");
        assert!(prompt.user.contains("Findings from the last rejected attempt"));
        assert!(prompt.user.contains("[error] src/main.rs:12: test health_returns_ok failed (ci)"));
        assert!(!prompt.user.contains("Tracked files"));
    }

    #[test]
    fn long_file_lists_are_elided() {
        let files = (0..250).map(|i| format!("f{i}.rs")).collect();
        let prompt = PromptRenderer::new()
            .render(&request(Vec::new(), files))
            .expect("render");
        assert!(prompt.user.contains("- f199.rs"));
        assert!(!prompt.user.contains("- f200.rs"));
        assert!(prompt.user.contains("and 50 more"));
    }
}
