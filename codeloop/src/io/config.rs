//! Loop configuration stored as TOML (default `.codeloop/config.toml`).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::RetryPolicy;
use crate::io::git::GitIdentity;

/// Loop configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Iteration budget used when a task does not set one.
    pub iteration_budget: u32,

    /// Directory for task logs, reports and clones of remote repositories.
    pub workdir: PathBuf,

    pub retries: RetryPolicy,
    pub generator: GeneratorConfig,
    pub gate: GateConfig,
    pub git: GitConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorBackend {
    Command,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub backend: GeneratorBackend,
    /// Deadline for one proposal, in seconds.
    pub timeout_secs: u64,
    /// Truncate generator output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Agent command for the `command` backend; the prompt arrives on stdin.
    pub command: Vec<String>,
    pub http: HttpConfig,
}

/// Wire format of the `http` backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HttpProtocol {
    /// `POST /foundationModels/v1/completion` with `modelUri` and
    /// `completionOptions`.
    #[default]
    Completion,
    /// OpenAI-compatible `POST /v1/chat/completions`.
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub protocol: HttpProtocol,
    pub base_url: String,
    /// Model name, or a `gpt://` model URI for the completion protocol.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub folder_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    /// Deadline for each check, in seconds.
    pub check_timeout_secs: u64,
    /// Truncate check output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Checks in evaluation order.
    pub checks: Vec<CheckConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    /// Pass on exit status 0.
    #[default]
    Command,
    /// Reviewer reading the branch diff on stdin and answering `VERDICT:`.
    Review,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckConfig {
    pub name: String,
    #[serde(default)]
    pub kind: CheckKind,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub author_name: String,
    pub author_email: String,
    /// Deadline for clone and fetch, in seconds.
    pub remote_timeout_secs: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            iteration_budget: 5,
            workdir: PathBuf::from(".codeloop"),
            retries: RetryPolicy::default(),
            generator: GeneratorConfig::default(),
            gate: GateConfig::default(),
            git: GitConfig::default(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            backend: GeneratorBackend::Command,
            timeout_secs: 180,
            output_limit_bytes: 1_000_000,
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            http: HttpConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            protocol: HttpProtocol::Completion,
            base_url: "https://llm.api.cloud.yandex.net".to_string(),
            model: String::new(),
            api_key_env: "API_KEY".to_string(),
            temperature: 0.2,
            max_tokens: 2000,
            folder_id: None,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            check_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
            checks: vec![CheckConfig {
                name: "ci".to_string(),
                kind: CheckKind::Command,
                command: vec!["just".to_string(), "ci".to_string()],
            }],
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        let identity = GitIdentity::default();
        Self {
            author_name: identity.name,
            author_email: identity.email,
            remote_timeout_secs: 5 * 60,
        }
    }
}

impl GeneratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl GateConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

impl GitConfig {
    pub fn identity(&self) -> GitIdentity {
        GitIdentity {
            name: self.author_name.clone(),
            email: self.author_email.clone(),
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.iteration_budget == 0 {
            return Err(anyhow!("iteration_budget must be >= 1"));
        }
        if self.workdir.as_os_str().is_empty() {
            return Err(anyhow!("workdir must not be empty"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if self.generator.output_limit_bytes == 0 {
            return Err(anyhow!("generator.output_limit_bytes must be > 0"));
        }
        match self.generator.backend {
            GeneratorBackend::Command => {
                if !is_command(&self.generator.command) {
                    return Err(anyhow!("generator.command must be a non-empty array"));
                }
            }
            GeneratorBackend::Http => {
                if self.generator.http.base_url.trim().is_empty() {
                    return Err(anyhow!("generator.http.base_url must not be empty"));
                }
                if self.generator.http.model.trim().is_empty() {
                    return Err(anyhow!("generator.http.model must be set for the http backend"));
                }
                if self.generator.http.api_key_env.trim().is_empty() {
                    return Err(anyhow!("generator.http.api_key_env must not be empty"));
                }
                if self.generator.http.max_tokens == 0 {
                    return Err(anyhow!("generator.http.max_tokens must be > 0"));
                }
            }
        }
        if self.gate.check_timeout_secs == 0 {
            return Err(anyhow!("gate.check_timeout_secs must be > 0"));
        }
        if self.gate.output_limit_bytes == 0 {
            return Err(anyhow!("gate.output_limit_bytes must be > 0"));
        }
        let mut names = HashSet::new();
        for check in &self.gate.checks {
            if check.name.trim().is_empty() {
                return Err(anyhow!("gate.checks entries need a name"));
            }
            if !names.insert(check.name.as_str()) {
                return Err(anyhow!("duplicate check name '{}'", check.name));
            }
            if !is_command(&check.command) {
                return Err(anyhow!(
                    "gate check '{}' needs a non-empty command array",
                    check.name
                ));
            }
        }
        if self.git.remote_timeout_secs == 0 {
            return Err(anyhow!("git.remote_timeout_secs must be > 0"));
        }
        Ok(())
    }
}

fn is_command(command: &[String]) -> bool {
    command.first().is_some_and(|c| !c.trim().is_empty())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    write_atomic(path, &render_config(cfg)?)
}

pub fn render_config(cfg: &LoopConfig) -> Result<String> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    Ok(buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
