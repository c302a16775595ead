//! Orchestration for one `codeloop run`.
//!
//! Turns a [`TaskSpec`] and a [`LoopConfig`] into concrete collaborators,
//! prepares the working branch, drives the controller and persists the task
//! log under `<workdir>/tasks/<task-id>/`.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use jsonschema::Draft;
use rand::{Rng, distributions::Alphanumeric};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::controller::{RunOptions, run_task};
use crate::core::types::{Task, TaskReport, TaskSpec};
use crate::io::checks::{CommandCheck, ReviewCheck};
use crate::io::config::{CheckKind, GeneratorBackend, LoopConfig};
use crate::io::gate::QualityGate;
use crate::io::generator::{ChangeGenerator, CommandGenerator};
use crate::io::git::{Git, is_remote_ref};
use crate::io::llm::{HttpGenerator, HttpSettings};
use crate::io::report::TaskLog;
use crate::io::workspace::{GitWorkspace, LeaseRegistry, PrepareOptions};

const TASK_SCHEMA: &str = include_str!("../schemas/task.schema.json");

/// `task-` followed by 8 lowercase alphanumerics.
pub fn generate_task_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(8)
        .collect::<String>()
        .to_lowercase();
    format!("task-{suffix}")
}

/// Parse a JSON task spec, checking it against the bundled schema.
///
/// `iteration_budget` may be omitted; `default_budget` fills it in.
pub fn load_task_spec(raw: &str, default_budget: u32) -> Result<TaskSpec> {
    let mut value: Value = serde_json::from_str(raw).context("parse task json")?;
    let schema: Value = serde_json::from_str(TASK_SCHEMA).context("parse task schema")?;
    validate_schema(&value, &schema)?;
    if let Some(object) = value.as_object_mut() {
        object
            .entry("iteration_budget")
            .or_insert_with(|| Value::from(default_budget));
    }
    let spec: TaskSpec = serde_json::from_value(value).context("parse task spec")?;
    spec.validate()?;
    Ok(spec)
}

fn validate_schema(instance: &Value, schema: &Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .context("compile task schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("task spec does not match schema:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Generator selected by `generator.backend`.
pub fn build_generator(config: &LoopConfig) -> Result<Box<dyn ChangeGenerator>> {
    let generator = &config.generator;
    match generator.backend {
        GeneratorBackend::Command => Ok(Box::new(CommandGenerator::new(
            generator.command.clone(),
            generator.output_limit_bytes,
        ))),
        GeneratorBackend::Http => {
            let http = &generator.http;
            let api_key = env::var(&http.api_key_env)
                .map_err(|_| anyhow!("environment variable {} is not set", http.api_key_env))?;
            let settings = HttpSettings {
                protocol: http.protocol,
                base_url: http.base_url.clone(),
                model: http.model.clone(),
                api_key,
                temperature: http.temperature,
                max_tokens: http.max_tokens,
                folder_id: http.folder_id.clone(),
            };
            Ok(Box::new(HttpGenerator::new(settings)?))
        }
    }
}

/// Gate with the configured checks in order.
pub fn build_gate(config: &LoopConfig) -> QualityGate {
    let gate = &config.gate;
    let mut quality_gate = QualityGate::new(gate.check_timeout());
    for check in &gate.checks {
        match check.kind {
            CheckKind::Command => quality_gate.register(Box::new(CommandCheck::new(
                &check.name,
                check.command.clone(),
                gate.output_limit_bytes,
            ))),
            CheckKind::Review => quality_gate.register(Box::new(ReviewCheck::new(
                &check.name,
                check.command.clone(),
                gate.output_limit_bytes,
            ))),
        }
    }
    quality_gate
}

/// Run one task to completion and persist its log.
///
/// Tasks running in the same process must share `registry` so that a second
/// task on a busy branch aborts with `Busy` instead of resetting it.
///
/// Errors cover everything before the loop starts (invalid spec, repository
/// that cannot be prepared, unwritable log). Once the loop runs, the outcome
/// is in the returned report.
pub fn execute(
    spec: TaskSpec,
    config: &LoopConfig,
    registry: &LeaseRegistry,
    cancel: CancelToken,
) -> Result<TaskReport> {
    let generator = build_generator(config)?;
    let gate = build_gate(config);
    execute_with(spec, config, registry, generator.as_ref(), &gate, cancel)
}

/// [`execute`] with caller-supplied generator and gate.
pub fn execute_with<G: ChangeGenerator + ?Sized>(
    spec: TaskSpec,
    config: &LoopConfig,
    registry: &LeaseRegistry,
    generator: &G,
    gate: &QualityGate,
    cancel: CancelToken,
) -> Result<TaskReport> {
    let task = Task::start(spec, generate_task_id(), Utc::now())?;
    info!(task_id = %task.id(), branch = %task.working_branch(), "task started");

    exclude_workdir(task.repository(), &config.workdir)?;
    let options = PrepareOptions {
        identity: config.git.identity(),
        checkout_dir: config.workdir.join("checkouts").join(task.id()),
        remote_timeout: config.git.remote_timeout(),
    };
    let mut workspace = GitWorkspace::prepare(
        task.repository(),
        task.base_branch(),
        task.working_branch(),
        &options,
        registry.clone(),
    )
    .with_context(|| format!("prepare workspace for {}", task.repository()))?;

    let log = TaskLog::new(&config.workdir, task.id());
    log.write_task(&task)?;

    let run_options = RunOptions {
        retries: config.retries,
        generator_timeout: config.generator.timeout(),
        cancel,
    };
    let report = run_task(
        &task,
        &mut workspace,
        generator,
        gate,
        &run_options,
        |iteration| {
            if let Err(err) = log.write_iteration(iteration) {
                warn!(seq = iteration.seq, err = %format!("{err:#}"), "failed to log iteration");
            }
        },
    );
    let path = log.write_report(&report)?;
    info!(report = %path.display(), outcome = report.outcome.label(), "report written");
    Ok(report)
}

/// Keep the workdir out of the repository's status when it lives inside the
/// checkout, so task logs are never committed or cleaned away.
fn exclude_workdir(repository: &str, workdir: &Path) -> Result<()> {
    if is_remote_ref(repository) {
        return Ok(());
    }
    let Ok(root) = fs::canonicalize(repository) else {
        return Ok(());
    };
    fs::create_dir_all(workdir).with_context(|| format!("create {}", workdir.display()))?;
    let workdir = fs::canonicalize(workdir)
        .with_context(|| format!("resolve {}", workdir.display()))?;
    let Ok(rel) = workdir.strip_prefix(&root) else {
        return Ok(());
    };
    if rel.as_os_str().is_empty() {
        bail!("workdir must not be the repository root");
    }

    let exclude = Git::new(&root).git_path("info/exclude")?;
    let entry = format!("/{}/", rel.display());
    let existing = match fs::read_to_string(&exclude) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err).with_context(|| format!("read {}", exclude.display())),
    };
    if existing.lines().any(|line| line.trim() == entry) {
        return Ok(());
    }
    let mut out = existing;
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&entry);
    out.push('\n');
    if let Some(parent) = exclude.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&exclude, out).with_context(|| format!("write {}", exclude.display()))?;
    debug!(entry = %entry, "workdir excluded from repository status");
    Ok(())
}
