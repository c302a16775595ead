//! Iterative code-change loop.
//!
//! `codeloop run` takes a requirement and a repository, asks the configured
//! generator for patches on a working branch and keeps the first one the
//! quality gate accepts. The final report is printed as JSON on stdout.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser, Subcommand};
use tracing::warn;

use codeloop::cancel::CancelToken;
use codeloop::core::errors::ControllerError;
use codeloop::core::types::{Outcome, TaskSpec};
use codeloop::exit_codes;
use codeloop::io::config::{LoopConfig, load_config, render_config, write_config};
use codeloop::io::workspace::LeaseRegistry;
use codeloop::logging;
use codeloop::task::{execute, load_task_spec};

const DEFAULT_CONFIG: &str = ".codeloop/config.toml";

#[derive(Parser)]
#[command(
    name = "codeloop",
    version,
    about = "Generate, apply and verify code changes until they pass"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one task to a terminal outcome and print its report.
    #[command(group(ArgGroup::new("source").required(true).args(["requirement", "requirement_file", "task"])))]
    Run(RunArgs),
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Write the default configuration if the file is missing.
        #[arg(long)]
        init: bool,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Local repository path or clone URL.
    #[arg(long, required_unless_present = "task", conflicts_with = "task")]
    repo: Option<String>,
    /// Branch the working branch starts from.
    #[arg(long, default_value = "main", conflicts_with = "task")]
    base: String,
    /// Working branch (defaults to `codeloop/<task-id>`).
    #[arg(long, conflicts_with = "task")]
    branch: Option<String>,
    /// Requirement text.
    #[arg(long)]
    requirement: Option<String>,
    /// File holding the requirement text.
    #[arg(long)]
    requirement_file: Option<PathBuf>,
    /// JSON task spec (see `schemas/task.schema.json`).
    #[arg(long)]
    task: Option<PathBuf>,
    /// Iteration budget (overrides the task file and config).
    #[arg(long)]
    budget: Option<u32>,
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Cancel the task after this many seconds of wall-clock time.
    #[arg(long)]
    max_runtime_secs: Option<u64>,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    // Usage errors share the INVALID code instead of clap's default of 2.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            err.print().context("print usage")?;
            return Ok(if err.use_stderr() {
                exit_codes::INVALID
            } else {
                exit_codes::OK
            });
        }
    };
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::Config { config, init } => cmd_config(&config, init),
    }
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let config = load_config(&args.config)?;
    let mut spec = build_spec(&args, &config)?;
    if let Some(budget) = args.budget {
        spec.iteration_budget = budget;
    }

    let cancel = CancelToken::new();
    if let Some(secs) = args.max_runtime_secs {
        let token = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(secs));
            warn!(secs, "runtime limit reached, cancelling");
            token.cancel();
        });
    }

    let budget = spec.iteration_budget;
    let report = execute(spec, &config, &LeaseRegistry::new(), cancel)?;
    let mut payload = serde_json::to_string_pretty(&report).context("serialize report")?;
    payload.push('\n');
    print!("{payload}");

    Ok(match &report.outcome {
        Outcome::Succeeded { .. } => exit_codes::OK,
        Outcome::Exhausted => {
            eprintln!("{}", ControllerError::BudgetExhausted { budget });
            exit_codes::EXHAUSTED
        }
        Outcome::Aborted { reason } => {
            eprintln!("{reason}");
            exit_codes::ABORTED
        }
    })
}

fn build_spec(args: &RunArgs, config: &LoopConfig) -> Result<TaskSpec> {
    if let Some(path) = &args.task {
        let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        return load_task_spec(&raw, config.iteration_budget)
            .with_context(|| format!("load task {}", path.display()));
    }

    let requirement = match (&args.requirement, &args.requirement_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        (None, None) => bail!("one of --requirement, --requirement-file or --task is required"),
    };
    let Some(repository) = args.repo.clone() else {
        bail!("--repo is required without --task");
    };
    let spec = TaskSpec {
        requirement: requirement.trim().to_string(),
        repository,
        base_branch: args.base.clone(),
        working_branch: args.branch.clone(),
        iteration_budget: config.iteration_budget,
    };
    spec.validate()?;
    Ok(spec)
}

fn cmd_config(path: &Path, init: bool) -> Result<i32> {
    if init && !path.exists() {
        write_config(path, &LoopConfig::default())?;
    }
    let config = load_config(path)?;
    print!("{}", render_config(&config)?);
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_requirement() {
        let cli = Cli::parse_from([
            "codeloop",
            "run",
            "--repo",
            ".",
            "--requirement",
            "add a health endpoint",
            "--budget",
            "3",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.repo.as_deref(), Some("."));
        assert_eq!(args.base, "main");
        assert_eq!(args.budget, Some(3));
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG));
    }

    #[test]
    fn run_requires_a_requirement_source() {
        assert!(Cli::try_parse_from(["codeloop", "run", "--repo", "."]).is_err());
        assert!(
            Cli::try_parse_from([
                "codeloop",
                "run",
                "--repo",
                ".",
                "--requirement",
                "x",
                "--task",
                "t.json"
            ])
            .is_err()
        );
    }

    #[test]
    fn run_with_task_rejects_repo_flag() {
        assert!(Cli::try_parse_from(["codeloop", "run", "--task", "t.json"]).is_ok());
        assert!(
            Cli::try_parse_from(["codeloop", "run", "--task", "t.json", "--repo", "."]).is_err()
        );
    }

    #[test]
    fn spec_from_flags_uses_config_budget() {
        let cli = Cli::parse_from([
            "codeloop",
            "run",
            "--repo",
            "/repo",
            "--branch",
            "feature/x",
            "--requirement",
            "  do it  ",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let mut config = LoopConfig::default();
        config.iteration_budget = 7;
        let spec = build_spec(&args, &config).expect("spec");
        assert_eq!(spec.requirement, "do it");
        assert_eq!(spec.iteration_budget, 7);
        assert_eq!(spec.working_branch.as_deref(), Some("feature/x"));
    }
}
