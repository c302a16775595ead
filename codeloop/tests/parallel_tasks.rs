//! Tasks running side by side in one process through `task::execute_with`.
//!
//! Both tasks share one `LeaseRegistry`, the way a single `codeloop` process
//! does. Generators park inside `propose` so the two runs are guaranteed to
//! overlap.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Barrier, Mutex};
use std::thread;
use std::time::Duration;

use codeloop::cancel::CancelToken;
use codeloop::core::errors::{ControllerError, GenerationError};
use codeloop::core::patch::Patch;
use codeloop::core::types::{IterationTag, Outcome, TaskSpec};
use codeloop::core::verdict::{CheckReport, Finding, Severity};
use codeloop::io::config::LoopConfig;
use codeloop::io::gate::QualityGate;
use codeloop::io::generator::{ChangeGenerator, GenerationRequest};
use codeloop::io::workspace::LeaseRegistry;
use codeloop::task::execute_with;
use codeloop::test_support::{ScriptedCheck, ScriptedGenerator, TestRepo, create_patch};

/// Signals when `propose` is entered, then waits to be released.
struct ParkedGenerator {
    patch: Patch,
    entered: Sender<()>,
    release: Mutex<Receiver<()>>,
}

impl ChangeGenerator for ParkedGenerator {
    fn propose(&self, _request: &GenerationRequest) -> Result<Patch, GenerationError> {
        self.entered.send(()).expect("signal entered");
        let release = self.release.lock().expect("lock");
        release.recv().expect("release");
        Ok(self.patch.clone())
    }
}

/// Returns its patch once every task has reached `propose`.
struct RendezvousGenerator<'a> {
    patch: Patch,
    barrier: &'a Barrier,
}

impl ChangeGenerator for RendezvousGenerator<'_> {
    fn propose(&self, _request: &GenerationRequest) -> Result<Patch, GenerationError> {
        self.barrier.wait();
        Ok(self.patch.clone())
    }
}

fn spec(repo: &TestRepo, branch: &str, budget: u32) -> TaskSpec {
    TaskSpec {
        requirement: "add a file".to_string(),
        repository: repo.path().display().to_string(),
        base_branch: "main".to_string(),
        working_branch: Some(branch.to_string()),
        iteration_budget: budget,
    }
}

fn gate(report: CheckReport) -> QualityGate {
    QualityGate::new(Duration::from_secs(30)).with_check(ScriptedCheck::new(
        "ci",
        Vec::new(),
        Ok(report),
    ))
}

fn config(workdir: &std::path::Path) -> LoopConfig {
    let mut config = LoopConfig::default();
    config.workdir = workdir.to_path_buf();
    config
}

#[test]
fn second_task_on_same_branch_aborts_busy_and_keeps_first_change() {
    let repo = TestRepo::new().expect("repo");
    let workdir = tempfile::tempdir().expect("workdir");
    let config = config(workdir.path());
    let registry = LeaseRegistry::new();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let first_generator = ParkedGenerator {
        patch: create_patch("first.txt"),
        entered: entered_tx,
        release: Mutex::new(release_rx),
    };
    let second_generator = ScriptedGenerator::new(vec![Ok(create_patch("second.txt"))]);

    let (first, second) = thread::scope(|scope| {
        let first = scope.spawn(|| {
            execute_with(
                spec(&repo, "codeloop/shared", 3),
                &config,
                &registry,
                &first_generator,
                &gate(CheckReport::pass()),
                CancelToken::new(),
            )
        });
        entered_rx.recv().expect("first task is generating");

        let second = execute_with(
            spec(&repo, "codeloop/shared", 3),
            &config,
            &registry,
            &second_generator,
            &gate(CheckReport::pass()),
            CancelToken::new(),
        );
        release_tx.send(()).expect("release first task");
        (first.join().expect("first thread"), second)
    });

    let second = second.expect("second report");
    assert_eq!(
        second.outcome,
        Outcome::Aborted {
            reason: ControllerError::Busy {
                branch: "codeloop/shared".to_string()
            }
        }
    );
    assert_eq!(second.iterations.len(), 1);
    assert_eq!(second.iterations[0].tag, IterationTag::ApplyError);

    let first = first.expect("first report");
    let Outcome::Succeeded { final_commit } = &first.outcome else {
        panic!("expected success, got {:?}", first.outcome);
    };
    assert_eq!(
        repo.git(&["rev-parse", "codeloop/shared"])
            .expect("rev-parse")
            .trim(),
        final_commit.sha
    );
    assert_eq!(
        repo.git(&["ls-tree", "--name-only", "codeloop/shared"])
            .expect("ls-tree"),
        "README.md\nfirst.txt\n"
    );
}

#[test]
fn tasks_on_different_branches_run_independently() {
    let repo = TestRepo::new().expect("repo");
    let base = repo.head().expect("head");
    let workdir = tempfile::tempdir().expect("workdir");
    let config = config(workdir.path());
    let registry = LeaseRegistry::new();
    let barrier = Barrier::new(2);

    let failing = CheckReport::fail(vec![Finding::new("ci", Severity::Error, "tests failed")]);
    let alpha_generator = RendezvousGenerator {
        patch: create_patch("alpha.txt"),
        barrier: &barrier,
    };
    let beta_generator = RendezvousGenerator {
        patch: create_patch("beta.txt"),
        barrier: &barrier,
    };

    let (alpha, beta) = thread::scope(|scope| {
        let alpha = scope.spawn(|| {
            execute_with(
                spec(&repo, "codeloop/alpha", 1),
                &config,
                &registry,
                &alpha_generator,
                &gate(failing.clone()),
                CancelToken::new(),
            )
        });
        let beta = scope.spawn(|| {
            execute_with(
                spec(&repo, "codeloop/beta", 1),
                &config,
                &registry,
                &beta_generator,
                &gate(CheckReport::pass()),
                CancelToken::new(),
            )
        });
        (
            alpha.join().expect("alpha thread"),
            beta.join().expect("beta thread"),
        )
    });

    assert_eq!(alpha.expect("alpha report").outcome, Outcome::Exhausted);
    assert!(matches!(
        beta.expect("beta report").outcome,
        Outcome::Succeeded { .. }
    ));

    assert_eq!(
        repo.git(&["rev-parse", "codeloop/alpha"])
            .expect("rev-parse")
            .trim(),
        base
    );
    assert_eq!(
        repo.git(&["ls-tree", "--name-only", "codeloop/beta"])
            .expect("ls-tree"),
        "README.md\nbeta.txt\n"
    );
    assert_eq!(repo.head().expect("head"), base);
    assert_eq!(
        repo.git(&["branch", "--show-current"]).expect("branch").trim(),
        "main"
    );
    assert_eq!(repo.git(&["status", "--porcelain"]).expect("status"), "");
    assert_eq!(
        repo.git(&["worktree", "list", "--porcelain"])
            .expect("worktrees")
            .matches("worktree ")
            .count(),
        1
    );
}
