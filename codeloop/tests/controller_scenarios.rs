//! End-to-end controller scenarios against real temporary git repositories.
//!
//! Each test prepares a working branch with `GitWorkspace` in its own
//! checkout, drives `run_task` with scripted or command-backed
//! collaborators, and checks both the report and the resulting branch.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use codeloop::cancel::CancelToken;
use codeloop::controller::{RunOptions, run_task};
use codeloop::core::errors::{ControllerError, GenerationError};
use codeloop::core::types::{IterationTag, Outcome, Task, TaskSpec};
use codeloop::core::verdict::{CheckReport, Finding, Severity};
use codeloop::io::checks::CommandCheck;
use codeloop::io::gate::QualityGate;
use codeloop::io::generator::CommandGenerator;
use codeloop::io::git::{Git, GitIdentity};
use codeloop::io::workspace::{
    GitWorkspace, LeaseRegistry, PrepareOptions, WorkspaceManager,
};
use codeloop::test_support::{ScriptedCheck, ScriptedGenerator, TestRepo, create_patch};

const BRANCH: &str = "codeloop/it";

fn task(repo: &TestRepo, budget: u32) -> Task {
    Task::start(
        TaskSpec {
            requirement: "add a notes file".to_string(),
            repository: repo.path().display().to_string(),
            base_branch: "main".to_string(),
            working_branch: Some(BRANCH.to_string()),
            iteration_budget: budget,
        },
        "task-it".to_string(),
        Utc::now(),
    )
    .expect("task")
}

fn prepare(repo: &TestRepo, checkout_dir: &Path, registry: &LeaseRegistry) -> GitWorkspace {
    let options = PrepareOptions {
        identity: GitIdentity::default(),
        checkout_dir: checkout_dir.to_path_buf(),
        remote_timeout: Duration::from_secs(30),
    };
    GitWorkspace::prepare(
        &repo.path().display().to_string(),
        "main",
        BRANCH,
        &options,
        registry.clone(),
    )
    .expect("prepare")
}

fn gate(check: ScriptedCheck) -> QualityGate {
    QualityGate::new(Duration::from_secs(30)).with_check(check)
}

fn failing() -> Result<CheckReport, codeloop::core::errors::GateError> {
    Ok(CheckReport::fail(vec![Finding::new(
        "ci",
        Severity::Error,
        "tests failed",
    )]))
}

fn branch_head(repo: &TestRepo) -> String {
    repo.git(&["rev-parse", BRANCH])
        .expect("rev-parse")
        .trim()
        .to_string()
}

fn checkout_is_clean(ws: &GitWorkspace) -> bool {
    Git::new(ws.root())
        .status_porcelain()
        .expect("status")
        .is_empty()
}

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

#[test]
fn always_failing_gate_exhausts_budget_and_restores_base() {
    let repo = TestRepo::new().expect("repo");
    let base = repo.head().expect("head");
    let checkouts = tempfile::tempdir().expect("tempdir");
    let registry = LeaseRegistry::new();
    let mut ws = prepare(&repo, &checkouts.path().join("it"), &registry);

    let generator = ScriptedGenerator::new(vec![
        Ok(create_patch("one.txt")),
        Ok(create_patch("two.txt")),
        Ok(create_patch("three.txt")),
        Ok(create_patch("four.txt")),
    ]);
    let report = run_task(
        &task(&repo, 3),
        &mut ws,
        &generator,
        &gate(ScriptedCheck::new("ci", Vec::new(), failing())),
        &RunOptions::default(),
        |_| {},
    );

    assert_eq!(report.outcome, Outcome::Exhausted);
    assert_eq!(report.iterations.len(), 3);
    assert!(
        report
            .iterations
            .iter()
            .all(|it| it.tag == IterationTag::AppliedFail)
    );
    assert_eq!(generator.calls(), 3);
    assert_eq!(report.final_commit, None);
    assert_eq!(branch_head(&repo), base);
    assert!(checkout_is_clean(&ws));
    assert_eq!(
        ws.snapshot().expect("snapshot").files,
        vec!["README.md".to_string()]
    );
}

#[test]
fn third_attempt_passes_and_only_it_survives() {
    let repo = TestRepo::new().expect("repo");
    let base = repo.head().expect("head");
    let checkouts = tempfile::tempdir().expect("tempdir");
    let registry = LeaseRegistry::new();
    let mut ws = prepare(&repo, &checkouts.path().join("it"), &registry);

    let generator = ScriptedGenerator::new(vec![
        Ok(create_patch("one.txt")),
        Ok(create_patch("two.txt")),
        Ok(create_patch("three.txt")),
    ]);
    let check = ScriptedCheck::new("ci", vec![failing(), failing()], Ok(CheckReport::pass()));
    let report = run_task(
        &task(&repo, 5),
        &mut ws,
        &generator,
        &gate(check),
        &RunOptions::default(),
        |_| {},
    );

    let Outcome::Succeeded { final_commit } = &report.outcome else {
        panic!("expected success, got {:?}", report.outcome);
    };
    assert_eq!(report.iterations.len(), 3);
    assert_eq!(report.iterations[2].tag, IterationTag::AppliedPass);
    assert_eq!(final_commit.branch, BRANCH);
    assert_eq!(final_commit.sha, branch_head(&repo));
    assert_eq!(report.final_commit.as_ref(), Some(final_commit));

    let files = repo
        .git(&["ls-tree", "--name-only", BRANCH])
        .expect("ls-tree");
    assert_eq!(files, "README.md\nthree.txt\n");
    let parents = repo
        .git(&["rev-list", "--count", &format!("{base}..{BRANCH}")])
        .expect("count");
    assert_eq!(parents.trim(), "1");
    assert!(!ws.has_pending());
}

#[test]
fn failing_findings_are_carried_to_the_next_proposal() {
    let repo = TestRepo::new().expect("repo");
    let checkouts = tempfile::tempdir().expect("tempdir");
    let registry = LeaseRegistry::new();
    let mut ws = prepare(&repo, &checkouts.path().join("it"), &registry);

    let generator = ScriptedGenerator::new(vec![
        Ok(create_patch("one.txt")),
        Ok(create_patch("one.txt")),
    ]);
    let check = ScriptedCheck::new("ci", vec![failing()], Ok(CheckReport::pass()));
    let report = run_task(
        &task(&repo, 2),
        &mut ws,
        &generator,
        &gate(check),
        &RunOptions::default(),
        |_| {},
    );

    assert!(matches!(report.outcome, Outcome::Succeeded { .. }));
    let seen = generator.seen_findings();
    assert!(seen[0].is_empty());
    assert_eq!(seen[1][0].message, "tests failed");
}

#[test]
fn upstream_outage_costs_one_iteration() {
    let repo = TestRepo::new().expect("repo");
    let base = repo.head().expect("head");
    let checkouts = tempfile::tempdir().expect("tempdir");
    let registry = LeaseRegistry::new();
    let mut ws = prepare(&repo, &checkouts.path().join("it"), &registry);

    let generator = ScriptedGenerator::new(vec![
        Err(GenerationError::UpstreamUnavailable("503".to_string())),
        Ok(create_patch("notes.txt")),
    ]);
    let mut logged = Vec::new();
    let report = run_task(
        &task(&repo, 5),
        &mut ws,
        &generator,
        &gate(ScriptedCheck::new("ci", Vec::new(), Ok(CheckReport::pass()))),
        &RunOptions::default(),
        |it| logged.push(it.tag),
    );

    assert!(matches!(report.outcome, Outcome::Succeeded { .. }));
    assert_eq!(
        logged,
        vec![IterationTag::GenerationError, IterationTag::AppliedPass]
    );
    assert_eq!(report.iterations[0].error.as_deref(), Some("generator upstream unavailable: 503"));
    assert_ne!(branch_head(&repo), base);
    assert_eq!(
        repo.git(&["show", &format!("{BRANCH}:notes.txt")])
            .expect("show"),
        "notes.txt\n"
    );
}

#[test]
fn second_writer_on_same_branch_aborts_busy() {
    let repo = TestRepo::new().expect("repo");
    let checkouts = tempfile::tempdir().expect("tempdir");
    let registry = LeaseRegistry::new();
    let mut first = prepare(&repo, &checkouts.path().join("first"), &registry);
    first
        .apply(&create_patch("first.txt"))
        .expect("first writer applies");

    let mut second = prepare(&repo, &checkouts.path().join("second"), &registry);
    let generator = ScriptedGenerator::new(vec![Ok(create_patch("second.txt"))]);
    let report = run_task(
        &task(&repo, 3),
        &mut second,
        &generator,
        &gate(ScriptedCheck::new("ci", Vec::new(), Ok(CheckReport::pass()))),
        &RunOptions::default(),
        |_| {},
    );

    assert_eq!(
        report.outcome,
        Outcome::Aborted {
            reason: ControllerError::Busy {
                branch: BRANCH.to_string()
            }
        }
    );
    assert_eq!(report.iterations.len(), 1);
    assert_eq!(report.iterations[0].tag, IterationTag::ApplyError);
    assert!(!first.root().join("second.txt").exists());
    assert!(first.root().join("first.txt").exists());
    assert!(first.has_pending());
}

#[test]
fn no_actionable_change_aborts_within_one_iteration() {
    let repo = TestRepo::new().expect("repo");
    let base = repo.head().expect("head");
    let checkouts = tempfile::tempdir().expect("tempdir");
    let registry = LeaseRegistry::new();
    let mut ws = prepare(&repo, &checkouts.path().join("it"), &registry);

    let generator = ScriptedGenerator::new(vec![Err(GenerationError::NoActionableChange(
        "requirement already satisfied".to_string(),
    ))]);
    let report = run_task(
        &task(&repo, 5),
        &mut ws,
        &generator,
        &gate(ScriptedCheck::new("ci", Vec::new(), Ok(CheckReport::pass()))),
        &RunOptions::default(),
        |_| {},
    );

    assert!(matches!(
        report.outcome,
        Outcome::Aborted {
            reason: ControllerError::Unactionable { .. }
        }
    ));
    assert_eq!(report.iterations.len(), 1);
    assert_eq!(branch_head(&repo), base);
}

#[test]
fn cancellation_after_failed_verdict_leaves_base() {
    let repo = TestRepo::new().expect("repo");
    let base = repo.head().expect("head");
    let checkouts = tempfile::tempdir().expect("tempdir");
    let registry = LeaseRegistry::new();
    let mut ws = prepare(&repo, &checkouts.path().join("it"), &registry);

    let cancel = CancelToken::new();
    let options = RunOptions {
        cancel: cancel.clone(),
        ..RunOptions::default()
    };
    let generator = ScriptedGenerator::new(vec![
        Ok(create_patch("one.txt")),
        Ok(create_patch("two.txt")),
    ]);
    let check = ScriptedCheck::new("ci", Vec::new(), failing()).cancel_on_run(cancel);
    let report = run_task(&task(&repo, 5), &mut ws, &generator, &gate(check), &options, |_| {});

    assert_eq!(
        report.outcome,
        Outcome::Aborted {
            reason: ControllerError::Cancelled
        }
    );
    assert_eq!(report.iterations.len(), 1);
    assert_eq!(generator.calls(), 1);
    assert_eq!(branch_head(&repo), base);
    assert!(!ws.root().join("one.txt").exists());
}

#[test]
fn command_generator_and_check_drive_a_real_change() {
    let repo = TestRepo::new().expect("repo");
    let checkouts = tempfile::tempdir().expect("tempdir");
    let registry = LeaseRegistry::new();
    let mut ws = prepare(&repo, &checkouts.path().join("it"), &registry);

    let script = r#"if [ "$CODELOOP_ITERATION" = "1" ]; then echo "agent offline" >&2; exit 1; fi
cat <<'EOF'
Here is the change:
```diff
diff --git a/hello.txt b/hello.txt
new file mode 100644
--- /dev/null
+++ b/hello.txt
@@ -0,0 +1 @@
+hello
```
EOF
"#;
    let generator = CommandGenerator::new(sh(script), 64 * 1024);
    let gate = QualityGate::new(Duration::from_secs(30)).with_check(CommandCheck::new(
        "hello",
        sh("grep -q hello hello.txt"),
        64 * 1024,
    ));
    let report = run_task(
        &task(&repo, 3),
        &mut ws,
        &generator,
        &gate,
        &RunOptions::default(),
        |_| {},
    );

    assert!(
        matches!(report.outcome, Outcome::Succeeded { .. }),
        "{:?}",
        report.outcome
    );
    assert_eq!(report.iterations.len(), 2);
    assert_eq!(report.iterations[0].tag, IterationTag::GenerationError);
    assert_eq!(
        repo.git(&["show", &format!("{BRANCH}:hello.txt")])
            .expect("show"),
        "hello\n"
    );
    assert!(checkout_is_clean(&ws));
}
