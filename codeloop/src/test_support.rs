//! Test doubles and fixtures shared by unit and integration tests.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::core::errors::{ApplyError, GateError, GenerationError, RevertError, WorkspaceError};
use crate::core::patch::{EditBody, EditOp, FileEdit, Patch};
use crate::core::types::CommitRef;
use crate::core::verdict::{CheckReport, Finding};
use crate::io::gate::{Check, CheckRequest};
use crate::io::generator::{ChangeGenerator, GenerationRequest};
use crate::io::workspace::{WorkspaceManager, WorkspaceState};

/// Temporary git repository on `main` with one commit holding `README.md`.
pub struct TestRepo {
    temp: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let repo = Self { temp };
        repo.git(&["init", "-q", "-b", "main"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "Test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "# test repo\n")?;
        repo.commit_all("initial commit")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "-m", message])?;
        Ok(())
    }

    pub fn head(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Run git in the repository and return stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Patch creating `path` with the content `"<path>\n"`.
pub fn create_patch(path: &str) -> Patch {
    Patch::new(vec![FileEdit::create(path, format!("{path}\n"))])
}

/// Generator replaying a fixed script of responses.
///
/// Once the script runs out every call returns `NoActionableChange`.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Patch, GenerationError>>>,
    seen: Mutex<Vec<Vec<Finding>>>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Result<Patch, GenerationError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Prior findings passed to each `propose` call, in call order.
    pub fn seen_findings(&self) -> Vec<Vec<Finding>> {
        self.seen.lock().expect("seen lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().expect("seen lock").len()
    }
}

impl ChangeGenerator for ScriptedGenerator {
    fn propose(&self, request: &GenerationRequest) -> Result<Patch, GenerationError> {
        self.seen
            .lock()
            .expect("seen lock")
            .push(request.prior_findings.clone());
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| {
                Err(GenerationError::NoActionableChange(
                    "script exhausted".to_string(),
                ))
            })
    }
}

/// Check replaying a sequence of results, then repeating a default.
pub struct ScriptedCheck {
    name: String,
    script: Mutex<VecDeque<Result<CheckReport, GateError>>>,
    default: Result<CheckReport, GateError>,
    cancel: Option<CancelToken>,
    runs: AtomicU32,
}

impl ScriptedCheck {
    pub fn new(
        name: &str,
        script: Vec<Result<CheckReport, GateError>>,
        default: Result<CheckReport, GateError>,
    ) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            default,
            cancel: None,
            runs: AtomicU32::new(0),
        }
    }

    /// Trip `token` every time the check runs.
    pub fn cancel_on_run(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Check for ScriptedCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _request: &CheckRequest) -> Result<CheckReport, GateError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel {
            token.cancel();
        }
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// In-memory workspace with the same apply/revert contract as the git one.
///
/// Diff bodies are not interpreted and fail with `IoFailure`.
pub struct MemoryWorkspace {
    files: BTreeMap<String, String>,
    pending: Vec<BTreeMap<String, String>>,
    commits: u32,
    busy: bool,
}

impl Default for MemoryWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            pending: Vec::new(),
            commits: 0,
            busy: false,
        }
    }

    pub fn with_files(paths: &[&str]) -> Self {
        let mut ws = Self::new();
        for path in paths {
            ws.files.insert((*path).to_string(), format!("{path}\n"));
        }
        ws
    }

    /// Make every `apply` fail with `Busy`.
    pub fn busy(mut self) -> Self {
        self.busy = true;
        self
    }

    pub fn files(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }
}

impl WorkspaceManager for MemoryWorkspace {
    fn snapshot(&self) -> Result<WorkspaceState, WorkspaceError> {
        Ok(WorkspaceState {
            root: PathBuf::from("/memory"),
            branch: "memory".to_string(),
            head: format!("commit-{}", self.commits),
            base_head: "commit-0".to_string(),
            files: self.files(),
        })
    }

    fn apply(&mut self, patch: &Patch) -> Result<(), ApplyError> {
        if self.busy {
            return Err(ApplyError::Busy {
                branch: "memory".to_string(),
            });
        }
        let violations = patch.validate();
        if !violations.is_empty() {
            return Err(ApplyError::MalformedPatch(violations.join("; ")));
        }
        let mut next = self.files.clone();
        for edit in patch.edits() {
            let exists = next.contains_key(&edit.path);
            match (edit.op, &edit.body) {
                (EditOp::Create, _) if exists => {
                    return Err(ApplyError::PathConflict {
                        path: edit.path.clone(),
                        reason: "already exists".to_string(),
                    });
                }
                (EditOp::Modify | EditOp::Delete, _) if !exists => {
                    return Err(ApplyError::PathConflict {
                        path: edit.path.clone(),
                        reason: "does not exist".to_string(),
                    });
                }
                (EditOp::Delete, _) => {
                    next.remove(&edit.path);
                }
                (_, EditBody::Content(content)) => {
                    next.insert(edit.path.clone(), content.clone());
                }
                (_, _) => {
                    return Err(ApplyError::IoFailure(format!(
                        "`{}`: unsupported body in memory workspace",
                        edit.path
                    )));
                }
            }
        }
        self.pending.push(std::mem::replace(&mut self.files, next));
        self.commits += 1;
        Ok(())
    }

    fn revert_last(&mut self) -> Result<(), RevertError> {
        let previous = self.pending.pop().ok_or(RevertError::NothingToRevert)?;
        self.files = previous;
        self.commits -= 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<CommitRef, WorkspaceError> {
        self.pending.clear();
        Ok(CommitRef {
            branch: "memory".to_string(),
            sha: format!("commit-{}", self.commits),
        })
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
