//! Workspace manager: a git checkout on the working branch that applies
//! patches atomically and can revert the last one.
//!
//! Every applied patch becomes one provisional commit on the working branch.
//! Reverting is a hard reset to the head recorded before that commit, so the
//! branch only ever shows the base state or whole patches on top of it.
//!
//! Each prepared task works in its own checkout: a linked worktree for local
//! repositories, a clone for remote ones. Tasks on different branches never
//! share a working tree.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::errors::{ApplyError, RevertError, WorkspaceError};
use crate::core::patch::{EditBody, EditOp, FileEdit, Patch};
use crate::core::types::CommitRef;
use crate::io::git::{Git, GitIdentity, is_remote_ref};

/// Read-only view of the workspace handed to generators and checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceState {
    pub root: PathBuf,
    pub branch: String,
    pub head: String,
    /// Head of the base branch when the workspace was prepared.
    pub base_head: String,
    /// Tracked files, sorted.
    pub files: Vec<String>,
}

/// Operations the controller needs from a workspace.
pub trait WorkspaceManager {
    fn snapshot(&self) -> Result<WorkspaceState, WorkspaceError>;

    /// Apply every edit or none of them.
    fn apply(&mut self, patch: &Patch) -> Result<(), ApplyError>;

    /// Undo the most recent un-finalized apply.
    fn revert_last(&mut self) -> Result<(), RevertError>;

    /// Accept the current state and release write access.
    fn finalize(&mut self) -> Result<CommitRef, WorkspaceError>;

    fn has_pending(&self) -> bool;
}

/// Process-wide record of which (repository, branch) pairs have a writer,
/// and the checkout that writer works in.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct LeaseRegistry {
    held: Arc<Mutex<HashMap<(String, String), PathBuf>>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for a writer in `checkout`, or `None` if another handle
    /// holds it. Never blocks on the holder.
    pub fn try_acquire(&self, repo: &str, branch: &str, checkout: &Path) -> Option<Lease> {
        let key = (repo.to_string(), branch.to_string());
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(checkout.to_path_buf());
                Some(Lease {
                    registry: self.clone(),
                    key,
                })
            }
        }
    }

    /// Checkout of the current writer on `branch`, if there is one.
    pub fn holder(&self, repo: &str, branch: &str) -> Option<PathBuf> {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.get(&(repo.to_string(), branch.to_string())).cloned()
    }
}

/// Exclusive write access to one branch. Released on drop.
#[derive(Debug)]
pub struct Lease {
    registry: LeaseRegistry,
    key: (String, String),
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut held = self
            .registry
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
        debug!(repo = %self.key.0, branch = %self.key.1, "lease released");
    }
}

/// Inputs for [`GitWorkspace::prepare`].
#[derive(Debug, Clone)]
pub struct PrepareOptions {
    pub identity: GitIdentity,
    /// Directory for this task's checkout. Must not exist yet for local
    /// repositories; a clone already there is fetched and reused.
    pub checkout_dir: PathBuf,
    pub remote_timeout: Duration,
}

/// Git-backed [`WorkspaceManager`].
#[derive(Debug)]
pub struct GitWorkspace {
    git: Git,
    root: PathBuf,
    branch: String,
    base_head: String,
    lease_key: String,
    registry: LeaseRegistry,
    lease: Option<Lease>,
    /// Attached to another task's checkout; `apply` always reports `Busy`.
    read_only: bool,
    /// Repository that owns `root` as a linked worktree created by `prepare`.
    linked_from: Option<Git>,
    /// Heads recorded before each pending apply, oldest first.
    pending: Vec<String>,
    applied: u32,
}

impl GitWorkspace {
    /// Give the task its own checkout of `repo_ref` with `working_branch`
    /// reset to `base_branch`, and take the writer lease for that branch.
    ///
    /// When another handle already writes `working_branch`, the result is a
    /// read-only handle on that writer's checkout: snapshots work, `apply`
    /// fails with `Busy`, and nothing in git is touched.
    #[instrument(skip_all, fields(repo = repo_ref, base = base_branch, branch = working_branch))]
    pub fn prepare(
        repo_ref: &str,
        base_branch: &str,
        working_branch: &str,
        options: &PrepareOptions,
        registry: LeaseRegistry,
    ) -> Result<Self, WorkspaceError> {
        let remote = is_remote_ref(repo_ref);
        let lease_key = if remote {
            repo_ref.to_string()
        } else {
            fs::canonicalize(repo_ref)
                .map_err(|e| WorkspaceError(format!("open repository {repo_ref}: {e}")))?
                .display()
                .to_string()
        };
        let checkout = std::path::absolute(&options.checkout_dir).map_err(|e| {
            WorkspaceError(format!("resolve {}: {e}", options.checkout_dir.display()))
        })?;

        let Some(lease) = registry.try_acquire(&lease_key, working_branch, &checkout) else {
            return Self::observe(registry, lease_key, working_branch, options.identity.clone());
        };

        let linked_from = if remote {
            let git = Git::new(&checkout);
            if checkout.join(".git").is_dir() {
                debug!(dest = %checkout.display(), "reusing existing clone");
                git.fetch(options.remote_timeout).map_err(ws_err)?;
            } else {
                Git::clone_repo(repo_ref, &checkout, options.remote_timeout).map_err(ws_err)?;
            }
            git.ensure_clean().map_err(ws_err)?;
            let start = start_point(&git, base_branch)?;
            git.checkout_reset_branch(working_branch, &start)
                .map_err(ws_err)?;
            None
        } else {
            let source = Git::new(&lease_key);
            let start = start_point(&source, base_branch)?;
            source
                .add_worktree(&checkout, working_branch, &start)
                .map_err(ws_err)?;
            Some(source)
        };
        info!(checkout = %checkout.display(), "workspace prepared");

        let git = Git::new(&checkout).with_identity(options.identity.clone());
        match Self::attach(git, &checkout, working_branch, lease_key, registry) {
            Ok(mut workspace) => {
                workspace.lease = Some(lease);
                workspace.linked_from = linked_from;
                Ok(workspace)
            }
            Err(err) => {
                if let Some(source) = linked_from
                    && let Err(e) = source.remove_worktree(&checkout)
                {
                    warn!(err = %e, "failed to remove worktree after attach error");
                }
                Err(err)
            }
        }
    }

    /// Attach to a checkout that is already on `branch`. The lease is taken
    /// by the first `apply`.
    pub fn open(
        root: impl AsRef<Path>,
        branch: &str,
        identity: GitIdentity,
        registry: LeaseRegistry,
    ) -> Result<Self, WorkspaceError> {
        let root = root.as_ref();
        let lease_key = fs::canonicalize(root)
            .map_err(|e| WorkspaceError(format!("open repository {}: {e}", root.display())))?
            .display()
            .to_string();
        let git = Git::new(root).with_identity(identity);
        Self::attach(git, root, branch, lease_key, registry)
    }

    /// Read-only handle on the checkout of whoever writes `branch` now.
    fn observe(
        registry: LeaseRegistry,
        lease_key: String,
        branch: &str,
        identity: GitIdentity,
    ) -> Result<Self, WorkspaceError> {
        let root = registry
            .holder(&lease_key, branch)
            .ok_or_else(|| WorkspaceError(format!("branch `{branch}` is busy")))?;
        warn!(branch, holder = %root.display(), "branch already has a writer, attaching read-only");
        let git = Git::new(&root).with_identity(identity);
        let mut workspace = Self::attach(git, &root, branch, lease_key, registry)?;
        workspace.read_only = true;
        Ok(workspace)
    }

    fn attach(
        git: Git,
        root: &Path,
        branch: &str,
        lease_key: String,
        registry: LeaseRegistry,
    ) -> Result<Self, WorkspaceError> {
        let root = fs::canonicalize(root)
            .map_err(|e| WorkspaceError(format!("open checkout {}: {e}", root.display())))?;
        let current = git.current_branch().map_err(ws_err)?;
        if current != branch {
            return Err(WorkspaceError(format!(
                "expected branch `{branch}` to be checked out, found `{current}`"
            )));
        }
        let base_head = git.head_sha().map_err(ws_err)?;
        Ok(Self {
            git,
            root,
            branch: branch.to_string(),
            base_head,
            lease_key,
            registry,
            lease: None,
            read_only: false,
            linked_from: None,
            pending: Vec::new(),
            applied: 0,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_lease(&mut self) -> Result<(), ApplyError> {
        if self.lease.is_some() {
            return Ok(());
        }
        let lease = if self.read_only {
            None
        } else {
            self.registry
                .try_acquire(&self.lease_key, &self.branch, &self.root)
        };
        match lease {
            Some(lease) => {
                debug!(branch = %self.branch, "lease acquired");
                self.lease = Some(lease);
                Ok(())
            }
            None => {
                warn!(branch = %self.branch, "branch already has a writer");
                Err(ApplyError::Busy {
                    branch: self.branch.clone(),
                })
            }
        }
    }

    /// Check each edit against the current tree without changing it.
    fn preflight(&self, patch: &Patch) -> Result<(), ApplyError> {
        for edit in patch.edits() {
            if self.git.is_ignored(&edit.path).map_err(io_failure)? {
                return Err(ApplyError::MalformedPatch(format!(
                    "`{}` is ignored by git",
                    edit.path
                )));
            }
            let target = self.root.join(&edit.path);
            let exists = fs::symlink_metadata(&target).is_ok();
            match edit.op {
                EditOp::Create if exists => return Err(conflict(edit, "already exists")),
                EditOp::Modify | EditOp::Delete if !exists => {
                    return Err(conflict(edit, "does not exist"));
                }
                EditOp::Modify | EditOp::Delete if target.is_dir() => {
                    return Err(conflict(edit, "is a directory"));
                }
                _ => {}
            }
            if let EditBody::Diff(diff) = &edit.body
                && let Some(reason) = self.git.apply_check(diff).map_err(io_failure)?
            {
                if is_corrupt_diff(&reason) {
                    return Err(ApplyError::MalformedPatch(format!(
                        "`{}`: {}",
                        edit.path,
                        reason.trim()
                    )));
                }
                return Err(conflict(edit, reason.trim()));
            }
        }
        Ok(())
    }

    fn write_edits(&self, patch: &Patch) -> anyhow::Result<()> {
        use anyhow::Context;

        for edit in patch.edits() {
            let target = self.root.join(&edit.path);
            match (&edit.op, &edit.body) {
                (EditOp::Delete, _) => {
                    fs::remove_file(&target)
                        .with_context(|| format!("remove {}", target.display()))?;
                }
                (_, EditBody::Content(content)) => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)
                            .with_context(|| format!("create {}", parent.display()))?;
                    }
                    fs::write(&target, content)
                        .with_context(|| format!("write {}", target.display()))?;
                }
                (_, EditBody::Diff(diff)) => self.git.apply_diff(diff)?,
                (_, EditBody::Empty) => {}
            }
        }
        Ok(())
    }

    fn restore(&self, pre_images: &[(PathBuf, Option<Vec<u8>>)], head: &str) {
        for (path, content) in pre_images.iter().rev() {
            let result = match content {
                Some(bytes) => fs::write(path, bytes),
                None if path.exists() => fs::remove_file(path),
                None => Ok(()),
            };
            if let Err(e) = result {
                warn!(path = %path.display(), err = %e, "failed to restore pre-image");
            }
        }
        if let Err(e) = self.git.reset_hard(head) {
            warn!(err = %e, "reset after failed apply did not complete");
        }
        if let Err(e) = self.git.clean_untracked() {
            warn!(err = %e, "clean after failed apply did not complete");
        }
    }
}

impl Drop for GitWorkspace {
    fn drop(&mut self) {
        if let Some(source) = &self.linked_from {
            match source.remove_worktree(&self.root) {
                Ok(()) => debug!(checkout = %self.root.display(), "worktree removed"),
                Err(e) => warn!(checkout = %self.root.display(), err = %e, "failed to remove worktree"),
            }
        }
    }
}

fn start_point(git: &Git, base_branch: &str) -> Result<String, WorkspaceError> {
    let start = if git.resolve(base_branch).is_ok() {
        base_branch.to_string()
    } else {
        format!("origin/{base_branch}")
    };
    git.resolve(&start)
        .map_err(|_| WorkspaceError(format!("base branch `{base_branch}` not found")))?;
    Ok(start)
}

impl WorkspaceManager for GitWorkspace {
    fn snapshot(&self) -> Result<WorkspaceState, WorkspaceError> {
        Ok(WorkspaceState {
            root: self.root.clone(),
            branch: self.branch.clone(),
            head: self.git.head_sha().map_err(ws_err)?,
            base_head: self.base_head.clone(),
            files: self.git.ls_files().map_err(ws_err)?,
        })
    }

    #[instrument(skip_all, fields(branch = %self.branch, patch = %patch))]
    fn apply(&mut self, patch: &Patch) -> Result<(), ApplyError> {
        self.ensure_lease()?;

        let violations = patch.validate();
        if !violations.is_empty() {
            return Err(ApplyError::MalformedPatch(violations.join("; ")));
        }
        self.preflight(patch)?;

        let prev_head = self.git.head_sha().map_err(io_failure)?;
        let pre_images: Vec<(PathBuf, Option<Vec<u8>>)> = patch
            .edits()
            .iter()
            .map(|edit| {
                let path = self.root.join(&edit.path);
                let content = fs::read(&path).ok();
                (path, content)
            })
            .collect();

        let seq = self.applied + 1;
        let result = self.write_edits(patch).and_then(|()| {
            self.git.add_all()?;
            self.git
                .commit_staged(&format!("codeloop: iteration {seq}\n\n{patch}"))
        });
        match result {
            Ok(true) => {}
            Ok(false) => {
                warn!("patch leaves the tree unchanged, restoring workspace");
                self.restore(&pre_images, &prev_head);
                return Err(ApplyError::MalformedPatch(
                    "patch produces no change".to_string(),
                ));
            }
            Err(e) => {
                warn!(err = %e, "apply failed, restoring workspace");
                self.restore(&pre_images, &prev_head);
                return Err(io_failure(e));
            }
        }

        self.applied = seq;
        self.pending.push(prev_head);
        debug!(pending = self.pending.len(), "patch applied");
        Ok(())
    }

    #[instrument(skip_all, fields(branch = %self.branch))]
    fn revert_last(&mut self) -> Result<(), RevertError> {
        let head = self.pending.last().cloned().ok_or(RevertError::NothingToRevert)?;
        self.git
            .reset_hard(&head)
            .and_then(|()| self.git.clean_untracked())
            .map_err(|e| RevertError::Failed(format!("{e:#}")))?;
        self.pending.pop();
        debug!(head = %head, "reverted last patch");
        Ok(())
    }

    #[instrument(skip_all, fields(branch = %self.branch))]
    fn finalize(&mut self) -> Result<CommitRef, WorkspaceError> {
        self.git.ensure_clean().map_err(ws_err)?;
        let sha = self.git.head_sha().map_err(ws_err)?;
        self.pending.clear();
        self.lease = None;
        info!(sha = %sha, "workspace finalized");
        Ok(CommitRef {
            branch: self.branch.clone(),
            sha,
        })
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

fn conflict(edit: &FileEdit, reason: &str) -> ApplyError {
    ApplyError::PathConflict {
        path: edit.path.clone(),
        reason: reason.to_string(),
    }
}

fn is_corrupt_diff(reason: &str) -> bool {
    reason.contains("corrupt patch")
        || reason.contains("No valid patches")
        || reason.contains("unrecognized input")
}

fn io_failure(err: anyhow::Error) -> ApplyError {
    ApplyError::IoFailure(format!("{err:#}"))
}

fn ws_err(err: anyhow::Error) -> WorkspaceError {
    WorkspaceError(format!("{err:#}"))
}
