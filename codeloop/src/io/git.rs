//! Git adapter for the workspace.
//!
//! Every repository mutation goes through this small, explicit wrapper around
//! `git` subprocess calls so that commits are deterministic and failures carry
//! the command line that produced them.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::io::process::run_command_with_timeout;

const APPLY_OUTPUT_LIMIT: usize = 64 * 1024;
const APPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Author/committer used for provisional iteration commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            name: "codeloop".to_string(),
            email: "codeloop@localhost".to_string(),
        }
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    identity: Option<GitIdentity>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: GitIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Clone `url` into `dest` with a deadline.
    #[instrument(skip_all, fields(url, dest = %dest.display()))]
    pub fn clone_repo(url: &str, dest: &Path, timeout: Duration) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("--quiet").arg(url).arg(dest);
        let out = run_command_with_timeout(cmd, None, timeout, APPLY_OUTPUT_LIMIT)
            .with_context(|| format!("git clone {url}"))?;
        if out.timed_out {
            return Err(anyhow!(
                "git clone {url} timed out after {}s",
                timeout.as_secs()
            ));
        }
        if !out.status.success() {
            return Err(anyhow!("git clone {url} failed: {}", out.stderr_text().trim()));
        }
        debug!("clone finished");
        Ok(())
    }

    /// Fetch all remotes with a deadline.
    #[instrument(skip_all)]
    pub fn fetch(&self, timeout: Duration) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["fetch", "--all", "--prune", "--quiet"]);
        let out = run_command_with_timeout(cmd, None, timeout, APPLY_OUTPUT_LIMIT)
            .context("git fetch")?;
        if out.timed_out {
            return Err(anyhow!("git fetch timed out after {}s", timeout.as_secs()));
        }
        if !out.status.success() {
            return Err(anyhow!("git fetch failed: {}", out.stderr_text().trim()));
        }
        Ok(())
    }

    /// Resolve a path inside the git directory (e.g. `info/exclude`).
    pub fn git_path(&self, rel: &str) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--git-path", rel])?;
        let path = PathBuf::from(out.trim());
        if path.is_absolute() {
            return Ok(path);
        }
        Ok(self.workdir.join(path))
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        self.resolve("HEAD")
    }

    /// Full SHA of a revision, or an error if it does not resolve to a commit.
    pub fn resolve(&self, rev: &str) -> Result<String> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run_capture(&["rev-parse", "--verify", "--quiet", &spec])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is fully clean (including untracked files).
    #[instrument(skip_all)]
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(dirty_count = entries.len(), "worktree not clean");
        let mut msg = String::from("working tree not clean:\n");
        for entry in entries {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Create or reset `branch` to `start_point` and check it out.
    #[instrument(skip_all, fields(branch, start_point))]
    pub fn checkout_reset_branch(&self, branch: &str, start_point: &str) -> Result<()> {
        debug!(branch, start_point, "resetting branch from start point");
        self.run_checked(&["checkout", "--quiet", "-B", branch, start_point])?;
        Ok(())
    }

    /// Add a linked worktree at `path` with `branch` reset to `start_point`.
    #[instrument(skip_all, fields(path = %path.display(), branch, start_point))]
    pub fn add_worktree(&self, path: &Path, branch: &str, start_point: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        self.run_checked(&["worktree", "prune"])?;
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "add", "--quiet", "-B", branch, &path, start_point])?;
        debug!("worktree added");
        Ok(())
    }

    /// Remove a linked worktree, discarding anything left in it. The branch
    /// and its commits stay in the repository.
    pub fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", &path])?;
        Ok(())
    }

    /// True when `path` matches an ignore rule and is not tracked.
    pub fn is_ignored(&self, path: &str) -> Result<bool> {
        let out = self.run(&["check-ignore", "--quiet", "--", path])?;
        match out.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git check-ignore {path} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }

    /// Hard-reset the index and worktree to `rev`.
    #[instrument(skip_all, fields(rev))]
    pub fn reset_hard(&self, rev: &str) -> Result<()> {
        self.run_checked(&["reset", "--quiet", "--hard", rev])?;
        Ok(())
    }

    /// Remove untracked files and directories (ignored files are kept).
    pub fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-fdq"])?;
        Ok(())
    }

    /// Tracked files, sorted.
    pub fn ls_files(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["ls-files", "-z"])?;
        let mut files: Vec<String> = out
            .split('\0')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        files.sort();
        Ok(files)
    }

    /// Unified diff between two revisions.
    pub fn diff_range(&self, from: &str, to: &str) -> Result<String> {
        self.run_capture(&["diff", "--no-color", "--no-ext-diff", from, to])
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "--quiet", "--no-verify", "-m", message])?;
        Ok(true)
    }

    /// Dry-run a unified diff against the worktree.
    ///
    /// Returns the git error text when the diff does not apply.
    pub fn apply_check(&self, diff: &str) -> Result<Option<String>> {
        let out = self.apply_with(&["apply", "--check", "--whitespace=nowarn", "-"], diff)?;
        if out.0 {
            Ok(None)
        } else {
            Ok(Some(out.1))
        }
    }

    /// Apply a unified diff to the worktree, falling back to a 3-way merge.
    #[instrument(skip_all)]
    pub fn apply_diff(&self, diff: &str) -> Result<()> {
        let (ok, stderr) = self.apply_with(&["apply", "--whitespace=nowarn", "-"], diff)?;
        if ok {
            return Ok(());
        }
        debug!(err = %stderr, "plain apply failed, trying 3-way");
        let (ok, stderr3) = self.apply_with(&["apply", "--3way", "--whitespace=nowarn", "-"], diff)?;
        if ok {
            return Ok(());
        }
        Err(anyhow!(
            "git apply failed: {}; 3-way: {}",
            stderr.trim(),
            stderr3.trim()
        ))
    }

    fn apply_with(&self, args: &[&str], diff: &str) -> Result<(bool, String)> {
        let mut cmd = self.command();
        cmd.args(args);
        let out = run_command_with_timeout(cmd, Some(diff.as_bytes()), APPLY_TIMEOUT, APPLY_OUTPUT_LIMIT)
            .with_context(|| format!("git {}", args.join(" ")))?;
        if out.timed_out {
            return Err(anyhow!("git {} timed out", args.join(" ")));
        }
        Ok((out.status.success(), out.stderr_text()))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        self.command()
            .args(args)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.workdir);
        if let Some(id) = &self.identity {
            cmd.env("GIT_AUTHOR_NAME", &id.name)
                .env("GIT_AUTHOR_EMAIL", &id.email)
                .env("GIT_COMMITTER_NAME", &id.name)
                .env("GIT_COMMITTER_EMAIL", &id.email);
        }
        cmd
    }
}

/// True when `repo_ref` names something to clone rather than a local path.
pub fn is_remote_ref(repo_ref: &str) -> bool {
    repo_ref.contains("://") || (repo_ref.contains('@') && repo_ref.contains(':'))
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn remote_refs_are_detected() {
        assert!(is_remote_ref("https://example.com/org/repo.git"));
        assert!(is_remote_ref("git@example.com:org/repo.git"));
        assert!(!is_remote_ref("/srv/repos/project"));
        assert!(!is_remote_ref("../project"));
    }

    #[test]
    fn apply_check_and_apply_on_real_repo() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(root)
                .status()
                .expect("git");
            assert!(status.success(), "git {args:?}");
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(root.join("a.txt"), "one\n").expect("write");
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "init"]);

        let git = Git::new(root);
        let good = "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-one\n+two\n";
        let bad = "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-nope\n+two\n";
        assert_eq!(git.apply_check(good).expect("check"), None);
        assert!(git.apply_check(bad).expect("check").is_some());

        git.apply_diff(good).expect("apply");
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).expect("read"), "two\n");
        assert_eq!(git.ls_files().expect("ls"), vec!["a.txt".to_string()]);
        assert!(git.ensure_clean().is_err());
    }
}
