//! Patch model: an ordered, immutable set of file-level edits.

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditOp {
    Create,
    Modify,
    Delete,
}

/// Payload of an edit: full file content or a unified diff for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "lowercase")]
pub enum EditBody {
    Content(String),
    Diff(String),
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    /// Worktree-relative path with `/` separators.
    pub path: String,
    pub op: EditOp,
    pub body: EditBody,
}

impl FileEdit {
    pub fn create(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: EditOp::Create,
            body: EditBody::Content(content.into()),
        }
    }

    pub fn replace(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: EditOp::Modify,
            body: EditBody::Content(content.into()),
        }
    }

    pub fn diff(path: impl Into<String>, diff: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: EditOp::Modify,
            body: EditBody::Diff(diff.into()),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: EditOp::Delete,
            body: EditBody::Empty,
        }
    }
}

/// Ordered set of edits proposed by one iteration.
///
/// Construction never fails so that a generator can hand over whatever it
/// produced; structural problems are reported by [`Patch::validate`] when the
/// workspace tries to apply it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    edits: Vec<FileEdit>,
}

impl Patch {
    pub fn new(edits: Vec<FileEdit>) -> Self {
        Self { edits }
    }

    pub fn edits(&self) -> &[FileEdit] {
        &self.edits
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn touched_paths(&self) -> Vec<&str> {
        self.edits.iter().map(|e| e.path.as_str()).collect()
    }

    /// Check structural well-formedness without touching the filesystem.
    ///
    /// Returns every violation found, in edit order.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.edits.is_empty() {
            errors.push("patch has no edits".to_string());
            return errors;
        }

        let mut seen = HashSet::new();
        for edit in &self.edits {
            if let Err(reason) = check_relative_path(&edit.path) {
                errors.push(format!("`{}`: {reason}", edit.path));
                continue;
            }
            if !seen.insert(edit.path.as_str()) {
                errors.push(format!("`{}`: edited more than once", edit.path));
            }
            match (edit.op, &edit.body) {
                (EditOp::Create, EditBody::Content(_)) => {}
                (EditOp::Modify, EditBody::Content(_) | EditBody::Diff(_)) => {}
                (EditOp::Delete, EditBody::Empty) => {}
                (op, body) => errors.push(format!(
                    "`{}`: {op:?} cannot carry a {} body",
                    edit.path,
                    body_kind(body)
                )),
            }
            if let EditBody::Diff(diff) = &edit.body
                && !diff.lines().any(|l| l.starts_with("@@"))
            {
                errors.push(format!("`{}`: diff has no hunks", edit.path));
            }
        }
        errors
    }
}

impl fmt::Display for Patch {
    /// Compact summary such as `3 edits: +new.rs ~lib.rs -old.rs`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.edits.len() == 1 { "edit" } else { "edits" };
        write!(f, "{} {noun}:", self.edits.len())?;
        for edit in &self.edits {
            let sigil = match edit.op {
                EditOp::Create => '+',
                EditOp::Modify => '~',
                EditOp::Delete => '-',
            };
            write!(f, " {sigil}{}", edit.path)?;
        }
        Ok(())
    }
}

fn body_kind(body: &EditBody) -> &'static str {
    match body {
        EditBody::Content(_) => "content",
        EditBody::Diff(_) => "diff",
        EditBody::Empty => "empty",
    }
}

/// Reject paths that are absolute, escape the worktree, or touch `.git`.
pub fn check_relative_path(path: &str) -> Result<(), &'static str> {
    if path.trim().is_empty() {
        return Err("empty path");
    }
    let mut depth = 0usize;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(name) => {
                if depth == 0 && name == ".git" {
                    return Err("path inside .git");
                }
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => return Err("path escapes the worktree"),
            Component::RootDir | Component::Prefix(_) => return Err("absolute path"),
        }
    }
    if depth == 0 {
        return Err("path names no file");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_patch_has_no_violations() {
        let patch = Patch::new(vec![
            FileEdit::create("src/new.rs", "fn main() {}\n"),
            FileEdit::diff("src/lib.rs", "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-a\n+b\n"),
            FileEdit::delete("old.txt"),
        ]);
        assert!(patch.validate().is_empty());
    }

    #[test]
    fn empty_patch_is_rejected() {
        let errors = Patch::new(Vec::new()).validate();
        assert_eq!(errors, vec!["patch has no edits".to_string()]);
    }

    #[test]
    fn escaping_and_git_paths_are_rejected() {
        let patch = Patch::new(vec![
            FileEdit::create("../outside.txt", "x"),
            FileEdit::create("/etc/passwd", "x"),
            FileEdit::create(".git/config", "x"),
        ]);
        let errors = patch.validate();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("escapes"));
        assert!(errors[1].contains("absolute"));
        assert!(errors[2].contains(".git"));
    }

    #[test]
    fn nested_git_named_dirs_are_allowed() {
        assert!(check_relative_path("docs/.git/notes.md").is_ok());
        assert!(check_relative_path("./src/lib.rs").is_ok());
    }

    #[test]
    fn duplicate_paths_and_mismatched_bodies_are_rejected() {
        let patch = Patch::new(vec![
            FileEdit::create("a.txt", "one"),
            FileEdit::replace("a.txt", "two"),
            FileEdit {
                path: "b.txt".to_string(),
                op: EditOp::Delete,
                body: EditBody::Content("x".to_string()),
            },
        ]);
        let errors = patch.validate();
        assert!(errors.iter().any(|e| e.contains("more than once")));
        assert!(errors.iter().any(|e| e.contains("Delete cannot carry a content body")));
    }

    #[test]
    fn diff_without_hunks_is_rejected() {
        let patch = Patch::new(vec![FileEdit::diff("a.txt", "--- a/a.txt\n+++ b/a.txt\n")]);
        assert!(patch.validate()[0].contains("no hunks"));
    }

    #[test]
    fn display_summarizes_edits_in_order() {
        let patch = Patch::new(vec![
            FileEdit::create("new.rs", ""),
            FileEdit::replace("lib.rs", ""),
            FileEdit::delete("old.rs"),
        ]);
        assert_eq!(patch.to_string(), "3 edits: +new.rs ~lib.rs -old.rs");
    }
}
