//! Turn free-form generator output into a [`Patch`].
//!
//! Generators are asked for a unified diff but often wrap it in markdown
//! fences, prefix it with a plan, or spell `/dev/null` creatively. This module
//! locates the diff, normalizes it and splits it into one [`FileEdit`] per
//! file.

use thiserror::Error;

use crate::core::patch::{FileEdit, Patch};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    /// Output was blank: the generator proposes no change.
    #[error("generator output is empty")]
    Empty,
    #[error("generator output contains no unified diff")]
    NoDiff,
    #[error("unusable diff: {0}")]
    Invalid(String),
}

/// Parse generator output into a patch.
pub fn parse_patch(output: &str) -> Result<Patch, DiffError> {
    if output.trim().is_empty() {
        return Err(DiffError::Empty);
    }
    let block = extract_diff_block(output).ok_or(DiffError::NoDiff)?;
    let block = normalize_dev_null(&block);
    let sections = split_sections(&block);
    if sections.is_empty() {
        return Err(DiffError::NoDiff);
    }
    let edits = sections
        .iter()
        .map(|section| section_to_edit(section))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Patch::new(edits))
}

/// Strip markdown fences and return the text from the first diff header on.
pub fn extract_diff_block(text: &str) -> Option<String> {
    let unfenced = text
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");

    let start = find_line_start(&unfenced, "diff --git ")
        .or_else(|| find_line_start(&unfenced, "--- "))?;
    Some(format!("{}\n", unfenced[start..].trim_end()))
}

fn find_line_start(text: &str, prefix: &str) -> Option<usize> {
    if text.starts_with(prefix) {
        return Some(0);
    }
    text.find(&format!("\n{prefix}")).map(|idx| idx + 1)
}

/// Rewrite `--- dev/null`, `--- a/dev/null` and friends to `/dev/null`.
pub fn normalize_dev_null(diff: &str) -> String {
    let mut out = String::with_capacity(diff.len());
    for line in diff.lines() {
        let mut replaced = false;
        for marker in ["--- ", "+++ "] {
            if let Some(rhs) = line.strip_prefix(marker) {
                let norm = rhs.trim().replace('\\', "/");
                let norm = norm.trim_start_matches(['.', '/']);
                if norm == "dev/null" || norm.ends_with("/dev/null") {
                    out.push_str(marker);
                    out.push_str("/dev/null\n");
                    replaced = true;
                }
                break;
            }
        }
        if !replaced {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Split a multi-file diff into per-file sections.
fn split_sections(diff: &str) -> Vec<Vec<&str>> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut sections: Vec<Vec<&str>> = Vec::new();
    let mut in_hunks = false;

    for (idx, line) in lines.iter().enumerate() {
        let starts_git = line.starts_with("diff --git ");
        let starts_plain = line.starts_with("--- ")
            && lines.get(idx + 1).is_some_and(|next| next.starts_with("+++ "))
            && (sections.is_empty() || in_hunks);
        if starts_git || starts_plain {
            sections.push(Vec::new());
            in_hunks = false;
        }
        let Some(current) = sections.last_mut() else {
            continue;
        };
        if line.starts_with("@@") {
            in_hunks = true;
        }
        current.push(line);
    }
    sections
}

fn section_to_edit(section: &[&str]) -> Result<FileEdit, DiffError> {
    let header = section.first().copied().unwrap_or_default();
    let old = header_path(section, "--- ");
    let new = header_path(section, "+++ ");
    let (git_old, git_new) = git_header_paths(header);

    let is_new_file = old.as_deref() == Some("/dev/null")
        || (old.is_none() && section.iter().any(|l| l.starts_with("new file mode")));
    let is_deleted = new.as_deref() == Some("/dev/null")
        || (new.is_none() && section.iter().any(|l| l.starts_with("deleted file mode")));

    if is_new_file {
        let path = new
            .or(git_new)
            .ok_or_else(|| DiffError::Invalid(format!("no target path in `{header}`")))?;
        return Ok(FileEdit::create(path, added_content(section)));
    }
    if is_deleted {
        let path = old
            .or(git_old)
            .ok_or_else(|| DiffError::Invalid(format!("no source path in `{header}`")))?;
        return Ok(FileEdit::delete(path));
    }

    let (Some(old), Some(new)) = (old.or(git_old), new.or(git_new)) else {
        return Err(DiffError::Invalid(format!("no file headers in `{header}`")));
    };
    if old != new {
        return Err(DiffError::Invalid(format!(
            "rename of `{old}` to `{new}` is not supported"
        )));
    }

    let mut body = format!("--- a/{new}\n+++ b/{new}\n");
    let hunks_start = section.iter().position(|l| l.starts_with("@@"));
    if let Some(start) = hunks_start {
        for line in &section[start..] {
            body.push_str(line);
            body.push('\n');
        }
    }
    Ok(FileEdit::diff(new, body))
}

fn header_path(section: &[&str], prefix: &str) -> Option<String> {
    let line = section.iter().find(|l| l.starts_with(prefix))?;
    let raw = line[prefix.len()..].split('\t').next().unwrap_or_default().trim();
    if raw == "/dev/null" {
        return Some(raw.to_string());
    }
    Some(strip_side_prefix(raw).to_string())
}

fn git_header_paths(header: &str) -> (Option<String>, Option<String>) {
    let Some(rest) = header.strip_prefix("diff --git ") else {
        return (None, None);
    };
    match rest.split_once(" b/") {
        Some((old, new)) => (
            Some(strip_side_prefix(old).to_string()),
            Some(new.trim().to_string()),
        ),
        None => (None, None),
    }
}

fn strip_side_prefix(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

/// Rebuild file content from the `+` lines of a new-file diff.
fn added_content(section: &[&str]) -> String {
    let mut content = String::new();
    let mut in_hunks = false;
    for line in section {
        if line.starts_with("@@") {
            in_hunks = true;
            continue;
        }
        if !in_hunks {
            continue;
        }
        if let Some(added) = line.strip_prefix('+') {
            content.push_str(added);
            content.push('\n');
        } else if line.starts_with("\\ No newline") && content.ends_with('\n') {
            content.pop();
        }
    }
    content
}
