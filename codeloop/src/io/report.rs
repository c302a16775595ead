//! On-disk task log under `<workdir>/tasks/<task-id>/`.
//!
//! ```text
//! task.json                  started task
//! iterations/<seq>/meta.json tag, error, gate attempts, timestamp
//! iterations/<seq>/patch.json
//! iterations/<seq>/verdict.json
//! report.json                final TaskReport
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{Iteration, IterationTag, Task, TaskReport};
use crate::core::verdict::VerdictStatus;

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta<'a> {
    pub task_id: &'a str,
    pub seq: u32,
    pub tag: IterationTag,
    pub verdict: Option<VerdictStatus>,
    pub error: Option<&'a str>,
    pub gate_attempts: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub patch_path: PathBuf,
    pub verdict_path: PathBuf,
}

impl IterationPaths {
    pub fn new(task_dir: &Path, seq: u32) -> Self {
        let dir = task_dir.join("iterations").join(seq.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            patch_path: dir.join("patch.json"),
            verdict_path: dir.join("verdict.json"),
            dir,
        }
    }
}

/// Writer for one task's log directory.
#[derive(Debug, Clone)]
pub struct TaskLog {
    task_id: String,
    dir: PathBuf,
}

impl TaskLog {
    pub fn new(workdir: &Path, task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            dir: workdir.join("tasks").join(task_id),
        }
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join("report.json")
    }

    pub fn write_task(&self, task: &Task) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create task dir {}", self.dir.display()))?;
        write_json(&self.dir.join("task.json"), task)
    }

    pub fn write_iteration(&self, iteration: &Iteration) -> Result<IterationPaths> {
        let paths = IterationPaths::new(&self.dir, iteration.seq);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

        let meta = IterationMeta {
            task_id: &self.task_id,
            seq: iteration.seq,
            tag: iteration.tag,
            verdict: iteration.verdict.as_ref().map(|v| v.status()),
            error: iteration.error.as_deref(),
            gate_attempts: iteration.gate_attempts,
            at: iteration.at,
        };
        write_json(&paths.meta_path, &meta)?;
        if let Some(patch) = &iteration.patch {
            write_json(&paths.patch_path, patch)?;
        }
        if let Some(verdict) = &iteration.verdict {
            write_json(&paths.verdict_path, verdict)?;
        }
        debug!(seq = iteration.seq, dir = %paths.dir.display(), "iteration logged");
        Ok(paths)
    }

    pub fn write_report(&self, report: &TaskReport) -> Result<PathBuf> {
        let path = self.report_path();
        let mut buf = serde_json::to_string_pretty(report).context("serialize report")?;
        buf.push('\n');
        write_atomic(&path, &buf)?;
        Ok(path)
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("report path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp report {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace report {}", path.display()))?;
    Ok(())
}
