use acagi_core::bus::{EventBus, TOPIC_TASK_DIFF};
use acagi_core::{DiffSnapshot, Task};
use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use similar::{ChangeTag, TextDiff};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use acagi_store::{StoreError, TaskStore, DATASET_DIR, RUNS_DIR};

#[derive(Debug, Error)]
pub enum DiffError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn io_err(path: &Path, source: std::io::Error) -> DiffError {
    DiffError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Result of one recorded run: the run-scoped line counts, the files touched
/// by this run, and the task after its counters were folded in.
#[derive(Debug, Clone)]
pub struct DiffOutcome {
    pub added: u64,
    pub removed: u64,
    pub files: Vec<String>,
    pub task: Task,
}

/// Attributes working-tree line changes to a task. Uses git numstat when a
/// repository is present and falls back to per-task text snapshots for
/// untracked paths or bare directories.
pub struct DiffRecorder {
    store: Arc<TaskStore>,
    bus: EventBus,
}

impl DiffRecorder {
    pub fn new(store: Arc<TaskStore>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Measure changes since the last record and fold them into the task.
    /// Returns `Ok(None)` when nothing changed and no explicit targets were
    /// passed; in that case no file is written and no event fires.
    pub fn record_diff(
        &self,
        task_id: &str,
        files: &[String],
        workspace_root: &Path,
        ts: Option<DateTime<Utc>>,
    ) -> Result<Option<DiffOutcome>, DiffError> {
        let targets = resolve_targets(files, workspace_root);

        let mut run_added = 0u64;
        let mut run_removed = 0u64;
        let mut run_files: Vec<String> = Vec::new();
        let mut changed = false;

        let repo_root = git_repo_root(workspace_root);
        let mut snapshot_paths: Vec<String> = Vec::new();

        if let Some(repo_root) = repo_root.as_deref() {
            let mut args: Vec<String> = vec!["diff".into(), "--numstat".into(), "HEAD".into()];
            if !targets.is_empty() {
                args.push("--".into());
                for target in &targets {
                    args.push(repo_relative(&target.abs, repo_root, workspace_root));
                }
            }
            match run_git(workspace_root, &args) {
                Ok(output) => {
                    for entry in parse_numstat(&output) {
                        let rel = workspace_relative_from_repo(&entry.path, repo_root, workspace_root);
                        run_added += entry.added;
                        run_removed += entry.removed;
                        push_unique(&mut run_files, rel);
                        changed = true;
                    }
                }
                Err(err) => warn!(event = "numstat_failed", error = %err),
            }

            // Untracked paths never show in numstat; route them through the
            // snapshot fallback.
            let mut status_args: Vec<String> = vec!["status".into(), "--porcelain".into()];
            if !targets.is_empty() {
                status_args.push("--".into());
                for target in &targets {
                    status_args.push(repo_relative(&target.abs, repo_root, workspace_root));
                }
            }
            if let Ok(output) = run_git(workspace_root, &status_args) {
                for line in output.lines() {
                    if let Some(path) = line.strip_prefix("?? ") {
                        snapshot_paths.push(workspace_relative_from_repo(
                            path.trim(),
                            repo_root,
                            workspace_root,
                        ));
                    }
                }
            }
        } else if !targets.is_empty() {
            snapshot_paths = targets.iter().map(|t| t.rel.clone()).collect();
        }

        for rel in snapshot_paths {
            match self.snapshot_diff(task_id, &rel, workspace_root) {
                Ok(Some((added, removed))) => {
                    run_added += added;
                    run_removed += removed;
                    push_unique(&mut run_files, rel);
                    changed = true;
                }
                Ok(None) => {}
                Err(err) => warn!(event = "snapshot_diff_failed", path = %rel, error = %err),
            }
        }

        // Explicit targets stay on the record even when untouched.
        for target in &targets {
            push_unique(&mut run_files, target.rel.clone());
        }

        if !changed && targets.is_empty() {
            debug!(event = "record_diff_noop", task_id = %task_id);
            return Ok(None);
        }

        let ts = ts.unwrap_or_else(Utc::now);
        let current = self
            .store
            .find_task(task_id)?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;

        let total_added = current.diffs.added.saturating_add(run_added);
        let total_removed = current.diffs.removed.saturating_add(run_removed);
        let mut merged_files = current.files.clone();
        for file in &run_files {
            push_unique(&mut merged_files, file.clone());
        }

        let mut changes = Map::new();
        changes.insert(
            "diffs".to_string(),
            json!({"added": total_added, "removed": total_removed}),
        );
        changes.insert("files".to_string(), serde_json::to_value(&merged_files)?);
        changes.insert("updated_ts".to_string(), serde_json::to_value(ts)?);
        let task = self.store.update_task(task_id, changes)?;

        self.store.append_diff_snapshot(&DiffSnapshot {
            ts,
            task_id: task_id.to_string(),
            added: run_added,
            removed: run_removed,
            files: run_files.clone(),
        })?;

        if let Err(err) = self.bus.publish(
            TOPIC_TASK_DIFF,
            json!({
                "id": task_id,
                "added": run_added,
                "removed": run_removed,
                "files": run_files,
            }),
        ) {
            warn!(event = "task_diff_publish_failed", error = %err);
        }

        Ok(Some(DiffOutcome {
            added: run_added,
            removed: run_removed,
            files: run_files,
            task,
        }))
    }

    /// Diff a workspace file against its stored snapshot, then refresh the
    /// snapshot. `None` means the file matches its snapshot exactly.
    fn snapshot_diff(
        &self,
        task_id: &str,
        rel: &str,
        workspace_root: &Path,
    ) -> Result<Option<(u64, u64)>, DiffError> {
        let file_path = workspace_root.join(rel);
        let snap_path = self
            .store
            .dataset_dir()
            .join(RUNS_DIR)
            .join(task_id)
            .join("snapshot")
            .join(rel);

        let previous = match fs::read(&snap_path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        };
        let current = match fs::read(&file_path) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(_) => None,
        };

        match current {
            Some(current) => {
                if current == previous {
                    return Ok(None);
                }
                let (added, removed) = count_line_changes(&previous, &current);
                if let Some(parent) = snap_path.parent() {
                    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
                }
                fs::write(&snap_path, current.as_bytes()).map_err(|e| io_err(&snap_path, e))?;
                Ok(Some((added, removed)))
            }
            None => {
                if previous.is_empty() {
                    return Ok(None);
                }
                let removed = previous.lines().count() as u64;
                let _ = fs::remove_file(&snap_path);
                Ok(Some((0, removed)))
            }
        }
    }
}

struct ResolvedTarget {
    abs: PathBuf,
    rel: String,
}

fn resolve_targets(files: &[String], workspace_root: &Path) -> Vec<ResolvedTarget> {
    let mut targets = Vec::new();
    for file in files {
        let raw = PathBuf::from(file);
        let abs = if raw.is_absolute() {
            raw
        } else {
            workspace_root.join(&raw)
        };
        match abs.strip_prefix(workspace_root) {
            Ok(rel) => targets.push(ResolvedTarget {
                abs: abs.clone(),
                rel: path_to_slash(rel),
            }),
            Err(_) => warn!(event = "diff_target_outside_workspace", path = %abs.display()),
        }
    }
    targets
}

fn path_to_slash(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

fn repo_relative(abs: &Path, repo_root: &Path, workspace_root: &Path) -> String {
    match abs.strip_prefix(repo_root) {
        Ok(rel) => path_to_slash(rel),
        Err(_) => match abs.strip_prefix(workspace_root) {
            Ok(rel) => path_to_slash(rel),
            Err(_) => abs.to_string_lossy().into_owned(),
        },
    }
}

/// Map a repo-relative path from git output back to workspace-relative form.
fn workspace_relative_from_repo(path: &str, repo_root: &Path, workspace_root: &Path) -> String {
    let abs = repo_root.join(path);
    match abs.strip_prefix(workspace_root) {
        Ok(rel) => path_to_slash(rel),
        Err(_) => path.to_string(),
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.iter().any(|existing| existing == &value) {
        list.push(value);
    }
}

fn git_repo_root(workspace_root: &Path) -> Option<PathBuf> {
    let args: Vec<String> = vec!["rev-parse".into(), "--show-toplevel".into()];
    match run_git(workspace_root, &args) {
        Ok(output) => {
            let root = output.trim();
            if root.is_empty() {
                None
            } else {
                Some(PathBuf::from(root))
            }
        }
        Err(err) => {
            debug!(event = "git_root_unavailable", error = %err);
            None
        }
    }
}

fn run_git(cwd: &Path, args: &[String]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|err| err.to_string())?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(stderr);
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[derive(Debug, PartialEq, Eq)]
struct NumstatEntry {
    added: u64,
    removed: u64,
    path: String,
}

fn parse_numstat(output: &str) -> Vec<NumstatEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let mut parts = line.splitn(3, '\t');
        let additions = parts.next().unwrap_or("0");
        let deletions = parts.next().unwrap_or("0");
        let path = parts.next().unwrap_or("");
        if path.is_empty() {
            continue;
        }
        entries.push(NumstatEntry {
            added: additions.parse::<u64>().unwrap_or(0),
            removed: deletions.parse::<u64>().unwrap_or(0),
            path: normalize_rename(path),
        });
    }
    entries
}

/// Renames appear as `src/{old => new}/f.rs`, `old => new`, or `old -> new`;
/// all resolve to the new path.
fn normalize_rename(path: &str) -> String {
    if let (Some(open), Some(close)) = (path.find('{'), path.find('}')) {
        if open < close {
            let inside = &path[open + 1..close];
            if let Some((_, new)) = inside.split_once(" => ") {
                let mut joined = format!("{}{}{}", &path[..open], new, &path[close + 1..]);
                while joined.contains("//") {
                    joined = joined.replace("//", "/");
                }
                return joined.trim_matches('/').to_string();
            }
        }
    }
    if let Some((_, new)) = path.split_once(" => ") {
        return new.trim().to_string();
    }
    if let Some((_, new)) = path.split_once(" -> ") {
        return new.trim().to_string();
    }
    path.to_string()
}

fn count_line_changes(previous: &str, current: &str) -> (u64, u64) {
    let diff = TextDiff::from_lines(previous, current);
    let mut added = 0u64;
    let mut removed = 0u64;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => added += 1,
            ChangeTag::Delete => removed += 1,
            ChangeTag::Equal => {}
        }
    }
    (added, removed)
}

/// Snapshot directory for one task, exposed for cleanup tooling.
pub fn snapshot_dir(store: &TaskStore, task_id: &str) -> PathBuf {
    store
        .workspace_root()
        .join(DATASET_DIR)
        .join(RUNS_DIR)
        .join(task_id)
        .join("snapshot")
}
