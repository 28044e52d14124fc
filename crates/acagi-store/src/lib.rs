use acagi_core::{DiffSnapshot, ErrorRecord, Task, TaskEvent};
use fs2::FileExt;
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const DATASET_DIR: &str = "datasets";
pub const TASKS_FILE: &str = "tasks.jsonl";
pub const EVENTS_FILE: &str = "task_events.jsonl";
pub const DIFFS_FILE: &str = "diffs.jsonl";
pub const ERRORS_FILE: &str = "errors.jsonl";
pub const RUNS_DIR: &str = "runs";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("dataset directory already locked: {0}")]
    Locked(PathBuf),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One line of `tasks.jsonl`. Lines that fail to parse are carried through
/// rewrites untouched so an update never loses foreign records.
enum Line {
    Record(Map<String, Value>),
    Raw(String),
}

/// Append-only JSONL datasets rooted under `<workspace>/datasets/`. The
/// directory carries an advisory lock for the lifetime of the store; a
/// second store on the same directory fails fast instead of interleaving
/// writes.
pub struct TaskStore {
    workspace: PathBuf,
    dataset_dir: PathBuf,
    _lock: File,
}

impl TaskStore {
    pub fn open(workspace_root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let workspace = workspace_root.into();
        let dataset_dir = workspace.join(DATASET_DIR);
        fs::create_dir_all(&dataset_dir).map_err(|e| io_err(&dataset_dir, e))?;

        let lock_path = dataset_dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| io_err(&lock_path, e))?;
        lock.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(dataset_dir.clone()))?;

        debug!(event = "task_store_open", dir = %dataset_dir.display());
        Ok(Self {
            workspace,
            dataset_dir,
            _lock: lock,
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace
    }

    pub fn dataset_dir(&self) -> &Path {
        &self.dataset_dir
    }

    fn tasks_path(&self) -> PathBuf {
        self.dataset_dir.join(TASKS_FILE)
    }

    pub fn append_task(&self, task: &Task) -> Result<(), StoreError> {
        let line = serde_json::to_string(task)?;
        self.append_line(&self.tasks_path(), &line)
    }

    /// Merge `changes` into the record with the matching id and rewrite the
    /// dataset atomically. Keys in `changes` replace whole fields; fields not
    /// named survive untouched, including ones this crate does not model.
    pub fn update_task(&self, id: &str, changes: Map<String, Value>) -> Result<Task, StoreError> {
        let path = self.tasks_path();
        let mut lines = self.read_lines(&path)?;
        let mut updated: Option<Task> = None;

        for line in lines.iter_mut() {
            let record = match line {
                Line::Record(map) => map,
                Line::Raw(_) => continue,
            };
            if record.get("id").and_then(Value::as_str) != Some(id) {
                continue;
            }
            for (key, value) in &changes {
                record.insert(key.clone(), value.clone());
            }
            updated = Some(serde_json::from_value(Value::Object(record.clone()))?);
            break;
        }

        let task = updated.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.rewrite_lines(&path, &lines)?;
        Ok(task)
    }

    pub fn load_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let path = self.tasks_path();
        let mut tasks = Vec::new();
        for line in self.read_lines(&path)? {
            if let Line::Record(map) = line {
                match serde_json::from_value::<Task>(Value::Object(map)) {
                    Ok(task) => tasks.push(task),
                    Err(err) => warn!(event = "task_record_skipped", error = %err),
                }
            }
        }
        Ok(tasks)
    }

    pub fn find_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.load_tasks()?.into_iter().find(|t| t.id == id))
    }

    pub fn append_event(&self, event: &TaskEvent) -> Result<(), StoreError> {
        let line = serde_json::to_string(event)?;
        self.append_line(&self.dataset_dir.join(EVENTS_FILE), &line)
    }

    pub fn append_diff_snapshot(&self, snapshot: &DiffSnapshot) -> Result<(), StoreError> {
        let line = serde_json::to_string(snapshot)?;
        self.append_line(&self.dataset_dir.join(DIFFS_FILE), &line)
    }

    pub fn append_error_record(&self, record: &ErrorRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        self.append_line(&self.dataset_dir.join(ERRORS_FILE), &line)
    }

    pub fn load_events(&self, task_id: &str) -> Result<Vec<TaskEvent>, StoreError> {
        let path = self.dataset_dir.join(EVENTS_FILE);
        let mut events = Vec::new();
        for line in self.read_lines(&path)? {
            if let Line::Record(map) = line {
                match serde_json::from_value::<TaskEvent>(Value::Object(map)) {
                    Ok(event) if event.task_id == task_id => events.push(event),
                    Ok(_) => {}
                    Err(err) => warn!(event = "task_event_skipped", error = %err),
                }
            }
        }
        Ok(events)
    }

    /// Workspace-relative run-log location for a task, always with forward
    /// slashes so the value is portable inside JSON records.
    pub fn run_log_rel_path(task_id: &str) -> String {
        format!("{DATASET_DIR}/{RUNS_DIR}/{task_id}/run.log")
    }

    fn run_log_abs_path(&self, task: &Task) -> PathBuf {
        match &task.run_log_path {
            Some(rel) => self.workspace.join(rel.replace('/', std::path::MAIN_SEPARATOR_STR)),
            None => self
                .dataset_dir
                .join(RUNS_DIR)
                .join(&task.id)
                .join("run.log"),
        }
    }

    /// Append `lines` to the task's run log, each prefixed with `[channel] `
    /// when a channel is given. Returns the workspace-relative path so the
    /// caller can persist it on the task if it was previously unset.
    pub fn append_run_log(
        &self,
        task: &Task,
        lines: &[String],
        channel: Option<&str>,
    ) -> Result<String, StoreError> {
        let path = self.run_log_abs_path(task);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        for line in lines {
            let rendered = match channel {
                Some(channel) => format!("[{channel}] {line}\n"),
                None => format!("{line}\n"),
            };
            file.write_all(rendered.as_bytes())
                .map_err(|e| io_err(&path, e))?;
        }
        file.flush().map_err(|e| io_err(&path, e))?;

        Ok(task
            .run_log_path
            .clone()
            .unwrap_or_else(|| Self::run_log_rel_path(&task.id)))
    }

    pub fn load_run_log_tail(&self, task: &Task, max_lines: usize) -> Result<Vec<String>, StoreError> {
        let path = self.run_log_abs_path(task);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let lines: Vec<String> = contents.lines().map(str::to_string).collect();
        let start = lines.len().saturating_sub(max_lines);
        Ok(lines[start..].to_vec())
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| io_err(path, e))?;
        file.write_all(line.as_bytes()).map_err(|e| io_err(path, e))?;
        file.write_all(b"\n").map_err(|e| io_err(path, e))?;
        file.flush().map_err(|e| io_err(path, e))?;
        Ok(())
    }

    fn read_lines(&self, path: &Path) -> Result<Vec<Line>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).map_err(|e| io_err(path, e))?;
        let mut lines = Vec::new();
        for raw in BufReader::new(file).lines() {
            let raw = raw.map_err(|e| io_err(path, e))?;
            if raw.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Map<String, Value>>(&raw) {
                Ok(map) => lines.push(Line::Record(map)),
                Err(_) => {
                    warn!(event = "dataset_line_unparsed", path = %path.display());
                    lines.push(Line::Raw(raw));
                }
            }
        }
        Ok(lines)
    }

    fn rewrite_lines(&self, path: &Path, lines: &[Line]) -> Result<(), StoreError> {
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
            for line in lines {
                let rendered = match line {
                    Line::Record(map) => serde_json::to_string(map)?,
                    Line::Raw(raw) => raw.clone(),
                };
                file.write_all(rendered.as_bytes())
                    .map_err(|e| io_err(&tmp, e))?;
                file.write_all(b"\n").map_err(|e| io_err(&tmp, e))?;
            }
            file.sync_all().map_err(|e| io_err(&tmp, e))?;
        }
        fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
        Ok(())
    }
}
