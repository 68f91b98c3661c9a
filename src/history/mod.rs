// src/history/mod.rs

//! Per-task execution history for the up-to-date check.
//!
//! After a successful execution (or cache load) the engine records the
//! task's fingerprint and a hash of its output snapshots. Next build, a task
//! whose fingerprint and outputs both still match is `UpToDate`.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::fingerprint::Fingerprint;
use crate::fs::FileSystem;
use crate::hash::ContentHash;

/// Relative path (from the history directory) to the history file.
pub const HISTORY_FILE_NAME: &str = "task-history";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRecord {
    pub fingerprint: Fingerprint,
    pub outputs_hash: ContentHash,
}

/// Abstract storage for task execution history.
pub trait TaskHistory: Send + Sync {
    fn load(&self, task: &str) -> Result<Option<TaskRecord>>;
    fn save(&self, task: &str, record: TaskRecord) -> Result<()>;
    fn remove(&self, task: &str) -> Result<()>;
    /// Remove records for tasks that are not in `active_tasks`.
    fn prune(&self, active_tasks: &[&str]) -> Result<()>;
}

/// Stores history in `<dir>/task-history`, one `task fingerprint outputs`
/// line per task. The file is read once and rewritten on every change.
pub struct FileTaskHistory {
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
    records: Mutex<HashMap<String, TaskRecord>>,
}

impl std::fmt::Debug for FileTaskHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTaskHistory")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FileTaskHistory {
    pub fn open(dir: &Path, fs: Arc<dyn FileSystem>) -> Result<Self> {
        let path = dir.join(HISTORY_FILE_NAME);
        let records = load_all_records(fs.as_ref(), &path)?;
        debug!(path = ?path, records = records.len(), "loaded task history");
        Ok(Self {
            path,
            fs,
            records: Mutex::new(records),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, records: &HashMap<String, TaskRecord>) -> Result<()> {
        let mut names: Vec<&String> = records.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            let record = &records[name];
            out.push_str(&format!("{} {} {}\n", name, record.fingerprint, record.outputs_hash));
        }
        // Write-then-rename.
        let tmp = self.path.with_extension("tmp");
        self.fs.write(&tmp, out.as_bytes())?;
        self.fs.rename(&tmp, &self.path)
    }
}

impl TaskHistory for FileTaskHistory {
    fn load(&self, task: &str) -> Result<Option<TaskRecord>> {
        Ok(self.lock().get(task).copied())
    }

    fn save(&self, task: &str, record: TaskRecord) -> Result<()> {
        let mut records = self.lock();
        records.insert(task.to_string(), record);
        self.persist(&records)?;
        debug!(task = %task, fingerprint = %record.fingerprint, "stored task history (file)");
        Ok(())
    }

    fn remove(&self, task: &str) -> Result<()> {
        let mut records = self.lock();
        if records.remove(task).is_some() {
            self.persist(&records)?;
        }
        Ok(())
    }

    fn prune(&self, active_tasks: &[&str]) -> Result<()> {
        let mut records = self.lock();
        let initial_len = records.len();
        records.retain(|k, _| active_tasks.contains(&k.as_str()));

        if records.len() < initial_len {
            self.persist(&records)?;
            info!(
                removed = initial_len - records.len(),
                "pruned stale task history (file)"
            );
        }
        Ok(())
    }
}

/// Keeps history in memory only.
#[derive(Debug, Default)]
pub struct MemoryTaskHistory {
    records: Mutex<HashMap<String, TaskRecord>>,
}

impl MemoryTaskHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TaskHistory for MemoryTaskHistory {
    fn load(&self, task: &str) -> Result<Option<TaskRecord>> {
        Ok(self.lock().get(task).copied())
    }

    fn save(&self, task: &str, record: TaskRecord) -> Result<()> {
        self.lock().insert(task.to_string(), record);
        debug!(task = %task, fingerprint = %record.fingerprint, "stored task history (memory)");
        Ok(())
    }

    fn remove(&self, task: &str) -> Result<()> {
        self.lock().remove(task);
        Ok(())
    }

    fn prune(&self, active_tasks: &[&str]) -> Result<()> {
        let mut records = self.lock();
        let initial_len = records.len();
        records.retain(|k, _| active_tasks.contains(&k.as_str()));
        if records.len() < initial_len {
            info!(
                removed = initial_len - records.len(),
                "pruned stale task history (memory)"
            );
        }
        Ok(())
    }
}

fn load_all_records(fs: &dyn FileSystem, path: &Path) -> Result<HashMap<String, TaskRecord>> {
    if !fs.exists(path) {
        return Ok(HashMap::new());
    }

    let reader = BufReader::new(
        fs.open_read(path)
            .with_context(|| format!("opening task history at {:?}", path))?,
    );

    let mut map = HashMap::new();
    for line_res in reader.lines() {
        let line = line_res?;
        let mut parts = line.split_whitespace();
        let (Some(name), Some(fp), Some(outputs)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        // Unparseable lines are dropped; the task just runs again.
        if let (Some(fingerprint), Some(outputs_hash)) =
            (Fingerprint::from_hex(fp), ContentHash::from_hex(outputs))
        {
            map.insert(
                name.to_string(),
                TaskRecord {
                    fingerprint,
                    outputs_hash,
                },
            );
        }
    }
    Ok(map)
}
