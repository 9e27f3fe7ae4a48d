#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use crate::error::HiveError;
use crate::registry::model::{Task, TaskStatus, now_rfc3339};

/// Persistent task store backed by a single JSON array file.
///
/// Every mutation rewrites the whole file via write-temp-then-rename, so
/// readers only ever observe the prior or the new version. In-process
/// writers are serialized by the lock; external processes mutating the
/// file are a tolerated-but-unprotected case (the blackboard is advisory,
/// and the orchestrator re-verifies status inside [`Registry::claim`]).
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    lock: RwLock<()>,
}

impl Registry {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    /// Creates the registry file (and its directory) with an empty task
    /// list if it does not exist yet.
    pub fn ensure_exists(&self) -> Result<(), HiveError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        if self.path.exists() {
            return Ok(());
        }
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir).map_err(|source| HiveError::IoPath {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&self.path, b"[]").map_err(|source| HiveError::IoPath {
            path: self.path.clone(),
            source,
        })
    }

    pub fn load_all(&self) -> Result<Vec<Task>, HiveError> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        self.load_locked()
    }

    pub fn save_all(&self, tasks: &[Task]) -> Result<(), HiveError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        self.save_locked(tasks)
    }

    pub fn add(&self, task: &Task) -> Result<(), HiveError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut tasks = self.load_locked()?;
        if tasks.iter().any(|t| t.id == task.id) {
            return Err(HiveError::DuplicateTask(task.id.clone()));
        }
        tasks.push(task.clone());
        self.save_locked(&tasks)
    }

    pub fn delete(&self, id: &str) -> Result<(), HiveError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut tasks = self.load_locked()?;
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        if tasks.len() == before {
            return Err(HiveError::TaskNotFound(id.to_owned()));
        }
        self.save_locked(&tasks)
    }

    pub fn get(&self, id: &str) -> Result<Task, HiveError> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        let tasks = self.load_locked()?;
        tasks
            .into_iter()
            .find(|t| t.id == id)
            .ok_or_else(|| HiveError::TaskNotFound(id.to_owned()))
    }

    /// Replaces the stored record with the same id, stamping `updated_at`.
    pub fn update(&self, task: &Task) -> Result<(), HiveError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut tasks = self.load_locked()?;
        let slot = tasks
            .iter_mut()
            .find(|t| t.id == task.id)
            .ok_or_else(|| HiveError::TaskNotFound(task.id.clone()))?;
        let mut updated = task.clone();
        updated.updated_at = Some(now_rfc3339());
        *slot = updated;
        self.save_locked(&tasks)
    }

    /// Touches only status, `updated_at`, `fail_reason` (when `reason` is
    /// non-empty) and `completed_at` (when the new status is terminal).
    pub fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        reason: &str,
    ) -> Result<(), HiveError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut tasks = self.load_locked()?;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| HiveError::TaskNotFound(id.to_owned()))?;
        task.status = status;
        task.updated_at = Some(now_rfc3339());
        if !reason.is_empty() {
            task.fail_reason = reason.to_owned();
        }
        if status.is_terminal() {
            task.completed_at = Some(now_rfc3339());
        }
        self.save_locked(&tasks)
    }

    /// Returns a copy of the pending task with the greatest priority; ties
    /// go to the first-encountered record in file order.
    pub fn next_pending(&self) -> Result<Option<Task>, HiveError> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        let tasks = self.load_locked()?;
        let mut best: Option<&Task> = None;
        for t in &tasks {
            if t.status != TaskStatus::Pending {
                continue;
            }
            if best.is_none_or(|b| t.priority > b.priority) {
                best = Some(t);
            }
        }
        Ok(best.cloned())
    }

    /// Atomic compare-and-set: pending -> in_progress, stamping the worker
    /// and `started_at`. The status is re-verified under the writer lock
    /// because it may have drifted between `next_pending` and this call.
    pub fn claim(&self, id: &str, worker_id: u32) -> Result<(), HiveError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut tasks = self.load_locked()?;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| HiveError::TaskNotFound(id.to_owned()))?;
        if task.status != TaskStatus::Pending {
            return Err(HiveError::ClaimConflict {
                id: id.to_owned(),
                status: task.status,
            });
        }
        task.mark_in_progress(worker_id);
        self.save_locked(&tasks)
    }

    /// Startup recovery: resets every in_progress or reviewing task back to
    /// pending (a previous run may have died mid-flight). Returns how many
    /// were reset; idempotent.
    pub fn recover_active(&self) -> Result<usize, HiveError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut tasks = self.load_locked()?;
        let mut count = 0;
        for t in &mut tasks {
            if t.status.is_active() {
                t.reset_for_retry();
                count += 1;
            }
        }
        if count > 0 {
            self.save_locked(&tasks)?;
        }
        Ok(count)
    }

    /// Explicit reset of a task (typically terminal) so it dispatches again.
    pub fn reset_for_retry(&self, id: &str) -> Result<(), HiveError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut tasks = self.load_locked()?;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| HiveError::TaskNotFound(id.to_owned()))?;
        task.reset_for_retry();
        self.save_locked(&tasks)
    }

    pub fn count_by_status(&self) -> Result<BTreeMap<TaskStatus, usize>, HiveError> {
        let tasks = self.load_all()?;
        let mut counts = BTreeMap::new();
        for t in &tasks {
            *counts.entry(t.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn load_locked(&self) -> Result<Vec<Task>, HiveError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(HiveError::IoPath {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&data).map_err(|source| HiveError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save_locked(&self, tasks: &[Task]) -> Result<(), HiveError> {
        let data = serde_json::to_vec_pretty(tasks).map_err(|source| HiveError::Parse {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &data).map_err(|source| HiveError::IoPath {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| {
            let _ = std::fs::remove_file(&tmp);
            HiveError::IoPath {
                path: self.path.clone(),
                source,
            }
        })
    }
}
