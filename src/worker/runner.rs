#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Deserialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::AgentDriver;
use crate::config::Config;
use crate::error::HiveError;
use crate::registry::model::{Task, TaskStatus};

pub const PLAN_START: &str = "### PLAN_START ###";
pub const PLAN_END: &str = "### PLAN_END ###";

/// Transient record emitted on the pool's result channel; never persisted.
#[derive(Debug)]
pub struct TaskResult {
    pub task: Task,
    pub status: TaskStatus,
    pub worker_id: u32,
    pub duration: Duration,
    /// Empty on success.
    pub fail_reason: String,
    pub output: String,
    /// Sub-tasks parsed from an embedded plan block.
    pub new_tasks: Vec<Task>,
}

/// Processes one task at a time end-to-end: prompt assembly, driver
/// execution under the task deadline, plan extraction, classification.
#[derive(Clone)]
pub struct Worker {
    id: u32,
    config: Arc<Config>,
    driver: Arc<AgentDriver>,
}

impl Worker {
    #[must_use]
    pub fn new(id: u32, config: Arc<Config>) -> Self {
        let driver = Arc::new(AgentDriver::new(
            Arc::clone(&config),
            config.work_directory.clone(),
        ));
        Self { id, config, driver }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn process(&self, task: Task, cancel: CancellationToken) -> TaskResult {
        let started = Instant::now();
        info!(worker_id = self.id, task_id = %task.id, title = %task.title, "processing task");

        let prompt = self.build_prompt(&task);
        let mut sink = match self.open_task_log(&task.id).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "failed to open task log");
                None
            }
        };

        // The driver's child dies with this token: on root shutdown it is
        // cancelled transitively, on deadline expiry we cancel it here.
        let task_cancel = cancel.child_token();
        let limit = self.config.max_task_duration_seconds;
        let exec = tokio::select! {
            res = self.driver.execute(&prompt, &task_cancel, sink.as_mut()) => res,
            () = tokio::time::sleep(Duration::from_secs(limit)) => {
                task_cancel.cancel();
                Err(HiveError::Timeout(limit))
            }
        };

        let duration = started.elapsed();
        match exec {
            Ok((output, success)) => {
                let new_tasks = parse_plan_tasks(&output);
                if success {
                    info!(worker_id = self.id, task_id = %task.id, "agent signaled completion");
                    TaskResult {
                        task,
                        status: TaskStatus::Completed,
                        worker_id: self.id,
                        duration,
                        fail_reason: String::new(),
                        output,
                        new_tasks,
                    }
                } else {
                    let mut reason = tail_chars(&output, 200);
                    if reason.is_empty() {
                        reason = "agent exited without completion marker".to_owned();
                    }
                    TaskResult {
                        task,
                        status: TaskStatus::Failed,
                        worker_id: self.id,
                        duration,
                        fail_reason: reason,
                        output,
                        new_tasks,
                    }
                }
            }
            Err(e) => {
                warn!(worker_id = self.id, task_id = %task.id, error = %e, "task execution failed");
                TaskResult {
                    task,
                    status: TaskStatus::Failed,
                    worker_id: self.id,
                    duration,
                    fail_reason: e.to_string(),
                    output: String::new(),
                    new_tasks: Vec::new(),
                }
            }
        }
    }

    /// Prompt = global rules + role persona + context files + description.
    /// Unreadable context files are noted in place rather than failing the
    /// task.
    fn build_prompt(&self, task: &Task) -> String {
        let mut parts: Vec<String> = Vec::new();

        let rules = self.config.instructions.global_rules.join("\n");
        if !rules.is_empty() {
            parts.push(rules);
        }

        if !task.role.is_empty() {
            if let Some(persona) = self.config.instructions.role_instructions.get(&task.role) {
                parts.push(persona.clone());
            } else {
                warn!(task_id = %task.id, role = %task.role, "no instructions for role");
            }
        }

        for path in &task.context_files {
            match std::fs::read_to_string(path) {
                Ok(content) => parts.push(format!("### Context: {path}\n{content}")),
                Err(e) => {
                    warn!(task_id = %task.id, path = %path, error = %e, "context file unavailable");
                    parts.push(format!("### Context: {path}\n(file unavailable: {e})"));
                }
            }
        }

        parts.push(task.description.clone());
        parts.join("\n\n")
    }

    async fn open_task_log(&self, task_id: &str) -> Result<tokio::fs::File, HiveError> {
        let dir = PathBuf::from(&self.config.log_directory);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| HiveError::IoPath {
                path: dir.clone(),
                source,
            })?;
        let path = task_log_path(&dir, task_id);
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| HiveError::IoPath { path, source })
    }
}

#[must_use]
pub fn task_log_path(log_dir: &Path, task_id: &str) -> PathBuf {
    log_dir.join(format!("{task_id}.log"))
}

/// Parses the plan block, if any, into fresh pending tasks. The canonical
/// grammar is a JSON array of `{title, description, role}` objects between
/// the start and end markers; anything malformed is logged and skipped.
#[must_use]
pub fn parse_plan_tasks(output: &str) -> Vec<Task> {
    let Some(block) = plan_block(output) else {
        return Vec::new();
    };

    #[derive(Debug, Deserialize)]
    struct PlanEntry {
        title: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        role: String,
    }

    let entries: Vec<PlanEntry> = match serde_json::from_str(block) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "ignoring malformed plan block");
            return Vec::new();
        }
    };

    entries
        .into_iter()
        .map(|entry| {
            let mut t = Task::new(next_plan_id(), entry.title, entry.description);
            t.role = entry.role;
            t
        })
        .collect()
}

fn plan_block(output: &str) -> Option<&str> {
    let start = output.find(PLAN_START)? + PLAN_START.len();
    let rest = &output[start..];
    let end = rest.find(PLAN_END)?;
    Some(rest[..end].trim())
}

fn next_plan_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    format!("plan-{nanos}-{seq}")
}

fn tail_chars(s: &str, n: usize) -> String {
    let trimmed = s.trim();
    let count = trimmed.chars().count();
    trimmed
        .chars()
        .skip(count.saturating_sub(n))
        .collect()
}
