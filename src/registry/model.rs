#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Reviewing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// A terminal status is never transitioned out of except via an
    /// explicit reset-for-retry.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::InProgress | Self::Reviewing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Reviewing => "reviewing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One unit of work in the registry. The registry file is a shared
/// blackboard: external producers append records, the orchestrator is the
/// sole authoritative writer while it runs, so every field tolerates being
/// absent on read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<TaskLogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fail_reason: String,
    #[serde(default)]
    pub worker_id: u32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub priority: i64,
}

/// A single structured entry in a task's execution trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskLogEntry {
    pub time: String,
    pub level: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Task {
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = now_rfc3339();
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            role: String::new(),
            status: TaskStatus::Pending,
            context_files: Vec::new(),
            logs: Vec::new(),
            created_at: Some(now.clone()),
            updated_at: Some(now),
            started_at: None,
            completed_at: None,
            fail_reason: String::new(),
            worker_id: 0,
            retry_count: 0,
            priority: 0,
        }
    }

    #[must_use]
    pub fn new_id() -> String {
        let id = Uuid::new_v4().simple().to_string();
        id.chars().take(8).collect()
    }

    pub fn mark_in_progress(&mut self, worker_id: u32) {
        self.status = TaskStatus::InProgress;
        self.worker_id = worker_id;
        self.started_at = Some(now_rfc3339());
        self.updated_at = Some(now_rfc3339());
    }

    pub fn mark_reviewing(&mut self) {
        self.status = TaskStatus::Reviewing;
        self.updated_at = Some(now_rfc3339());
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(now_rfc3339());
        self.updated_at = Some(now_rfc3339());
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.fail_reason = reason.into();
        self.completed_at = Some(now_rfc3339());
        self.updated_at = Some(now_rfc3339());
    }

    pub fn increment_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.updated_at = Some(now_rfc3339());
        self.retry_count
    }

    /// Clears all execution markers so the task can be dispatched again.
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.worker_id = 0;
        self.retry_count = 0;
        self.fail_reason = String::new();
        self.started_at = None;
        self.completed_at = None;
        self.updated_at = Some(now_rfc3339());
    }

    pub fn add_log(
        &mut self,
        level: impl Into<String>,
        phase: impl Into<String>,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        self.logs.push(TaskLogEntry {
            time: now_rfc3339(),
            level: level.into(),
            phase: phase.into(),
            message: message.into(),
            data,
        });
        self.updated_at = Some(now_rfc3339());
    }

    /// How long the task has been (or was) running.
    #[must_use]
    pub fn duration(&self) -> Option<time::Duration> {
        let started = parse_rfc3339(self.started_at.as_deref()?)?;
        let end = self
            .completed_at
            .as_deref()
            .and_then(parse_rfc3339)
            .unwrap_or_else(OffsetDateTime::now_utc);
        Some(end - started)
    }
}

#[must_use]
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_owned())
}

fn parse_rfc3339(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).ok()
}
