#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

use crate::registry::model::TaskStatus;

#[derive(Debug, Error)]
pub enum HiveError {
    #[error("config error: {0}")]
    Config(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task with id {0} already exists")]
    DuplicateTask(String),

    #[error("task {id} is no longer pending (status: {status})")]
    ClaimConflict { id: String, status: TaskStatus },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("task timed out after {0}s")]
    Timeout(u64),

    #[error("git is required but was not found in PATH")]
    GitNotFound,

    #[error("gh is required for pull requests but was not found in PATH")]
    GhNotFound,

    #[error("git {op}: {stderr}")]
    Git { op: String, stderr: String },

    #[error("agent is already running")]
    AgentAlreadyRunning,

    #[error("max restart attempts exceeded ({0})")]
    RestartLimit(u32),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl HiveError {
    /// Expected control-flow errors on registry operations. Handled by
    /// skipping or retrying, never escalated.
    #[must_use]
    pub fn is_registry_conflict(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound(_) | Self::DuplicateTask(_) | Self::ClaimConflict { .. }
        )
    }
}
