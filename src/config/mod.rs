#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::HiveError;

/// Orchestrator configuration, loaded from a JSON file.
///
/// Missing fields and zero values fall back to [`Config::default`], so a
/// partial config file only needs to name the options it overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// arg[0] is the agent binary, the rest are prefix arguments.
    pub agent_command: Vec<String>,
    pub num_workers: usize,
    /// Silence budget for completion detection. Only meaningful for
    /// persistent drivers; episodic execution never consults it.
    pub response_timeout_seconds: u64,
    pub max_task_duration_seconds: u64,
    pub max_review_cycles: u32,
    pub max_restart_attempts: u32,
    /// Per-attempt restart cooldowns; the last entry repeats.
    pub restart_cooldown_seconds: Vec<u64>,
    pub completion_marker: String,
    pub stop_tokens: Vec<String>,
    pub log_directory: String,
    pub log_level: String,
    pub recover_in_progress_on_startup: bool,
    pub tasks_file: String,
    pub work_directory: String,
    pub git_integration: GitConfig,
    pub instructions: InstructionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GitConfig {
    pub enabled: bool,
    pub base_branch: String,
    pub remote: String,
    pub branch_prefix: String,
    /// `{title}` and `{id}` are substituted.
    pub commit_message_format: String,
    pub create_pr: bool,
    /// `{title}` is substituted.
    pub pr_title_format: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_branch: "main".to_owned(),
            remote: "origin".to_owned(),
            branch_prefix: "agent/task-".to_owned(),
            commit_message_format: "feat: {title} (task {id})".to_owned(),
            create_pr: false,
            pr_title_format: "feat: {title}".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstructionConfig {
    /// Prepended to every prompt, joined with newlines.
    pub global_rules: Vec<String>,
    /// Role tag -> persona block prepended after the global rules.
    pub role_instructions: BTreeMap<String, String>,
}

impl Default for InstructionConfig {
    fn default() -> Self {
        let mut roles = BTreeMap::new();
        roles.insert(
            "ba".to_owned(),
            "You are a Business Analyst. Focus on detailed requirements, user stories, and \
             acceptance criteria (Gherkin). If asked to plan or break down a feature, output \
             the tasks in this JSON format between '### PLAN_START ###' and '### PLAN_END ###': \
             `[{\"title\": \"...\", \"description\": \"...\", \"role\": \"...\"}]`."
                .to_owned(),
        );
        roles.insert(
            "architect".to_owned(),
            "You are a Solutions Architect. Focus on high-level system design, patterns, \
             scalability, and trade-offs."
                .to_owned(),
        );
        roles.insert(
            "backend".to_owned(),
            "You are a Senior Backend Engineer. Focus on robust server-side logic, APIs, \
             database interactions, and performance."
                .to_owned(),
        );
        roles.insert(
            "frontend".to_owned(),
            "You are a Senior Frontend Engineer. Focus on responsive UI/UX, state management, \
             and modern web frameworks."
                .to_owned(),
        );
        roles.insert(
            "qa".to_owned(),
            "You are a QA Engineer. Focus on comprehensive testing strategies, edge cases, \
             and security vulnerabilities."
                .to_owned(),
        );
        Self {
            global_rules: vec![
                "You are part of an autonomous agent swarm.".to_owned(),
                "Do not use markdown formatting for file content unless strictly necessary."
                    .to_owned(),
                "Be concise and technical.".to_owned(),
            ],
            role_instructions: roles,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_command: vec!["opencode".to_owned(), "run".to_owned()],
            num_workers: 1,
            response_timeout_seconds: 60,
            max_task_duration_seconds: 1800,
            max_review_cycles: 3,
            max_restart_attempts: 3,
            restart_cooldown_seconds: vec![5, 15, 60],
            completion_marker: "### TASK_DONE ###".to_owned(),
            stop_tokens: vec!["TASK_COMPLETED".to_owned(), "### TASK_DONE ###".to_owned()],
            log_directory: "./logs".to_owned(),
            log_level: "info".to_owned(),
            recover_in_progress_on_startup: true,
            tasks_file: "tasks.json".to_owned(),
            work_directory: ".".to_owned(),
            git_integration: GitConfig::default(),
            instructions: InstructionConfig::default(),
        }
    }
}

impl Config {
    /// Reads configuration from a JSON file. A missing file yields the
    /// defaults; a present file is overlaid on them.
    pub fn load(path: &Path) -> Result<Self, HiveError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(HiveError::Config(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        let mut cfg: Self = serde_json::from_slice(&data).map_err(|e| {
            HiveError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        cfg.apply_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<(), HiveError> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| HiveError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, data).map_err(|e| {
            HiveError::Config(format!("failed to write {}: {e}", path.display()))
        })
    }

    /// Fills defaults into fields left zero or empty by the file, matching
    /// the behavior for fields that were absent entirely.
    pub fn apply_defaults(&mut self) {
        let defaults = Self::default();
        if self.agent_command.is_empty() {
            self.agent_command = defaults.agent_command;
        }
        if self.num_workers == 0 {
            self.num_workers = defaults.num_workers;
        }
        if self.response_timeout_seconds == 0 {
            self.response_timeout_seconds = defaults.response_timeout_seconds;
        }
        if self.max_task_duration_seconds == 0 {
            self.max_task_duration_seconds = defaults.max_task_duration_seconds;
        }
        if self.max_review_cycles == 0 {
            self.max_review_cycles = defaults.max_review_cycles;
        }
        if self.max_restart_attempts == 0 {
            self.max_restart_attempts = defaults.max_restart_attempts;
        }
        if self.restart_cooldown_seconds.is_empty() {
            self.restart_cooldown_seconds = defaults.restart_cooldown_seconds;
        }
        if self.completion_marker.is_empty() {
            self.completion_marker = defaults.completion_marker;
        }
        if self.stop_tokens.is_empty() {
            self.stop_tokens = defaults.stop_tokens;
        }
        if self.log_directory.is_empty() {
            self.log_directory = defaults.log_directory;
        }
        if self.log_level.is_empty() {
            self.log_level = defaults.log_level;
        }
        if self.tasks_file.is_empty() {
            self.tasks_file = defaults.tasks_file;
        }
        if self.work_directory.is_empty() {
            self.work_directory = defaults.work_directory;
        }
    }

    pub fn validate(&self) -> Result<(), HiveError> {
        if self.agent_command.is_empty() {
            return Err(HiveError::Config("agent_command cannot be empty".to_owned()));
        }
        if self.num_workers < 1 || self.num_workers > 10 {
            return Err(HiveError::Config(format!(
                "num_workers must be in [1, 10], got {}",
                self.num_workers
            )));
        }
        if self.response_timeout_seconds < 1 {
            return Err(HiveError::Config(format!(
                "response_timeout_seconds must be at least 1, got {}",
                self.response_timeout_seconds
            )));
        }
        if self.max_task_duration_seconds < 60 {
            return Err(HiveError::Config(format!(
                "max_task_duration_seconds must be at least 60, got {}",
                self.max_task_duration_seconds
            )));
        }
        if self.max_review_cycles < 1 {
            return Err(HiveError::Config(format!(
                "max_review_cycles must be at least 1, got {}",
                self.max_review_cycles
            )));
        }
        if self.max_restart_attempts < 1 {
            return Err(HiveError::Config(format!(
                "max_restart_attempts must be at least 1, got {}",
                self.max_restart_attempts
            )));
        }
        match self.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(HiveError::Config(format!(
                    "invalid log_level: {other} (must be debug, info, warn, or error)"
                )));
            }
        }
        Ok(())
    }
}
