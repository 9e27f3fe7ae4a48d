#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::HiveError;
use crate::git::GitClient;
use crate::registry::model::{Task, TaskStatus};
use crate::registry::store::Registry;
use crate::worker::pool::WorkerPool;
use crate::worker::runner::TaskResult;

const DISPATCH_INTERVAL: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Wires registry, worker pool, and git side-effects together, and owns
/// the dispatcher and result-handler loops.
pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
    git: Arc<dyn GitClient>,
}

impl Orchestrator {
    /// Builds the orchestrator and makes sure the registry file exists.
    pub fn new(config: Arc<Config>, git: Arc<dyn GitClient>) -> Result<Self, HiveError> {
        let registry = Arc::new(Registry::new(&config.tasks_file));
        registry.ensure_exists()?;
        let pool = Arc::new(WorkerPool::new(Arc::clone(&config)));
        Ok(Self {
            config,
            registry,
            pool,
            git,
        })
    }

    /// Runs until `cancel` fires, then shuts down gracefully.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), HiveError> {
        info!(
            num_workers = self.config.num_workers,
            tasks_file = %self.config.tasks_file,
            "orchestrator starting"
        );

        if self.config.recover_in_progress_on_startup {
            match self.registry.recover_active() {
                Ok(0) => {}
                Ok(count) => info!(count, "recovered stuck tasks"),
                Err(e) => error!(error = %e, "failed to recover in-progress tasks"),
            }
        }

        self.log_status_summary("task status summary");

        self.pool.start(&cancel);
        let results = self
            .pool
            .take_results()
            .ok_or_else(|| HiveError::Other("result channel already taken".to_owned()))?;

        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&self.pool),
            Arc::clone(&self.git),
            cancel.clone(),
        ));
        let handler = tokio::spawn(result_loop(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&self.git),
            results,
        ));

        cancel.cancelled().await;
        info!("shutdown signal received");

        self.shutdown(dispatcher, handler).await;
        Ok(())
    }

    async fn shutdown(&self, dispatcher: JoinHandle<()>, handler: JoinHandle<()>) {
        info!("shutting down orchestrator");

        // Waits for in-flight tasks; their drivers were already cancelled
        // through the token, so this is quick.
        self.pool.stop().await;

        let join = async {
            let _ = dispatcher.await;
            let _ = handler.await;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, join).await.is_err() {
            warn!("shutdown timeout, forcing exit");
        }

        self.log_status_summary("final task status");
        info!("orchestrator shutdown complete");
    }

    fn log_status_summary(&self, message: &str) {
        match self.registry.count_by_status() {
            Ok(counts) => {
                let count = |s: TaskStatus| counts.get(&s).copied().unwrap_or(0);
                info!(
                    pending = count(TaskStatus::Pending),
                    in_progress = count(TaskStatus::InProgress),
                    reviewing = count(TaskStatus::Reviewing),
                    completed = count(TaskStatus::Completed),
                    failed = count(TaskStatus::Failed),
                    "{message}"
                );
            }
            Err(e) => error!(error = %e, "failed to count tasks by status"),
        }
    }
}

/// Polls the registry for the best pending task and pushes it into the
/// pool, claiming it first so no other dispatcher can double-submit.
async fn dispatch_loop(
    config: Arc<Config>,
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
    git: Arc<dyn GitClient>,
    cancel: CancellationToken,
) {
    info!("task dispatcher started");
    let mut ticker = tokio::time::interval(DISPATCH_INTERVAL);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        dispatch_once(&config, &registry, &pool, git.as_ref());
    }
    info!("task dispatcher stopped");
}

fn dispatch_once(config: &Config, registry: &Registry, pool: &WorkerPool, git: &dyn GitClient) {
    if pool.is_full() {
        return;
    }

    let next = match registry.next_pending() {
        Ok(Some(task)) => task,
        Ok(None) => return,
        Err(e) => {
            error!(error = %e, "failed to query next pending task");
            return;
        }
    };

    // Worker id 0: the actual worker is recorded by the result handler.
    if let Err(e) = registry.claim(&next.id, 0) {
        // A conflict means another writer got there first; anything else
        // is a real registry problem.
        if e.is_registry_conflict() {
            warn!(task_id = %next.id, error = %e, "failed to claim task");
        } else {
            error!(task_id = %next.id, error = %e, "registry error while claiming task");
        }
        return;
    }

    if config.git_integration.enabled && !prepare_branch(config, registry, git, &next) {
        return;
    }

    if pool.submit(next.clone()) {
        info!(task_id = %next.id, title = %next.title, "task dispatched");
    } else {
        warn!(task_id = %next.id, "pool refused task, reverting to pending");
        if let Err(e) = registry.update_status(&next.id, TaskStatus::Pending, "") {
            error!(task_id = %next.id, error = %e, "failed to revert task status");
        }
    }
}

/// Pre-execution git stage: requires a clean tree, then cuts the feature
/// branch. A dirty tree defers the task (back to pending); a branch
/// failure fails it.
fn prepare_branch(config: &Config, registry: &Registry, git: &dyn GitClient, task: &Task) -> bool {
    let gi = &config.git_integration;

    let clean = match git.is_clean() {
        Ok(clean) => clean,
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "failed to check working tree");
            false
        }
    };
    if !clean {
        warn!(task_id = %task.id, "working tree not clean, deferring task");
        if let Err(e) = registry.update_status(&task.id, TaskStatus::Pending, "") {
            error!(task_id = %task.id, error = %e, "failed to revert task status");
        }
        return false;
    }

    let branch = format!("{}{}", gi.branch_prefix, task.id);
    if let Err(e) = git.checkout_new_branch(&branch, &gi.base_branch) {
        error!(task_id = %task.id, error = %e, "failed to create git branch");
        let reason = format!("git branch failed: {e}");
        if let Err(e) = registry.update_status(&task.id, TaskStatus::Failed, &reason) {
            error!(task_id = %task.id, error = %e, "failed to mark task failed");
        }
        return false;
    }

    info!(task_id = %task.id, branch = %branch, "created git branch");
    true
}

/// Consumes the pool's results until the channel closes.
async fn result_loop(
    config: Arc<Config>,
    registry: Arc<Registry>,
    git: Arc<dyn GitClient>,
    mut results: mpsc::Receiver<TaskResult>,
) {
    info!("result handler started");
    while let Some(result) = results.recv().await {
        process_result(&config, &registry, git.as_ref(), &result);
    }
    info!("result handler stopped");
}

fn process_result(config: &Config, registry: &Registry, git: &dyn GitClient, result: &TaskResult) {
    let task = &result.task;
    info!(
        task_id = %task.id,
        title = %task.title,
        status = %result.status,
        worker_id = result.worker_id,
        duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
        "task finished"
    );

    if !result.fail_reason.is_empty() {
        error!(task_id = %task.id, reason = %result.fail_reason, "task failed");
    }

    if let Err(e) = registry.update_status(&task.id, result.status, &result.fail_reason) {
        error!(task_id = %task.id, error = %e, "failed to update task status");
    }

    // Auto-planning: append sub-tasks emitted by the agent.
    if !result.new_tasks.is_empty() {
        info!(task_id = %task.id, count = result.new_tasks.len(), "adding tasks from agent plan");
        for new_task in &result.new_tasks {
            match registry.add(new_task) {
                Ok(()) => debug!(task_id = %new_task.id, title = %new_task.title, "sub-task queued"),
                Err(HiveError::DuplicateTask(id)) => {
                    warn!(task_id = %id, "skipping duplicate planned task");
                }
                Err(e) => error!(title = %new_task.title, error = %e, "failed to add planned task"),
            }
        }
    }

    if result.status == TaskStatus::Completed && config.git_integration.enabled {
        finish_branch(config, git, task);
    }

    if let Ok(counts) = registry.count_by_status() {
        debug!(?counts, "task status summary");
    }
}

/// Post-completion git stage: add, commit, push, optional PR. A failure
/// anywhere is logged and stops the chain, but never demotes a task that
/// already completed.
fn finish_branch(config: &Config, git: &dyn GitClient, task: &Task) {
    let gi = &config.git_integration;
    info!(task_id = %task.id, "committing changes to git");

    if let Err(e) = git.add_all() {
        error!(task_id = %task.id, error = %e, "git add failed");
        return;
    }

    let message = gi
        .commit_message_format
        .replace("{title}", &task.title)
        .replace("{id}", &task.id);
    if let Err(e) = git.commit(&message) {
        error!(task_id = %task.id, error = %e, "git commit failed");
        return;
    }

    let branch = format!("{}{}", gi.branch_prefix, task.id);
    if let Err(e) = git.push(&gi.remote, &branch) {
        error!(task_id = %task.id, error = %e, "git push failed");
        return;
    }

    if gi.create_pr {
        let title = gi.pr_title_format.replace("{title}", &task.title);
        match git.create_pr(&title, &task.description) {
            Ok(()) => info!(task_id = %task.id, "pull request created"),
            Err(e) => error!(task_id = %task.id, error = %e, "pull request creation failed"),
        }
    }
}
