use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use hive::config::Config;
use hive::git::{GitClient, ShellGit};
use hive::orchestrator::Orchestrator;
use hive::registry::model::{Task, TaskStatus};
use hive::registry::store::Registry;
use hive::worker::runner::task_log_path;

fn test_config(dir: &Path, agent_command: &[&str]) -> Config {
    let mut cfg = Config::default();
    cfg.agent_command = agent_command.iter().map(ToString::to_string).collect();
    cfg.num_workers = 1;
    cfg.tasks_file = dir.join("tasks.json").to_string_lossy().into_owned();
    cfg.log_directory = dir.join("logs").to_string_lossy().into_owned();
    cfg.work_directory = dir.to_string_lossy().into_owned();
    cfg.max_task_duration_seconds = 60;
    cfg
}

struct Running {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// Spawns the orchestrator over the given config; git integration stays on
/// the real (but disabled) shell client.
fn start_orchestrator(cfg: Config) -> Running {
    let cfg = Arc::new(cfg);
    let git: Arc<dyn GitClient> = Arc::new(ShellGit::new(&cfg.work_directory));
    let orchestrator = Orchestrator::new(Arc::clone(&cfg), git).expect("orchestrator");
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        orchestrator.run(run_cancel).await.expect("run");
    });
    Running { cancel, handle }
}

async fn stop_orchestrator(running: Running) {
    running.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(35), running.handle)
        .await
        .expect("orchestrator joined in time")
        .expect("orchestrator task");
}

/// Polls the registry until `check` passes or the deadline elapses.
async fn wait_for(registry: &Registry, deadline: Duration, check: impl Fn(&[Task]) -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if let Ok(tasks) = registry.load_all()
            && check(&tasks)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn happy_path_single_task_completes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = test_config(
        dir.path(),
        &["sh", "-c", "echo done; echo '### TASK_DONE ###'"],
    );
    let registry = Registry::new(&cfg.tasks_file);
    registry.ensure_exists().unwrap();
    registry.add(&Task::new("t1", "x", "y")).unwrap();

    let running = start_orchestrator(cfg.clone());
    let done = wait_for(&registry, Duration::from_secs(10), |tasks| {
        tasks.len() == 1 && tasks[0].status == TaskStatus::Completed
    })
    .await;
    stop_orchestrator(running).await;
    assert!(done, "task did not complete in time");

    let log = std::fs::read_to_string(task_log_path(Path::new(&cfg.log_directory), "t1"))
        .expect("task log exists");
    assert!(log.contains("### TASK_DONE ###"));

    let t1 = registry.get("t1").unwrap();
    assert!(t1.completed_at >= t1.started_at);
}

#[tokio::test]
async fn startup_recovery_redispatches_interrupted_task() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = test_config(dir.path(), &["echo", "### TASK_DONE ###"]);
    let registry = Registry::new(&cfg.tasks_file);
    registry.ensure_exists().unwrap();

    // A task left in_progress by a crashed run would never dispatch again
    // on its own; completing is proof it was reset to pending first.
    let mut stuck = Task::new("s1", "Stuck", "resume me");
    stuck.mark_in_progress(7);
    registry.add(&stuck).unwrap();

    let running = start_orchestrator(cfg);
    let recovered = wait_for(&registry, Duration::from_secs(10), |tasks| {
        tasks[0].status == TaskStatus::Completed
    })
    .await;
    stop_orchestrator(running).await;
    assert!(recovered, "interrupted task was not recovered and re-run");
}

#[tokio::test]
async fn recovery_disabled_leaves_active_task_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = test_config(dir.path(), &["echo", "### TASK_DONE ###"]);
    cfg.recover_in_progress_on_startup = false;
    let registry = Registry::new(&cfg.tasks_file);
    registry.ensure_exists().unwrap();

    let mut stuck = Task::new("s1", "Stuck", "");
    stuck.mark_in_progress(7);
    registry.add(&stuck).unwrap();

    let running = start_orchestrator(cfg);
    tokio::time::sleep(Duration::from_secs(3)).await;
    stop_orchestrator(running).await;

    let s1 = registry.get("s1").unwrap();
    assert_eq!(s1.status, TaskStatus::InProgress);
    assert_eq!(s1.worker_id, 7);
}

#[tokio::test]
async fn tasks_complete_in_priority_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = test_config(
        dir.path(),
        &["sh", "-c", "sleep 0.2; echo '### TASK_DONE ###'"],
    );
    let registry = Registry::new(&cfg.tasks_file);
    registry.ensure_exists().unwrap();

    for (id, priority) in [("low", 0), ("high", 5), ("mid", 3)] {
        let mut t = Task::new(id, id, "");
        t.priority = priority;
        registry.add(&t).unwrap();
    }

    let running = start_orchestrator(cfg);

    // Record ids in the order they turn completed.
    let mut order: Vec<String> = Vec::new();
    let start = Instant::now();
    while order.len() < 3 && start.elapsed() < Duration::from_secs(30) {
        if let Ok(tasks) = registry.load_all() {
            for t in &tasks {
                if t.status == TaskStatus::Completed && !order.contains(&t.id) {
                    order.push(t.id.clone());
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    stop_orchestrator(running).await;

    assert_eq!(order, ["high", "mid", "low"]);
}

#[tokio::test]
async fn task_deadline_kills_the_agent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = test_config(dir.path(), &["sleep", "30"]);
    cfg.max_task_duration_seconds = 1;
    let registry = Registry::new(&cfg.tasks_file);
    registry.ensure_exists().unwrap();
    registry.add(&Task::new("t1", "hang", "")).unwrap();

    let running = start_orchestrator(cfg);
    let failed = wait_for(&registry, Duration::from_secs(5), |tasks| {
        tasks[0].status == TaskStatus::Failed
    })
    .await;
    stop_orchestrator(running).await;

    assert!(failed, "task did not fail in time");
    let t1 = registry.get("t1").unwrap();
    assert!(t1.fail_reason.contains("timed out"), "reason: {}", t1.fail_reason);
}

#[tokio::test]
async fn plan_block_fans_out_into_new_tasks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plan = r#"printf 'planning\n### PLAN_START ###\n[{"title":"A","description":"a","role":"backend"},{"title":"B","description":"b","role":"qa"}]\n### PLAN_END ###\n### TASK_DONE ###\n'"#;
    let cfg = test_config(dir.path(), &["sh", "-c", plan]);
    let registry = Registry::new(&cfg.tasks_file);
    registry.ensure_exists().unwrap();

    let mut planner = Task::new("planning-task", "Create Plan", "Break down the work");
    planner.role = "ba".to_owned();
    registry.add(&planner).unwrap();

    let running = start_orchestrator(cfg);
    let planned = wait_for(&registry, Duration::from_secs(15), |tasks| {
        let original_done = tasks
            .iter()
            .any(|t| t.id == "planning-task" && t.status == TaskStatus::Completed);
        let a = tasks.iter().find(|t| t.title == "A");
        let b = tasks.iter().find(|t| t.title == "B");
        original_done
            && a.is_some_and(|t| t.role == "backend")
            && b.is_some_and(|t| t.role == "qa")
    })
    .await;
    stop_orchestrator(running).await;
    assert!(planned, "plan sub-tasks did not appear in the registry");
}

#[tokio::test]
async fn all_pending_tasks_complete_with_multiple_workers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = test_config(dir.path(), &["echo", "### TASK_DONE ###"]);
    cfg.num_workers = 3;
    let registry = Registry::new(&cfg.tasks_file);
    registry.ensure_exists().unwrap();
    for id in ["a", "b", "c"] {
        registry.add(&Task::new(id, id, "")).unwrap();
    }

    let running = start_orchestrator(cfg);
    let done = wait_for(&registry, Duration::from_secs(20), |tasks| {
        tasks.iter().all(|t| t.status == TaskStatus::Completed)
    })
    .await;
    stop_orchestrator(running).await;
    assert!(done, "not all tasks completed");
}
