#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::git::{GitClient, ShellGit};
use crate::logging;
use crate::orchestrator::Orchestrator;
use crate::output::table::Table;
use crate::registry::model::{Task, TaskStatus};
use crate::registry::store::Registry;

#[derive(Debug, Parser)]
#[command(
    name = "hive",
    version,
    about = "Dispatches registry tasks to a pool of AI-agent workers"
)]
pub struct Cli {
    /// Path to the JSON config file
    #[arg(long, global = true, default_value = "config.json")]
    pub config: PathBuf,

    /// Override num_workers from the config
    #[arg(long)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub cmd: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the orchestrator until interrupted (the default)
    Run,
    /// Write a default config file
    Init,
    /// Inspect and edit the task registry
    Task(TaskArgs),
}

#[derive(Debug, Parser)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub cmd: TaskCmd,
}

#[derive(Debug, Subcommand)]
pub enum TaskCmd {
    Add(TaskAddArgs),
    List(TaskListArgs),
    Show(TaskShowArgs),
    #[command(alias = "rm")]
    Delete(TaskIdArg),
    /// Reset a finished task so it dispatches again
    Retry(TaskIdArg),
}

#[derive(Debug, Parser)]
pub struct TaskAddArgs {
    /// Task title
    pub title: String,
    /// Detailed instructions passed to the agent
    #[arg(short = 'd', long = "description", default_value = "")]
    pub description: String,
    /// Agent persona (ba, architect, backend, frontend, qa)
    #[arg(short = 'r', long = "role")]
    pub role: Option<String>,
    /// Higher values dispatch first
    #[arg(short = 'p', long = "priority", default_value_t = 0)]
    pub priority: i64,
    /// Files whose contents are prepended to the prompt
    #[arg(long = "context-file")]
    pub context_files: Vec<String>,
    /// Explicit task id (defaults to a random one)
    #[arg(long = "id")]
    pub id: Option<String>,
}

#[derive(Debug, Parser)]
pub struct TaskListArgs {
    /// Only show tasks with this status
    #[arg(short = 's', long = "status")]
    pub status: Option<String>,
    /// Output in JSON format
    #[arg(long = "json")]
    pub json: bool,
    /// Output in CSV format
    #[arg(long = "csv")]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct TaskShowArgs {
    /// Task id
    pub id: String,
    /// Include the structured log trail
    #[arg(long = "logs")]
    pub logs: bool,
}

#[derive(Debug, Parser)]
pub struct TaskIdArg {
    /// Task id
    pub id: String,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.cmd {
        None | Some(Commands::Run) => cmd_run(&cli.config, cli.workers).await,
        Some(Commands::Init) => cmd_init(&cli.config),
        Some(Commands::Task(args)) => cmd_task(&cli.config, args),
    }
}

async fn cmd_run(config_path: &std::path::Path, workers: Option<usize>) -> anyhow::Result<ExitCode> {
    let mut cfg = Config::load(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    if let Some(workers) = workers {
        cfg.num_workers = workers;
        cfg.validate()?;
    }

    logging::init(&cfg)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        workers = cfg.num_workers,
        "starting hive"
    );

    let cfg = Arc::new(cfg);
    let git: Arc<dyn GitClient> = Arc::new(ShellGit::new(&cfg.work_directory));
    if cfg.git_integration.enabled && !git.is_installed() {
        anyhow::bail!("git_integration is enabled but git was not found in PATH");
    }
    let orchestrator = Orchestrator::new(Arc::clone(&cfg), git)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            cancel.cancel();
        }
    });

    orchestrator.run(cancel).await?;
    info!("hive exited");
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let Ok(mut term) = signal(SignalKind::terminate()) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn cmd_init(config_path: &std::path::Path) -> anyhow::Result<ExitCode> {
    if config_path.exists() {
        anyhow::bail!("{} already exists", config_path.display());
    }
    Config::default().save(config_path)?;
    println!("Wrote default config to {}", config_path.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_task(config_path: &std::path::Path, args: TaskArgs) -> anyhow::Result<ExitCode> {
    let cfg = Config::load(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let registry = Registry::new(&cfg.tasks_file);
    registry.ensure_exists()?;

    match args.cmd {
        TaskCmd::Add(add) => {
            if add.title.trim().is_empty() {
                anyhow::bail!("task title must not be empty");
            }
            let mut task = Task::new(
                add.id.unwrap_or_else(Task::new_id),
                add.title,
                add.description,
            );
            task.role = add.role.unwrap_or_default();
            task.priority = add.priority;
            task.context_files = add.context_files;
            registry.add(&task)?;
            println!("Task '{}' added (ID: {})", task.title, task.id);
        }
        TaskCmd::List(list) => {
            let status = list
                .status
                .as_deref()
                .map(parse_status)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let mut tasks = registry.load_all()?;
            if let Some(status) = status {
                tasks.retain(|t| t.status == status);
            }
            if list.json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
                return Ok(ExitCode::SUCCESS);
            }
            let mut table = Table::new(["ID", "STATUS", "ROLE", "PRI", "TITLE"]);
            for t in &tasks {
                table.row([
                    t.id.clone(),
                    t.status.to_string(),
                    t.role.clone(),
                    t.priority.to_string(),
                    t.title.clone(),
                ]);
            }
            if list.csv {
                table.write_csv()?;
            } else {
                table.print()?;
            }
        }
        TaskCmd::Show(show) => {
            let mut task = registry.get(&show.id)?;
            if !show.logs {
                task.logs.clear();
            }
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCmd::Delete(del) => {
            registry.delete(&del.id)?;
            println!("Task {} deleted", del.id);
        }
        TaskCmd::Retry(retry) => {
            registry.reset_for_retry(&retry.id)?;
            println!("Task {} reset to pending", retry.id);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn parse_status(s: &str) -> Result<TaskStatus, String> {
    match s {
        "pending" => Ok(TaskStatus::Pending),
        "in_progress" => Ok(TaskStatus::InProgress),
        "reviewing" => Ok(TaskStatus::Reviewing),
        "completed" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        other => Err(format!(
            "unknown status '{other}' (expected pending, in_progress, reviewing, completed, or failed)"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_parse() {
        assert_eq!(parse_status("pending").unwrap(), TaskStatus::Pending);
        assert_eq!(parse_status("in_progress").unwrap(), TaskStatus::InProgress);
        assert!(parse_status("done").is_err());
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::parse_from(["hive", "--config", "/tmp/c.json", "--workers", "3"]);
        assert_eq!(cli.config, PathBuf::from("/tmp/c.json"));
        assert_eq!(cli.workers, Some(3));
        assert!(cli.cmd.is_none());
    }

    #[test]
    fn cli_parses_task_add() {
        let cli = Cli::parse_from([
            "hive", "task", "add", "Fix login", "-d", "details", "-r", "backend", "-p", "5",
        ]);
        let Some(Commands::Task(TaskArgs {
            cmd: TaskCmd::Add(add),
        })) = cli.cmd
        else {
            panic!("expected task add");
        };
        assert_eq!(add.title, "Fix login");
        assert_eq!(add.role.as_deref(), Some("backend"));
        assert_eq!(add.priority, 5);
    }
}
