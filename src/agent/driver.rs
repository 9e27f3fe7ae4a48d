#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::HiveError;

/// Drives one external agent process per task, episodically: every call to
/// [`AgentDriver::execute`] spawns a fresh child, feeds it the prompt, and
/// collects its combined output.
#[derive(Debug)]
pub struct AgentDriver {
    config: Arc<Config>,
    work_dir: PathBuf,
    is_running: AtomicBool,
    restart_count: Mutex<u32>,
}

impl AgentDriver {
    #[must_use]
    pub fn new(config: Arc<Config>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            work_dir: work_dir.into(),
            is_running: AtomicBool::new(false),
            restart_count: Mutex::new(0),
        }
    }

    /// Spawns the configured agent command with `prompt` as a trailing
    /// argument, mirrors the prompt to the child's stdin (then closes it),
    /// and waits for exit or cancellation.
    ///
    /// Success is signaled by the completion marker or any stop token in
    /// the combined stdout+stderr, or by a zero exit code. A non-zero exit
    /// without a marker is not an error: the output carries the diagnostic
    /// and the caller classifies the task as failed.
    pub async fn execute(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
        sink: Option<&mut tokio::fs::File>,
    ) -> Result<(String, bool), HiveError> {
        let Some((program, prefix_args)) = self.config.agent_command.split_first() else {
            return Err(HiveError::Config("agent_command cannot be empty".to_owned()));
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(prefix_args);
        if !prompt.is_empty() {
            cmd.arg(prompt);
        }
        cmd.current_dir(&self.work_dir);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        // The worker may drop this future on task-deadline expiry; the
        // child must not outlive it.
        cmd.kill_on_drop(true);

        info!(command = %program, "executing agent command");

        let mut child = cmd.spawn().map_err(|source| HiveError::Spawn {
            command: program.clone(),
            source,
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = prompt.as_bytes().to_vec();
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
                // Closing stdin signals end-of-input to well-behaved CLIs.
                let _ = stdin.shutdown().await;
            });
        }

        let stdout_task = drain(child.stdout.take());
        let stderr_task = drain(child.stderr.take());

        let status = tokio::select! {
            () = cancel.cancelled() => {
                let _ = child.kill().await;
                warn!(command = %program, "agent command cancelled");
                return Err(HiveError::Cancelled);
            }
            res = child.wait() => res.map_err(|e| {
                HiveError::Other(format!("failed to wait for agent process: {e}"))
            })?,
        };

        let mut output = stdout_task.await.unwrap_or_default();
        output.push_str(&stderr_task.await.unwrap_or_default());

        if let Some(sink) = sink {
            let _ = sink.write_all(output.as_bytes()).await;
            let _ = sink.write_all(b"\n").await;
            let _ = sink.flush().await;
        }

        let marker_found = output.contains(&self.config.completion_marker)
            || self
                .config
                .stop_tokens
                .iter()
                .any(|token| output.contains(token));
        let success = marker_found || status.success();

        debug!(
            command = %program,
            exit_code = status.code().unwrap_or(-1),
            marker_found,
            "agent command finished"
        );
        Ok((output, success))
    }

    /// Books the driver as running. No long-lived child exists in episodic
    /// mode; the flag tracks logical liveness for consumers.
    pub fn start(&self) -> Result<(), HiveError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(HiveError::AgentAlreadyRunning);
        }
        debug!("agent driver started");
        Ok(())
    }

    pub fn stop(&self) {
        if self.is_running.swap(false, Ordering::SeqCst) {
            debug!("agent driver stopped");
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Capped retry: sleeps the cooldown for the current attempt (the last
    /// cooldown entry repeats), then cycles stop/start. Fails once the
    /// attempt counter reaches `max_restart_attempts`.
    pub async fn restart(&self) -> Result<(), HiveError> {
        let attempt = {
            let mut count = self
                .restart_count
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *count >= self.config.max_restart_attempts {
                return Err(HiveError::RestartLimit(self.config.max_restart_attempts));
            }
            *count += 1;
            *count
        };

        let cooldowns = &self.config.restart_cooldown_seconds;
        let cooldown = cooldowns
            .get((attempt as usize).saturating_sub(1))
            .or_else(|| cooldowns.last())
            .copied()
            .unwrap_or(0);

        warn!(attempt, cooldown_seconds = cooldown, "restarting agent");
        tokio::time::sleep(Duration::from_secs(cooldown)).await;

        self.stop();
        self.start()
    }

    pub async fn ensure_alive(&self) -> Result<(), HiveError> {
        if self.is_alive() {
            return Ok(());
        }
        self.restart().await
    }

    pub fn reset_restart_count(&self) {
        let mut count = self
            .restart_count
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *count = 0;
    }
}

fn drain(
    pipe: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
) -> tokio::task::JoinHandle<String> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(agent_command: &[&str]) -> Arc<Config> {
        let mut cfg = Config::default();
        cfg.agent_command = agent_command.iter().map(ToString::to_string).collect();
        cfg.completion_marker = "### TASK_DONE ###".to_owned();
        cfg.stop_tokens = vec!["COMPLETED".to_owned()];
        cfg.max_restart_attempts = 2;
        cfg.restart_cooldown_seconds = vec![0];
        Arc::new(cfg)
    }

    #[tokio::test]
    async fn completion_marker_signals_success() {
        let d = AgentDriver::new(test_config(&["echo", "working\n### TASK_DONE ###"]), ".");
        let (output, success) = d
            .execute("", &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(success);
        assert!(output.contains("### TASK_DONE ###"));
    }

    #[tokio::test]
    async fn stop_token_signals_success() {
        let d = AgentDriver::new(test_config(&["echo", "run COMPLETED ok"]), ".");
        let (_, success) = d
            .execute("", &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(success);
    }

    #[tokio::test]
    async fn zero_exit_is_implicit_success() {
        let d = AgentDriver::new(test_config(&["true"]), ".");
        let (output, success) = d
            .execute("", &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(success);
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_without_marker_is_failure_not_error() {
        let d = AgentDriver::new(test_config(&["sh", "-c", "echo broke >&2; exit 3"]), ".");
        let (output, success) = d
            .execute("", &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(!success);
        assert!(output.contains("broke"));
    }

    #[tokio::test]
    async fn marker_on_stderr_wins_over_nonzero_exit() {
        let d = AgentDriver::new(
            test_config(&["sh", "-c", "echo '### TASK_DONE ###' >&2; exit 2"]),
            ".",
        );
        let (_, success) = d
            .execute("", &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(success);
    }

    #[tokio::test]
    async fn stdout_precedes_stderr_in_combined_output() {
        let d = AgentDriver::new(test_config(&["sh", "-c", "echo out; echo err >&2"]), ".");
        let (output, _) = d
            .execute("", &CancellationToken::new(), None)
            .await
            .unwrap();
        let out_pos = output.find("out").unwrap();
        let err_pos = output.find("err").unwrap();
        assert!(out_pos < err_pos);
    }

    #[tokio::test]
    async fn prompt_is_passed_as_trailing_argument() {
        let d = AgentDriver::new(test_config(&["echo"]), ".");
        let (output, _) = d
            .execute("say hello", &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(output.contains("say hello"));
    }

    #[tokio::test]
    async fn prompt_is_mirrored_to_stdin() {
        // `cat -` reads stdin; the trailing prompt argument lands in $0 of
        // the -c script and is ignored.
        let d = AgentDriver::new(test_config(&["sh", "-c", "cat -"]), ".");
        let (output, _) = d
            .execute("from stdin", &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(output.contains("from stdin"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let d = AgentDriver::new(test_config(&["definitely-not-a-real-binary-4af1"]), ".");
        let err = d
            .execute("", &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Spawn { .. }));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let d = AgentDriver::new(test_config(&["sleep", "30"]), ".");
        let cancel = CancellationToken::new();
        let killer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            killer.cancel();
        });

        let start = std::time::Instant::now();
        let err = d.execute("", &cancel, None).await.unwrap_err();
        assert!(matches!(err, HiveError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn output_is_mirrored_to_the_sink() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("task.log");
        let mut sink = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .unwrap();

        let d = AgentDriver::new(test_config(&["echo", "### TASK_DONE ###"]), ".");
        d.execute("", &CancellationToken::new(), Some(&mut sink))
            .await
            .unwrap();

        let logged = std::fs::read_to_string(&path).unwrap();
        assert!(logged.contains("### TASK_DONE ###"));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let d = AgentDriver::new(test_config(&["true"]), ".");
        d.start().unwrap();
        assert!(matches!(d.start(), Err(HiveError::AgentAlreadyRunning)));
        d.stop();
        assert!(!d.is_alive());
    }

    #[tokio::test]
    async fn restart_is_capped_then_reset_reopens() {
        let d = AgentDriver::new(test_config(&["true"]), ".");
        d.start().unwrap();

        d.restart().await.unwrap();
        d.restart().await.unwrap();
        assert!(matches!(
            d.restart().await,
            Err(HiveError::RestartLimit(2))
        ));

        d.reset_restart_count();
        d.restart().await.unwrap();
        assert!(d.is_alive());
    }

    #[tokio::test]
    async fn ensure_alive_restarts_a_stopped_driver() {
        let d = AgentDriver::new(test_config(&["true"]), ".");
        d.start().unwrap();
        d.stop();
        d.ensure_alive().await.unwrap();
        assert!(d.is_alive());
    }
}
