#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::HiveError;
use crate::registry::model::Task;
use crate::worker::runner::{TaskResult, Worker};

/// Fixed set of worker loops draining a bounded submission channel and
/// fanning results back to the orchestrator. Priority ordering is enforced
/// upstream by the registry; the channels only preserve submission order.
pub struct WorkerPool {
    config: Arc<Config>,
    task_tx: Mutex<Option<mpsc::Sender<Task>>>,
    task_rx: Mutex<Option<mpsc::Receiver<Task>>>,
    result_tx: Mutex<Option<mpsc::Sender<TaskResult>>>,
    result_rx: Mutex<Option<mpsc::Receiver<TaskResult>>>,
    workers: Mutex<Option<JoinSet<()>>>,
    active: Arc<AtomicUsize>,
    started: AtomicBool,
}

impl WorkerPool {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        // Buffer two tasks per worker so dispatching stays smooth.
        let capacity = config.num_workers.max(1) * 2;
        let (task_tx, task_rx) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);
        Self {
            config,
            task_tx: Mutex::new(Some(task_tx)),
            task_rx: Mutex::new(Some(task_rx)),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: Mutex::new(Some(result_rx)),
            workers: Mutex::new(None),
            active: Arc::new(AtomicUsize::new(0)),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the worker loops bound to `cancel`. Idempotent.
    pub fn start(&self, cancel: &CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(task_rx) = lock(&self.task_rx).take() else {
            return;
        };
        let Some(result_tx) = lock(&self.result_tx).as_ref().cloned() else {
            return;
        };

        info!(num_workers = self.config.num_workers, "starting worker pool");

        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let mut set = JoinSet::new();
        for id in 1..=self.config.num_workers {
            let worker = Worker::new(u32::try_from(id).unwrap_or(u32::MAX), Arc::clone(&self.config));
            let task_rx = Arc::clone(&task_rx);
            let result_tx = result_tx.clone();
            let cancel = cancel.clone();
            let active = Arc::clone(&self.active);
            set.spawn(async move {
                active.fetch_add(1, Ordering::SeqCst);
                worker_loop(worker, task_rx, result_tx, cancel).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        *lock(&self.workers) = Some(set);

        info!(active_workers = self.config.num_workers, "worker pool started");
    }

    /// Non-blocking submission; false when the channel is full or closed.
    pub fn submit(&self, task: Task) -> bool {
        let guard = lock(&self.task_tx);
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!(task_id = %task.id, "task channel full, task not submitted");
                false
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                warn!(task_id = %task.id, "task channel closed, task not submitted");
                false
            }
        }
    }

    /// Blocks until the pool accepts the task or `cancel` fires.
    pub async fn submit_blocking(
        &self,
        cancel: &CancellationToken,
        task: Task,
    ) -> Result<(), HiveError> {
        let tx = lock(&self.task_tx)
            .as_ref()
            .cloned()
            .ok_or_else(|| HiveError::Other("worker pool is stopped".to_owned()))?;
        tokio::select! {
            () = cancel.cancelled() => Err(HiveError::Cancelled),
            res = tx.send(task) => {
                res.map_err(|_| HiveError::Other("worker pool is stopped".to_owned()))
            }
        }
    }

    /// Hands the consumer side of the result channel to the caller. Yields
    /// `None` on the second call.
    pub fn take_results(&self) -> Option<mpsc::Receiver<TaskResult>> {
        lock(&self.result_rx).take()
    }

    /// Closes the input channel, waits for every worker to finish its
    /// in-flight task, then closes the result channel.
    pub async fn stop(&self) {
        info!("stopping worker pool");
        drop(lock(&self.task_tx).take());

        let set = lock(&self.workers).take();
        if let Some(mut set) = set {
            while let Some(res) = set.join_next().await {
                if let Err(e) = res {
                    error!(error = %e, "worker join error");
                }
            }
        }

        drop(lock(&self.result_tx).take());
        info!("worker pool stopped");
    }

    /// Tasks queued in the input channel, not yet picked up.
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.task_tx)
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        lock(&self.task_tx)
            .as_ref()
            .is_none_or(|tx| tx.capacity() == 0)
    }
}

async fn worker_loop(
    worker: Worker,
    task_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    result_tx: mpsc::Sender<TaskResult>,
    cancel: CancellationToken,
) {
    debug!(worker_id = worker.id(), "worker loop started");
    loop {
        let task = {
            let mut rx = task_rx.lock().await;
            tokio::select! {
                () = cancel.cancelled() => None,
                task = rx.recv() => task,
            }
        };
        let Some(task) = task else {
            break;
        };

        let result = run_guarded(&worker, task, &cancel).await;
        if result_tx.send(result).await.is_err() {
            break;
        }
    }
    debug!(worker_id = worker.id(), "worker loop exited");
}

/// Isolation boundary: a panic while processing one task must not take the
/// worker loop (or its siblings) down. The iteration runs in its own task;
/// a panicked join is converted into a failed result.
async fn run_guarded(worker: &Worker, task: Task, cancel: &CancellationToken) -> TaskResult {
    let fallback = task.clone();
    let w = worker.clone();
    let c = cancel.clone();
    match tokio::spawn(async move { w.process(task, c).await }).await {
        Ok(result) => result,
        Err(e) => {
            error!(worker_id = worker.id(), task_id = %fallback.id, error = %e, "worker panicked");
            TaskResult {
                task: fallback,
                status: crate::registry::model::TaskStatus::Failed,
                worker_id: worker.id(),
                duration: std::time::Duration::ZERO,
                fail_reason: "worker panic".to_owned(),
                output: String::new(),
                new_tasks: Vec::new(),
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
