//! Worker pool: N loops, each pulling one task at a time from the queue.
//!
//! Concurrency across tasks comes from the number of loops; a single loop
//! blocks on its child process until it exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::executor::Executor;
use crate::config::WorkerPoolConfig;
use crate::queue::{QueuedTask, TaskQueue};
use crate::tasks::{StatusRecord, details};

/// Spawn the worker loops.
///
/// Returns a `JoinHandle` that completes once every loop has stopped, and the
/// shutdown flag. Setting the flag stops loops between tasks; a running task is
/// always finished first.
pub fn spawn_worker_pool(
    queue: Arc<dyn TaskQueue>,
    executor: Arc<Executor>,
    config: WorkerPoolConfig,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(workers = config.workers, "Worker pool started");
        let loops = (0..config.workers).map(|index| {
            worker_loop(
                index,
                Arc::clone(&queue),
                Arc::clone(&executor),
                config,
                Arc::clone(&shutdown),
            )
        });
        futures::future::join_all(loops).await;
        info!("Worker pool stopped");
    });

    (handle, shutdown_flag)
}

async fn worker_loop(
    index: usize,
    queue: Arc<dyn TaskQueue>,
    executor: Arc<Executor>,
    config: WorkerPoolConfig,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!(worker = index, "Worker shutting down");
            return;
        }

        match queue.dequeue().await {
            Ok(Some(task)) => run_guarded(index, &executor, task).await,
            Ok(None) => tokio::time::sleep(config.poll_interval).await,
            Err(e) => {
                warn!(worker = index, error = %e, "Failed to poll queue");
                tokio::time::sleep(config.poll_interval).await;
            }
        }
    }
}

/// Run a task on its own tokio task so a panic is contained and still ends the
/// task as FAILED.
async fn run_guarded(index: usize, executor: &Arc<Executor>, task: QueuedTask) {
    let id = task.id.clone();
    let runner = Arc::clone(executor);

    match tokio::spawn(async move { runner.run(task).await }).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!(worker = index, task_id = %id, error = %e, "Task outcome not recorded"),
        Err(join_error) => {
            error!(worker = index, task_id = %id, error = %join_error, "Task run panicked");
            let records = executor.records();
            let record = StatusRecord::failed(
                "Worker crashed while running the task",
                details([("error", json!(join_error.to_string()))]),
            );
            if let Err(e) = records.write_status_if_absent(&id, &record).await {
                error!(task_id = %id, error = %e, "Failed to record crash");
            }
            if let Err(e) = records.clear_process_handle(&id).await {
                warn!(task_id = %id, error = %e, "Failed to delete process handle");
            }
        }
    }
}
