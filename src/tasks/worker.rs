//! Task dispatch: a bounded worker pool with per-task backoff.
//!
//! One dispatcher loop drains the queue and hands every task to a spawned
//! handler, bounded by a semaphore. Retryable failures re-enqueue the task
//! after an exponential, jittered delay; exceeding the attempt cap surfaces
//! the exhaustion to the controller, which turns it into a terminal job
//! status. Nothing here retries forever.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scheduler::controller::JobController;
use crate::tasks::{Task, TaskQueue};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl RetryPolicy {
    /// Exponential backoff with equal jitter, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16));
        let capped = exp.min(self.backoff_cap_ms).max(1);
        let jittered = rand::thread_rng().gen_range(capped / 2..=capped);
        Duration::from_millis(jittered)
    }
}

/// Spawn the dispatcher. `concurrency` bounds simultaneously running
/// handlers; queued tasks wait for a permit.
pub fn spawn_workers(
    concurrency: usize,
    mut rx: mpsc::Receiver<Task>,
    controller: Arc<JobController>,
    queue: TaskQueue,
    policy: RetryPolicy,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    tokio::spawn(async move {
        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(task) => task,
                    None => break,
                },
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let controller = controller.clone();
            let queue = queue.clone();
            tokio::spawn(async move {
                let result = controller.handle(&task).await;
                drop(permit);
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => {
                        if task.attempt + 1 >= policy.max_attempts {
                            tracing::warn!(
                                job_id = %task.job_id,
                                kind = %task.kind,
                                attempts = task.attempt + 1,
                                error = %e,
                                "Task retry budget exhausted"
                            );
                            controller.task_exhausted(&task, &e).await;
                        } else {
                            let delay = policy.delay(task.attempt);
                            tracing::debug!(
                                job_id = %task.job_id,
                                kind = %task.kind,
                                attempt = task.attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Task failed, retrying with backoff"
                            );
                            tokio::time::sleep(delay).await;
                            queue.enqueue(task.retry()).await;
                        }
                    }
                    Err(e) => {
                        // Non-retryable: the reconcile loop re-emits work
                        // for live jobs, so dropping here cannot wedge one.
                        tracing::warn!(
                            job_id = %task.job_id,
                            kind = %task.kind,
                            error = %e,
                            "Task failed with non-retryable error, dropped"
                        );
                    }
                }
            });
        }

        tracing::debug!("Task dispatcher stopped");
    })
}
