//! Asynchronous work items and their queue.
//!
//! Delivery is at-least-once: a task may be redelivered after a worker
//! retry, so every handler must be a no-op when the observed state already
//! satisfies its goal. The kind is a closed enum, so only well-formed work
//! items can ever be enqueued.

pub mod worker;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

pub use worker::{spawn_workers, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Provision,
    LaunchRun,
    Monitor,
    Deprovision,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Provision => write!(f, "provision"),
            TaskKind::LaunchRun => write!(f, "launch_run"),
            TaskKind::Monitor => write!(f, "monitor"),
            TaskKind::Deprovision => write!(f, "deprovision"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub job_id: Uuid,
    pub kind: TaskKind,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    pub fn new(job_id: Uuid, kind: TaskKind) -> Self {
        Self {
            job_id,
            kind,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// The same work item, one attempt later.
    pub fn retry(&self) -> Self {
        Self {
            job_id: self.job_id,
            kind: self.kind,
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
        }
    }
}

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Sender half of the task channel, cheap to clone into every subsystem.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
}

impl TaskQueue {
    pub fn new() -> (Self, mpsc::Receiver<Task>) {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Task>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue a task. Returns false if the queue is shut down; the
    /// reconcile loop re-emits lost work on its next pass, so this is safe
    /// to ignore at call sites.
    pub async fn enqueue(&self, task: Task) -> bool {
        let kind = task.kind;
        let job_id = task.job_id;
        match self.tx.send(task).await {
            Ok(()) => {
                tracing::debug!(job_id = %job_id, kind = %kind, "Task enqueued");
                true
            }
            Err(_) => {
                tracing::warn!(job_id = %job_id, kind = %kind, "Task queue closed, task dropped");
                false
            }
        }
    }
}
