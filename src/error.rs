use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::job::JobStatus;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("status conflict for job {id}: expected {expected}, found {actual}")]
    StatusConflict {
        id: Uuid,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("node group not found: {0}")]
    GroupNotFound(String),

    #[error("cluster quota exceeded")]
    QuotaExceeded,

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("run launch failed: {0}")]
    Launch(String),

    #[error("node rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Whether the task queue may retry the failed operation with backoff.
    ///
    /// User errors are rejected at the API boundary and status conflicts are
    /// absorbed by re-reading the store, so neither reaches the queue.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::QuotaExceeded
                | SchedulerError::Provision(_)
                | SchedulerError::Launch(_)
                | SchedulerError::Rpc(_)
                | SchedulerError::Transport(_)
                | SchedulerError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
