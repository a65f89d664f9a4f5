use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Admitted,
    Provisioning,
    Running,
    Stopping,
    Finished,
    Stopped,
    Failed,
}

impl JobStatus {
    /// Terminal states are never left again; jobs are retained for audit.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Stopped | JobStatus::Failed
        )
    }

    /// States in which the job owns cluster nodes and `node_group` is set.
    pub fn holds_nodes(&self) -> bool {
        matches!(
            self,
            JobStatus::Provisioning | JobStatus::Running | JobStatus::Stopping
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Submitted => write!(f, "submitted"),
            JobStatus::Admitted => write!(f, "admitted"),
            JobStatus::Provisioning => write!(f, "provisioning"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Stopping => write!(f, "stopping"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Machine-readable cause attached to every terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The node group did not reach full readiness within the bound.
    ProvisionTimeout,
    /// Provisioning or node replacement exceeded its retry budget.
    ProvisionExhausted,
    /// The sampling process group exited with a failure code.
    RunFailed,
    /// Heartbeats stopped arriving beyond the liveness timeout.
    HeartbeatLost,
    /// Teardown kept failing; nodes may be leaked and need operator action.
    DeprovisionExhausted,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::ProvisionTimeout => write!(f, "provision_timeout"),
            FailureReason::ProvisionExhausted => write!(f, "provision_exhausted"),
            FailureReason::RunFailed => write!(f, "run_failed"),
            FailureReason::HeartbeatLost => write!(f, "heartbeat_lost"),
            FailureReason::DeprovisionExhausted => write!(f, "deprovision_exhausted"),
        }
    }
}

/// Per-node resource request, forwarded verbatim to the provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpus_per_node: u32,
    pub memory_mb: u64,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpus_per_node: 1,
            memory_mb: 2048,
        }
    }
}

/// Immutable description of what to run, fixed at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// User-facing name; also the metric namespace for this job.
    pub name: String,
    /// Reference to the model / probability definition the nodes load.
    pub model_ref: String,
    /// Number of replica-exchange ranks. Every rank must be present before
    /// sampling starts, so this is also the exact node count.
    pub replica_count: u32,
    /// Compute image the nodes boot.
    pub image: String,
    #[serde(default)]
    pub resources: ResourceRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub spec: JobSpec,
    pub status: JobStatus,
    /// Name of the live node group. Set iff status is provisioning,
    /// running, or stopping.
    pub node_group: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self::with_id(Uuid::new_v4(), spec, Utc::now())
    }

    pub fn with_id(id: Uuid, spec: JobSpec, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            spec,
            status: JobStatus::Submitted,
            node_group: None,
            failure_reason: None,
            retry_count: 0,
            created_at,
            started_at: None,
            finished_at: None,
        }
    }
}
