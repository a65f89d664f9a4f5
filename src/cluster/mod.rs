//! Cluster substrate: node groups, provisioning, and run supervision.
//!
//! A node group is the set of interconnected compute nodes backing one
//! job's replica-exchange process group. The [`NodeProvisioner`] owns group
//! lifecycle (create, rendezvous, replace, destroy); the [`RunLauncher`]
//! drives the collective start barrier and polls run health. Both are
//! traits so the scheduler core is backend-agnostic: `local` spawns real
//! child processes speaking the gRPC node contract, `mock` is the scripted
//! driver the test suite controls.

pub mod local;
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::JobSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeGroupState {
    Creating,
    Ready,
    /// Node replacement budget exceeded; the group will never reach full
    /// readiness and the owning job must fail.
    Degraded,
    Terminating,
    Gone,
}

impl std::fmt::Display for NodeGroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeGroupState::Creating => write!(f, "creating"),
            NodeGroupState::Ready => write!(f, "ready"),
            NodeGroupState::Degraded => write!(f, "degraded"),
            NodeGroupState::Terminating => write!(f, "terminating"),
            NodeGroupState::Gone => write!(f, "gone"),
        }
    }
}

/// Opaque reference to a node group, resolvable by any driver method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeGroupHandle {
    pub name: String,
    pub job_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct NodeGroupStatus {
    pub state: NodeGroupState,
    pub desired_size: u32,
    /// Identifiers of nodes that completed rendezvous. A node is ready only
    /// once address exchange with every peer has succeeded.
    pub ready_nodes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl NodeGroupStatus {
    pub fn ready_count(&self) -> u32 {
        self.ready_nodes.len() as u32
    }

    /// All-or-nothing rendezvous gate: every rank present and exchanged.
    pub fn is_fully_ready(&self) -> bool {
        self.state == NodeGroupState::Ready && self.ready_count() == self.desired_size
    }
}

/// Health of a launched process group, as seen by polling.
#[derive(Debug, Clone, PartialEq)]
pub enum RunHealth {
    /// Alive; carries the most recent heartbeat timestamp so the caller can
    /// apply its liveness timeout.
    Serving { last_heartbeat: DateTime<Utc> },
    Succeeded,
    Failed { exit_code: Option<i32> },
    /// No rank reachable (node death or network partition) since `since`.
    Unreachable { since: DateTime<Utc> },
}

#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    /// Create the node group for a job, or return the existing live group.
    /// At most one live group per job ever exists.
    async fn provision(&self, job_id: Uuid, spec: &JobSpec) -> Result<NodeGroupHandle>;

    /// Tear the group down. Deprovisioning an already-absent group succeeds
    /// trivially.
    async fn deprovision(&self, handle: &NodeGroupHandle) -> Result<()>;

    async fn describe(&self, handle: &NodeGroupHandle) -> Result<NodeGroupStatus>;

    /// All live groups, for the idle/orphan sweep.
    async fn list_groups(&self) -> Result<Vec<NodeGroupHandle>>;

    /// Resolve a job's live group, if any.
    async fn find_group(&self, job_id: Uuid) -> Result<Option<NodeGroupHandle>> {
        Ok(self
            .list_groups()
            .await?
            .into_iter()
            .find(|h| h.job_id == job_id))
    }
}

#[async_trait]
pub trait RunLauncher: Send + Sync {
    /// Start the sampling process group. Collective: returns Ok only once
    /// every rank has joined the start barrier. Idempotent for a group that
    /// is already running.
    async fn launch(&self, handle: &NodeGroupHandle) -> Result<()>;

    /// Poll run health. Never blocks on the run itself.
    async fn probe(&self, handle: &NodeGroupHandle) -> Result<RunHealth>;
}
