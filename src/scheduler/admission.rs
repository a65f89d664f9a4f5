//! Cluster budget accounting and admission grants.
//!
//! The budget is the only cross-job shared mutable state in the scheduler;
//! every mutation goes through the single mutex in [`Autoscaler`]. Grants
//! are recorded per job so that redelivered tasks can release idempotently.

use std::collections::HashMap;

use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// Allocated-node ledger, keyed by job.
#[derive(Debug, Default)]
pub struct ClusterBudget {
    grants: HashMap<Uuid, u32>,
}

impl ClusterBudget {
    pub fn allocated(&self) -> u32 {
        self.grants.values().sum()
    }
}

pub struct Autoscaler {
    max_nodes: u32,
    budget: Mutex<ClusterBudget>,
    capacity_changed: Notify,
}

impl Autoscaler {
    pub fn new(max_nodes: u32) -> Self {
        Self {
            max_nodes,
            budget: Mutex::new(ClusterBudget::default()),
            capacity_changed: Notify::new(),
        }
    }

    /// Grant `nodes` to a job if the cluster has headroom. Idempotent: a job
    /// that already holds a grant is confirmed without double-counting.
    pub async fn try_admit(&self, job_id: Uuid, nodes: u32) -> bool {
        let mut budget = self.budget.lock().await;

        if budget.grants.contains_key(&job_id) {
            return true;
        }

        let allocated = budget.allocated();
        if allocated + nodes > self.max_nodes {
            tracing::debug!(
                job_id = %job_id,
                requested = nodes,
                allocated,
                max = self.max_nodes,
                "Admission denied, cluster saturated"
            );
            return false;
        }

        budget.grants.insert(job_id, nodes);
        tracing::info!(
            job_id = %job_id,
            nodes,
            allocated = allocated + nodes,
            "Admission granted"
        );
        true
    }

    /// Return a job's grant to the pool. Idempotent; wakes waiters so queued
    /// jobs get re-evaluated without manual intervention.
    pub async fn release(&self, job_id: Uuid) {
        let mut budget = self.budget.lock().await;
        if let Some(nodes) = budget.grants.remove(&job_id) {
            tracing::info!(
                job_id = %job_id,
                nodes,
                allocated = budget.allocated(),
                "Budget released"
            );
            drop(budget);
            self.capacity_changed.notify_waiters();
        }
    }

    pub async fn allocated(&self) -> u32 {
        self.budget.lock().await.allocated()
    }

    pub async fn has_grant(&self, job_id: Uuid) -> bool {
        self.budget.lock().await.grants.contains_key(&job_id)
    }

    /// Kick the reconcile loop, e.g. on submission or an explicit start.
    pub fn notify_capacity_change(&self) {
        self.capacity_changed.notify_waiters();
    }

    pub async fn wait_capacity_change(&self) {
        self.capacity_changed.notified().await;
    }
}
