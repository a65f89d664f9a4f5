//! Scripted in-process cluster driver.
//!
//! Stands in for a real cloud backend the way a deployable dummy driver
//! would: groups live in a map, readiness and run outcomes are set by the
//! test, and failures are injected by counters. Also keeps call counters so
//! tests can assert the at-most-one-live-group invariant and task
//! idempotence directly.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cluster::{
    NodeGroupHandle, NodeGroupState, NodeGroupStatus, NodeProvisioner, RunHealth, RunLauncher,
};
use crate::error::{Result, SchedulerError};
use crate::scheduler::job::JobSpec;

#[derive(Debug, Clone, Copy, PartialEq)]
enum MockRun {
    Idle,
    Serving,
    Succeeded,
    Failed(i32),
}

#[derive(Debug, Clone)]
struct MockGroup {
    handle: NodeGroupHandle,
    desired: u32,
    ready: Vec<String>,
    degraded: bool,
    created_at: DateTime<Utc>,
    run: MockRun,
    heartbeats_flowing: bool,
    last_heartbeat: DateTime<Utc>,
    unreachable_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MockInner {
    groups: HashMap<Uuid, MockGroup>,
    auto_ready: bool,
    ready_limit: Option<u32>,
    provision_failures: u32,
    deprovision_failures: u32,
    launch_failures: u32,
    provision_calls: u32,
    deprovision_calls: u32,
    launch_calls: u32,
    groups_created: u32,
    peak_live_groups: usize,
    seq: u32,
}

#[derive(Default)]
pub struct MockCluster {
    inner: Mutex<MockInner>,
}

impl MockCluster {
    /// Driver whose nodes become ready immediately on provision.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockInner {
                auto_ready: true,
                ..Default::default()
            }),
        }
    }

    /// Driver whose nodes stay unready until [`Self::make_ready`].
    pub fn manual() -> Self {
        Self::default()
    }

    // --- failure & readiness scripting -------------------------------

    pub async fn set_ready_limit(&self, limit: Option<u32>) {
        self.inner.lock().await.ready_limit = limit;
    }

    pub async fn fail_next_provisions(&self, n: u32) {
        self.inner.lock().await.provision_failures = n;
    }

    pub async fn fail_next_deprovisions(&self, n: u32) {
        self.inner.lock().await.deprovision_failures = n;
    }

    pub async fn fail_next_launches(&self, n: u32) {
        self.inner.lock().await.launch_failures = n;
    }

    /// Mark every node of the job's group ready (rendezvous complete),
    /// honoring the configured ready limit.
    pub async fn make_ready(&self, job_id: Uuid) {
        let mut inner = self.inner.lock().await;
        let limit = inner.ready_limit;
        if let Some(group) = inner.groups.get_mut(&job_id) {
            let target = limit.unwrap_or(group.desired).min(group.desired);
            group.ready = (0..target).map(|rank| format!("node-{}", rank)).collect();
        }
    }

    pub async fn degrade_group(&self, job_id: Uuid) {
        if let Some(group) = self.inner.lock().await.groups.get_mut(&job_id) {
            group.degraded = true;
        }
    }

    /// Shift the group's creation time into the past, so timeout and grace
    /// bounds trip without real sleeping.
    pub async fn backdate_group(&self, job_id: Uuid, by_ms: i64) {
        if let Some(group) = self.inner.lock().await.groups.get_mut(&job_id) {
            group.created_at = group.created_at - Duration::milliseconds(by_ms);
        }
    }

    // --- run outcome scripting ---------------------------------------

    pub async fn complete_run(&self, job_id: Uuid) {
        if let Some(group) = self.inner.lock().await.groups.get_mut(&job_id) {
            group.run = MockRun::Succeeded;
        }
    }

    pub async fn fail_run(&self, job_id: Uuid, exit_code: i32) {
        if let Some(group) = self.inner.lock().await.groups.get_mut(&job_id) {
            group.run = MockRun::Failed(exit_code);
        }
    }

    /// Freeze the heartbeat clock: every later probe sees a staler and
    /// staler last heartbeat, as a partitioned-but-connectable node would.
    pub async fn silence_heartbeats(&self, job_id: Uuid) {
        if let Some(group) = self.inner.lock().await.groups.get_mut(&job_id) {
            group.heartbeats_flowing = false;
        }
    }

    pub async fn backdate_heartbeat(&self, job_id: Uuid, by_ms: i64) {
        if let Some(group) = self.inner.lock().await.groups.get_mut(&job_id) {
            group.last_heartbeat = group.last_heartbeat - Duration::milliseconds(by_ms);
        }
    }

    /// Simulate full node loss: probes return `Unreachable` from `since_ms`
    /// milliseconds ago.
    pub async fn make_unreachable(&self, job_id: Uuid, since_ms: i64) {
        if let Some(group) = self.inner.lock().await.groups.get_mut(&job_id) {
            group.unreachable_since = Some(Utc::now() - Duration::milliseconds(since_ms));
        }
    }

    // --- assertions ---------------------------------------------------

    pub async fn live_groups(&self) -> usize {
        self.inner.lock().await.groups.len()
    }

    pub async fn has_group(&self, job_id: Uuid) -> bool {
        self.inner.lock().await.groups.contains_key(&job_id)
    }

    pub async fn groups_created(&self) -> u32 {
        self.inner.lock().await.groups_created
    }

    pub async fn peak_live_groups(&self) -> usize {
        self.inner.lock().await.peak_live_groups
    }

    pub async fn provision_calls(&self) -> u32 {
        self.inner.lock().await.provision_calls
    }

    pub async fn deprovision_calls(&self) -> u32 {
        self.inner.lock().await.deprovision_calls
    }

    pub async fn launch_calls(&self) -> u32 {
        self.inner.lock().await.launch_calls
    }
}

#[async_trait]
impl NodeProvisioner for MockCluster {
    async fn provision(&self, job_id: Uuid, spec: &JobSpec) -> Result<NodeGroupHandle> {
        let mut inner = self.inner.lock().await;
        inner.provision_calls += 1;

        if inner.provision_failures > 0 {
            inner.provision_failures -= 1;
            return Err(SchedulerError::Provision(
                "injected provision failure".to_string(),
            ));
        }

        if let Some(group) = inner.groups.get(&job_id) {
            return Ok(group.handle.clone());
        }

        let seq = inner.seq;
        inner.seq += 1;
        let handle = NodeGroupHandle {
            name: format!("grp-{}-{}", &job_id.to_string()[..8], seq),
            job_id,
        };

        let ready = if inner.auto_ready {
            let target = inner
                .ready_limit
                .unwrap_or(spec.replica_count)
                .min(spec.replica_count);
            (0..target).map(|rank| format!("node-{}", rank)).collect()
        } else {
            Vec::new()
        };

        inner.groups.insert(
            job_id,
            MockGroup {
                handle: handle.clone(),
                desired: spec.replica_count,
                ready,
                degraded: false,
                created_at: Utc::now(),
                run: MockRun::Idle,
                heartbeats_flowing: true,
                last_heartbeat: Utc::now(),
                unreachable_since: None,
            },
        );
        inner.groups_created += 1;
        inner.peak_live_groups = inner.peak_live_groups.max(inner.groups.len());

        Ok(handle)
    }

    async fn deprovision(&self, handle: &NodeGroupHandle) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.deprovision_calls += 1;

        if inner.deprovision_failures > 0 {
            inner.deprovision_failures -= 1;
            return Err(SchedulerError::Provision(
                "injected deprovision failure".to_string(),
            ));
        }

        // Absent group: already gone, trivially successful.
        inner.groups.remove(&handle.job_id);
        Ok(())
    }

    async fn describe(&self, handle: &NodeGroupHandle) -> Result<NodeGroupStatus> {
        let inner = self.inner.lock().await;
        let group = inner
            .groups
            .get(&handle.job_id)
            .ok_or_else(|| SchedulerError::GroupNotFound(handle.name.clone()))?;

        let state = if group.degraded {
            NodeGroupState::Degraded
        } else if group.ready.len() as u32 == group.desired {
            NodeGroupState::Ready
        } else {
            NodeGroupState::Creating
        };

        Ok(NodeGroupStatus {
            state,
            desired_size: group.desired,
            ready_nodes: group.ready.clone(),
            created_at: group.created_at,
        })
    }

    async fn list_groups(&self) -> Result<Vec<NodeGroupHandle>> {
        let inner = self.inner.lock().await;
        Ok(inner.groups.values().map(|g| g.handle.clone()).collect())
    }
}

#[async_trait]
impl RunLauncher for MockCluster {
    async fn launch(&self, handle: &NodeGroupHandle) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.launch_calls += 1;

        if inner.launch_failures > 0 {
            inner.launch_failures -= 1;
            return Err(SchedulerError::Launch("injected launch failure".to_string()));
        }

        let group = inner
            .groups
            .get_mut(&handle.job_id)
            .ok_or_else(|| SchedulerError::GroupNotFound(handle.name.clone()))?;

        if group.run == MockRun::Idle {
            group.run = MockRun::Serving;
            group.last_heartbeat = Utc::now();
        }
        Ok(())
    }

    async fn probe(&self, handle: &NodeGroupHandle) -> Result<RunHealth> {
        let mut inner = self.inner.lock().await;
        let group = inner
            .groups
            .get_mut(&handle.job_id)
            .ok_or_else(|| SchedulerError::GroupNotFound(handle.name.clone()))?;

        if let Some(since) = group.unreachable_since {
            return Ok(RunHealth::Unreachable { since });
        }

        match group.run {
            MockRun::Succeeded => Ok(RunHealth::Succeeded),
            MockRun::Failed(code) => Ok(RunHealth::Failed {
                exit_code: Some(code),
            }),
            MockRun::Idle | MockRun::Serving => {
                if group.heartbeats_flowing {
                    group.last_heartbeat = Utc::now();
                }
                Ok(RunHealth::Serving {
                    last_heartbeat: group.last_heartbeat,
                })
            }
        }
    }
}
