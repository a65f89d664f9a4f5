//! Local process-backed cluster driver.
//!
//! Each node of a group is a child process of the configured entrypoint,
//! serving the `NodeControl` contract on a loopback port. Rendezvous is
//! real: a node is only marked ready once it has acknowledged the full peer
//! address list over RPC. Nodes that die before becoming ready are replaced
//! up to the replacement budget, then the group degrades. Useful both as a
//! single-machine deployment target and as the end-to-end test vehicle for
//! the node contract.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use uuid::Uuid;

use crate::cluster::{
    NodeGroupHandle, NodeGroupState, NodeGroupStatus, NodeProvisioner, RunHealth, RunLauncher,
};
use crate::error::{Result, SchedulerError};
use crate::proto::node_control_client::NodeControlClient;
use crate::proto::{ProbeRequest, RendezvousRequest, RunState, StartRunRequest};
use crate::scheduler::job::JobSpec;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const RPC_TIMEOUT: Duration = Duration::from_secs(2);

struct LocalNode {
    id: String,
    rank: u32,
    addr: String,
    child: Child,
    ready: bool,
}

struct LocalGroup {
    handle: NodeGroupHandle,
    desired: u32,
    image: String,
    model_ref: String,
    nodes: Vec<LocalNode>,
    created_at: DateTime<Utc>,
    replacements: u32,
    degraded: bool,
    last_contact: DateTime<Utc>,
}

#[derive(Default)]
struct LocalInner {
    groups: HashMap<Uuid, LocalGroup>,
    next_port: u16,
    seq: u32,
}

pub struct LocalCluster {
    entrypoint: String,
    replace_budget: u32,
    inner: Mutex<LocalInner>,
}

impl LocalCluster {
    pub fn new(entrypoint: String, base_port: u16, replace_budget: u32) -> Self {
        Self {
            entrypoint,
            replace_budget,
            inner: Mutex::new(LocalInner {
                groups: HashMap::new(),
                next_port: base_port,
                seq: 0,
            }),
        }
    }

    fn spawn_node(
        entrypoint: &str,
        job_id: Uuid,
        image: &str,
        model_ref: &str,
        rank: u32,
        addr: &str,
    ) -> Result<Child> {
        let mut cmd = Command::new(entrypoint);
        cmd.arg("--job")
            .arg(job_id.to_string())
            .arg("--image")
            .arg(image)
            .arg("--model")
            .arg(model_ref)
            .arg("--rank")
            .arg(rank.to_string())
            .arg("--listen")
            .arg(addr)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd.spawn()
            .map_err(|e| SchedulerError::Provision(format!("failed to spawn node process: {}", e)))
    }

    async fn connect(addr: &str) -> Result<NodeControlClient<Channel>> {
        let channel = Endpoint::from_shared(format!("http://{}", addr))?
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(RPC_TIMEOUT)
            .connect()
            .await?;
        Ok(NodeControlClient::new(channel))
    }

    /// Advance readiness for every unready node: dead processes are
    /// replaced within the budget, live ones get a rendezvous attempt with
    /// the current peer list.
    async fn refresh_group(group: &mut LocalGroup, replace_budget: u32, entrypoint: &str) {
        let peer_addrs: Vec<String> = group.nodes.iter().map(|n| n.addr.clone()).collect();
        let job_id = group.handle.job_id;

        for idx in 0..group.nodes.len() {
            if group.nodes[idx].ready || group.degraded {
                continue;
            }

            // A node that exited before rendezvous is dead, not slow.
            if let Ok(Some(status)) = group.nodes[idx].child.try_wait() {
                if group.replacements >= replace_budget {
                    tracing::warn!(
                        job_id = %job_id,
                        node = %group.nodes[idx].id,
                        exit = ?status.code(),
                        "Node died and replacement budget is spent, degrading group"
                    );
                    group.degraded = true;
                    continue;
                }
                group.replacements += 1;
                tracing::info!(
                    job_id = %job_id,
                    node = %group.nodes[idx].id,
                    exit = ?status.code(),
                    replacement = group.replacements,
                    "Replacing dead node"
                );
                let (rank, addr) = (group.nodes[idx].rank, group.nodes[idx].addr.clone());
                match Self::spawn_node(
                    entrypoint,
                    job_id,
                    &group.image,
                    &group.model_ref,
                    rank,
                    &addr,
                ) {
                    Ok(child) => group.nodes[idx].child = child,
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Node replacement spawn failed");
                        group.degraded = true;
                    }
                }
                continue;
            }

            let addr = group.nodes[idx].addr.clone();
            let rank = group.nodes[idx].rank;
            let mut client = match Self::connect(&addr).await {
                Ok(client) => client,
                // Not up yet; the next describe poll tries again.
                Err(_) => continue,
            };
            let request = RendezvousRequest {
                job_id: job_id.to_string(),
                rank,
                peer_addrs: peer_addrs.clone(),
            };
            match client.rendezvous(request).await {
                Ok(reply) => {
                    if reply.into_inner().ready {
                        tracing::debug!(job_id = %job_id, rank, addr = %addr, "Node rendezvous complete");
                        group.nodes[idx].ready = true;
                    }
                }
                Err(_) => {}
            }
        }
    }
}

#[async_trait]
impl NodeProvisioner for LocalCluster {
    async fn provision(&self, job_id: Uuid, spec: &JobSpec) -> Result<NodeGroupHandle> {
        let mut inner = self.inner.lock().await;

        if let Some(group) = inner.groups.get(&job_id) {
            return Ok(group.handle.clone());
        }

        let seq = inner.seq;
        inner.seq += 1;
        let handle = NodeGroupHandle {
            name: format!("grp-{}-{}", &job_id.to_string()[..8], seq),
            job_id,
        };

        let mut nodes = Vec::with_capacity(spec.replica_count as usize);
        for rank in 0..spec.replica_count {
            let port = inner.next_port;
            inner.next_port = inner.next_port.wrapping_add(1);
            let addr = format!("127.0.0.1:{}", port);
            let child =
                Self::spawn_node(&self.entrypoint, job_id, &spec.image, &spec.model_ref, rank, &addr)?;
            nodes.push(LocalNode {
                id: format!("{}-node-{}", handle.name, rank),
                rank,
                addr,
                child,
                ready: false,
            });
        }

        tracing::info!(
            job_id = %job_id,
            group = %handle.name,
            nodes = spec.replica_count,
            "Spawned local node group"
        );

        inner.groups.insert(
            job_id,
            LocalGroup {
                handle: handle.clone(),
                desired: spec.replica_count,
                image: spec.image.clone(),
                model_ref: spec.model_ref.clone(),
                nodes,
                created_at: Utc::now(),
                replacements: 0,
                degraded: false,
                last_contact: Utc::now(),
            },
        );

        Ok(handle)
    }

    async fn deprovision(&self, handle: &NodeGroupHandle) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(mut group) = inner.groups.remove(&handle.job_id) else {
            return Ok(());
        };

        for node in &mut group.nodes {
            if let Err(e) = node.child.start_kill() {
                tracing::debug!(node = %node.id, error = %e, "Kill failed (already exited?)");
            }
        }
        for node in &mut group.nodes {
            let _ = node.child.wait().await;
        }

        tracing::info!(group = %handle.name, "Local node group torn down");
        Ok(())
    }

    async fn describe(&self, handle: &NodeGroupHandle) -> Result<NodeGroupStatus> {
        let mut inner = self.inner.lock().await;
        let group = inner
            .groups
            .get_mut(&handle.job_id)
            .ok_or_else(|| SchedulerError::GroupNotFound(handle.name.clone()))?;

        Self::refresh_group(group, self.replace_budget, &self.entrypoint).await;

        let ready_nodes: Vec<String> = group
            .nodes
            .iter()
            .filter(|n| n.ready)
            .map(|n| n.id.clone())
            .collect();
        let state = if group.degraded {
            NodeGroupState::Degraded
        } else if ready_nodes.len() as u32 == group.desired {
            NodeGroupState::Ready
        } else {
            NodeGroupState::Creating
        };

        Ok(NodeGroupStatus {
            state,
            desired_size: group.desired,
            ready_nodes,
            created_at: group.created_at,
        })
    }

    async fn list_groups(&self) -> Result<Vec<NodeGroupHandle>> {
        let inner = self.inner.lock().await;
        Ok(inner.groups.values().map(|g| g.handle.clone()).collect())
    }
}

#[async_trait]
impl RunLauncher for LocalCluster {
    async fn launch(&self, handle: &NodeGroupHandle) -> Result<()> {
        let addrs: Vec<String> = {
            let inner = self.inner.lock().await;
            let group = inner
                .groups
                .get(&handle.job_id)
                .ok_or_else(|| SchedulerError::GroupNotFound(handle.name.clone()))?;
            group.nodes.iter().map(|n| n.addr.clone()).collect()
        };

        // Collective start: every rank must ack before any is considered
        // started. A failed rank fails the whole barrier, which the task
        // queue retries.
        for addr in &addrs {
            let mut client = Self::connect(addr).await?;
            let reply = client
                .start_run(StartRunRequest {
                    job_id: handle.job_id.to_string(),
                })
                .await?
                .into_inner();
            if !reply.started {
                return Err(SchedulerError::Launch(format!(
                    "rank at {} refused the start barrier",
                    addr
                )));
            }
        }

        tracing::info!(group = %handle.name, ranks = addrs.len(), "Start barrier complete");
        Ok(())
    }

    async fn probe(&self, handle: &NodeGroupHandle) -> Result<RunHealth> {
        let (addrs, last_contact) = {
            let inner = self.inner.lock().await;
            let group = inner
                .groups
                .get(&handle.job_id)
                .ok_or_else(|| SchedulerError::GroupNotFound(handle.name.clone()))?;
            let addrs: Vec<String> = group.nodes.iter().map(|n| n.addr.clone()).collect();
            (addrs, group.last_contact)
        };

        let mut oldest_heartbeat: Option<DateTime<Utc>> = None;
        let mut all_succeeded = true;

        for addr in &addrs {
            let mut client = match Self::connect(addr).await {
                Ok(client) => client,
                Err(_) => {
                    return Ok(RunHealth::Unreachable {
                        since: last_contact,
                    })
                }
            };
            let reply = match client
                .probe(ProbeRequest {
                    job_id: handle.job_id.to_string(),
                })
                .await
            {
                Ok(reply) => reply.into_inner(),
                Err(_) => {
                    return Ok(RunHealth::Unreachable {
                        since: last_contact,
                    })
                }
            };

            match reply.state() {
                RunState::Failed => {
                    return Ok(RunHealth::Failed {
                        exit_code: Some(reply.exit_code),
                    })
                }
                RunState::Succeeded => {}
                RunState::Serving | RunState::Unknown => {
                    all_succeeded = false;
                    let hb = Utc
                        .timestamp_millis_opt(reply.heartbeat_ms)
                        .single()
                        .unwrap_or_else(Utc::now);
                    oldest_heartbeat = Some(match oldest_heartbeat {
                        Some(cur) => cur.min(hb),
                        None => hb,
                    });
                }
            }
        }

        if let Some(group) = self.inner.lock().await.groups.get_mut(&handle.job_id) {
            group.last_contact = Utc::now();
        }

        if all_succeeded {
            Ok(RunHealth::Succeeded)
        } else {
            Ok(RunHealth::Serving {
                last_heartbeat: oldest_heartbeat.unwrap_or_else(Utc::now),
            })
        }
    }
}
