use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::{NodeProvisioner, RunLauncher};
use crate::config::SchedulerConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::metrics::MetricsSink;
use crate::scheduler::{Autoscaler, JobController};
use crate::store::{JobStore, MemoryJobStore};
use crate::tasks::{self, RetryPolicy, Task, TaskKind, TaskQueue};

/// Bounded window for finishing owed teardown work on shutdown.
const DRAIN_WINDOW: Duration = Duration::from_secs(5);

/// The scheduler daemon: wires store, admission, controller, task workers,
/// and the API server together.
pub struct SchedulerServer {
    pub config: SchedulerConfig,
    pub store: Arc<dyn JobStore>,
    pub autoscaler: Arc<Autoscaler>,
    pub controller: Arc<JobController>,
    queue: TaskQueue,
    task_rx: mpsc::Receiver<Task>,
}

impl SchedulerServer {
    pub fn new(
        config: SchedulerConfig,
        provisioner: Arc<dyn NodeProvisioner>,
        launcher: Arc<dyn RunLauncher>,
    ) -> Self {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        Self::with_store(config, store, provisioner, launcher)
    }

    /// Build against an externally owned store, e.g. one rehydrated from a
    /// durable backend: after a restart the controller reconstructs all
    /// supervision state from it plus the cluster itself.
    pub fn with_store(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        provisioner: Arc<dyn NodeProvisioner>,
        launcher: Arc<dyn RunLauncher>,
    ) -> Self {
        let autoscaler = Arc::new(Autoscaler::new(config.max_cluster_nodes));
        let (queue, task_rx) = TaskQueue::new();
        let metrics = MetricsSink::new(&config.metrics);
        let controller = Arc::new(JobController::new(
            store.clone(),
            provisioner,
            launcher,
            autoscaler.clone(),
            queue.clone(),
            metrics,
            config.clone(),
        ));

        Self {
            config,
            store,
            autoscaler,
            controller,
            queue,
            task_rx,
        }
    }

    /// Run all subsystems until the shutdown token fires:
    ///
    /// 1. Task worker pool (provision / launch / monitor / deprovision)
    /// 2. Reconcile loop (bounded interval + capacity-change wakeups)
    /// 3. Idle-group sweep (reclaims orphaned node groups)
    /// 4. REST API server
    ///
    /// On shutdown, owed teardown work is drained within a bounded window
    /// so that cancellation never abandons cluster resources silently.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            config,
            store,
            autoscaler,
            controller,
            queue,
            task_rx,
        } = self;

        // Supervision state is reconstructed from the store: a restart
        // loses no job and no grant.
        controller.restore_admissions().await?;

        let retry_policy = RetryPolicy {
            max_attempts: config.task_max_attempts,
            backoff_base_ms: config.task_backoff_base_ms,
            backoff_cap_ms: config.task_backoff_cap_ms,
        };
        tasks::spawn_workers(
            config.task_workers,
            task_rx,
            controller.clone(),
            queue.clone(),
            retry_policy,
            shutdown.clone(),
        );

        // Reconcile loop: level-triggered, so a missed wakeup only delays a
        // pass by one interval.
        let reconcile_controller = controller.clone();
        let reconcile_shutdown = shutdown.clone();
        let interval_ms = config.reconcile_interval_ms;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            loop {
                tokio::select! {
                    _ = reconcile_shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = autoscaler.wait_capacity_change() => {}
                }
                reconcile_controller.reconcile_pass().await;
            }
        });

        let sweep_controller = controller.clone();
        let sweep_shutdown = shutdown.clone();
        let sweep_ms = (config.idle_grace_ms / 2).max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(sweep_ms));
            loop {
                tokio::select! {
                    _ = sweep_shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if let Err(e) = sweep_controller.sweep_idle_groups().await {
                    tracing::warn!(error = %e, "Idle group sweep failed");
                }
            }
        });

        let dashboard_state = DashboardState {
            controller: controller.clone(),
            store,
        };
        let listen_addr = config.listen_addr;
        tokio::spawn(async move {
            run_dashboard(listen_addr, dashboard_state).await;
        });

        tracing::info!(
            listen_addr = %listen_addr,
            max_nodes = config.max_cluster_nodes,
            "Scheduler running"
        );

        shutdown.cancelled().await;
        drain(&controller).await;
        Ok(())
    }
}

/// Finish deprovisioning for jobs that still own node groups, directly and
/// without the queue (which stops with the shutdown token).
async fn drain(controller: &JobController) {
    let deadline = tokio::time::Instant::now() + DRAIN_WINDOW;
    loop {
        let pending = match controller.pending_teardowns().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "Drain could not enumerate node groups");
                return;
            }
        };
        if pending.is_empty() {
            tracing::info!("Shutdown drain complete, no node groups left");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::error!(
                jobs = ?pending,
                "Drain window expired with node groups still allocated"
            );
            return;
        }
        for job_id in pending {
            let task = Task::new(job_id, TaskKind::Deprovision);
            if let Err(e) = controller.handle(&task).await {
                tracing::warn!(job_id = %job_id, error = %e, "Drain teardown attempt failed");
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Assemble a server with one backend object serving both cluster roles,
/// the common case for the local and mock drivers.
pub fn with_combined_backend<B>(config: SchedulerConfig, backend: Arc<B>) -> SchedulerServer
where
    B: NodeProvisioner + RunLauncher + 'static,
{
    SchedulerServer::new(config, backend.clone(), backend)
}
