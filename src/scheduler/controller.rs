//! The reconciliation state machine.
//!
//! For every job the controller compares desired state (the Job Store
//! record) with observed cluster state (provisioner/launcher) and emits at
//! most one corrective task per pass. Reconciliation is level-triggered and
//! re-entrant: running two passes for the same job concurrently is safe
//! because every transition goes through compare-and-swap on the status and
//! exactly one writer wins. Lost or redelivered tasks are harmless for the
//! same reason.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::cluster::{NodeGroupState, NodeProvisioner, RunHealth, RunLauncher};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::metrics::MetricsSink;
use crate::scheduler::admission::Autoscaler;
use crate::scheduler::job::{FailureReason, Job, JobSpec, JobStatus};
use crate::store::{JobFilter, JobStore, JobUpdate};
use crate::tasks::{Task, TaskKind, TaskQueue};

pub struct JobController {
    store: Arc<dyn JobStore>,
    provisioner: Arc<dyn NodeProvisioner>,
    launcher: Arc<dyn RunLauncher>,
    autoscaler: Arc<Autoscaler>,
    queue: TaskQueue,
    metrics: MetricsSink,
    config: SchedulerConfig,
}

impl JobController {
    pub fn new(
        store: Arc<dyn JobStore>,
        provisioner: Arc<dyn NodeProvisioner>,
        launcher: Arc<dyn RunLauncher>,
        autoscaler: Arc<Autoscaler>,
        queue: TaskQueue,
        metrics: MetricsSink,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            provisioner,
            launcher,
            autoscaler,
            queue,
            metrics,
            config,
        }
    }

    // ------------------------------------------------------------------
    // API-facing operations
    // ------------------------------------------------------------------

    /// Validate and record a new job. The job starts queued; admission picks
    /// it up on the next capacity evaluation.
    pub async fn submit(&self, mut spec: JobSpec) -> Result<Job> {
        if spec.replica_count == 0 {
            return Err(SchedulerError::InvalidSpec(
                "replica count must be positive".to_string(),
            ));
        }
        if spec.name.is_empty() {
            return Err(SchedulerError::InvalidSpec(
                "job name must not be empty".to_string(),
            ));
        }
        if spec.image.is_empty() {
            spec.image = self.config.image.default_image.clone();
        }
        if !self.config.image.is_allowed(&spec.image) {
            return Err(SchedulerError::InvalidSpec(format!(
                "unknown image reference: {}",
                spec.image
            )));
        }

        let job = Job::new(spec);
        self.store.put(job.clone()).await?;
        self.metrics.status_change(&job.spec.name, "submitted");
        tracing::info!(
            job_id = %job.id,
            name = %job.spec.name,
            replicas = job.spec.replica_count,
            image = %job.spec.image,
            "Job submitted"
        );
        self.autoscaler.notify_capacity_change();
        Ok(job)
    }

    /// Explicit start request. Queued jobs get an immediate admission
    /// evaluation; jobs already provisioning or running are a no-op. The
    /// caller decides how to surface terminal jobs (rerunning a finished
    /// job is a resubmission, never an in-place restart).
    pub async fn start(&self, job_id: Uuid) -> Result<Job> {
        let job = self.store.get(job_id).await?;
        if job.status == JobStatus::Submitted {
            self.autoscaler.notify_capacity_change();
        }
        Ok(job)
    }

    /// Stop a job. Effective immediately at the controller level; teardown
    /// of any allocated nodes runs unconditionally to completion afterward.
    /// Idempotent: stopping a terminal or already-stopping job is a no-op.
    pub async fn request_stop(&self, job_id: Uuid) -> Result<Job> {
        loop {
            let job = self.store.get(job_id).await?;
            match job.status {
                JobStatus::Finished | JobStatus::Stopped | JobStatus::Failed => return Ok(job),
                JobStatus::Stopping => return Ok(job),
                JobStatus::Submitted => {
                    match self
                        .store
                        .compare_and_swap_status(
                            job_id,
                            JobStatus::Submitted,
                            JobStatus::Stopped,
                            JobUpdate::finished(),
                        )
                        .await
                    {
                        Ok(updated) => {
                            self.metrics.status_change(&updated.spec.name, "stopped");
                            tracing::info!(job_id = %job_id, "Queued job stopped");
                            return Ok(updated);
                        }
                        Err(SchedulerError::StatusConflict { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                JobStatus::Admitted => {
                    match self
                        .store
                        .compare_and_swap_status(
                            job_id,
                            JobStatus::Admitted,
                            JobStatus::Stopped,
                            JobUpdate::finished(),
                        )
                        .await
                    {
                        Ok(updated) => {
                            self.autoscaler.release(job_id).await;
                            self.metrics.status_change(&updated.spec.name, "stopped");
                            tracing::info!(job_id = %job_id, "Admitted job stopped before provisioning");
                            // A provision task may already be in flight; its
                            // group, if any, is cleaned by the next line.
                            self.queue.enqueue(Task::new(job_id, TaskKind::Deprovision)).await;
                            return Ok(updated);
                        }
                        Err(SchedulerError::StatusConflict { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                JobStatus::Provisioning | JobStatus::Running => {
                    match self
                        .store
                        .compare_and_swap_status(
                            job_id,
                            job.status,
                            JobStatus::Stopping,
                            JobUpdate::default(),
                        )
                        .await
                    {
                        Ok(updated) => {
                            self.metrics.status_change(&updated.spec.name, "stopping");
                            tracing::info!(job_id = %job_id, "Stop requested, tearing down node group");
                            self.queue.enqueue(Task::new(job_id, TaskKind::Deprovision)).await;
                            return Ok(updated);
                        }
                        Err(SchedulerError::StatusConflict { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Rebuild in-memory admission grants from the store after a restart.
    /// Every job that was granted capacity (admitted or holding nodes)
    /// re-registers its grant, so the budget is a cache, not a second
    /// source of truth.
    pub async fn restore_admissions(&self) -> Result<()> {
        for job in self.store.list(JobFilter::default()).await? {
            if job.status == JobStatus::Admitted || job.status.holds_nodes() {
                let granted = self
                    .autoscaler
                    .try_admit(job.id, job.spec.replica_count)
                    .await;
                if !granted {
                    tracing::warn!(
                        job_id = %job.id,
                        nodes = job.spec.replica_count,
                        "Budget shrank across restart; job proceeds over budget"
                    );
                }
            }
        }
        Ok(())
    }

    /// One level-triggered sweep over all jobs. Admission runs oldest-first
    /// and stops at the first denial, so grants follow submission order
    /// (strict FCFS, no capacity jumping).
    pub async fn reconcile_pass(&self) {
        let jobs = match self.store.list(JobFilter::default()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list jobs for reconciliation");
                return;
            }
        };

        let mut admission_blocked = false;
        for job in jobs {
            if job.status.is_terminal() {
                continue;
            }
            if job.status == JobStatus::Submitted {
                if admission_blocked {
                    continue;
                }
                match self.try_admit_job(&job).await {
                    Ok(granted) => admission_blocked = !granted,
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "Admission evaluation failed")
                    }
                }
                continue;
            }
            if let Err(e) = self.reconcile_job(job.id).await {
                tracing::warn!(job_id = %job.id, error = %e, "Reconciliation error");
            }
        }
    }

    /// Reconcile a single job: emit the one task its current state calls
    /// for. Safe to call concurrently for the same job.
    pub async fn reconcile_job(&self, job_id: Uuid) -> Result<()> {
        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(SchedulerError::JobNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        match job.status {
            JobStatus::Submitted => {
                self.try_admit_job(&job).await?;
            }
            JobStatus::Admitted => {
                self.queue.enqueue(Task::new(job.id, TaskKind::Provision)).await;
            }
            JobStatus::Provisioning => self.check_provisioning(&job).await?,
            JobStatus::Running => {
                self.queue.enqueue(Task::new(job.id, TaskKind::Monitor)).await;
            }
            JobStatus::Stopping => {
                self.queue.enqueue(Task::new(job.id, TaskKind::Deprovision)).await;
            }
            JobStatus::Finished | JobStatus::Stopped | JobStatus::Failed => {}
        }
        Ok(())
    }

    /// Returns whether the budget grant succeeded (admission may leave the
    /// job queued without error).
    async fn try_admit_job(&self, job: &Job) -> Result<bool> {
        if !self
            .autoscaler
            .try_admit(job.id, job.spec.replica_count)
            .await
        {
            return Ok(false);
        }

        match self
            .store
            .compare_and_swap_status(
                job.id,
                JobStatus::Submitted,
                JobStatus::Admitted,
                JobUpdate::default(),
            )
            .await
        {
            Ok(updated) => {
                self.metrics.status_change(&updated.spec.name, "admitted");
                tracing::info!(job_id = %job.id, nodes = job.spec.replica_count, "Job admitted");
                self.queue.enqueue(Task::new(job.id, TaskKind::Provision)).await;
                Ok(true)
            }
            Err(SchedulerError::StatusConflict { .. }) => {
                // Lost to a concurrent stop; don't strand the grant.
                let current = self.store.get(job.id).await?;
                if current.status.is_terminal() {
                    self.autoscaler.release(job.id).await;
                }
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn check_provisioning(&self, job: &Job) -> Result<()> {
        let Some(handle) = self.provisioner.find_group(job.id).await? else {
            // The provision task was lost or has not run yet; re-emitting is
            // a no-op if a group appears in the meantime.
            self.queue.enqueue(Task::new(job.id, TaskKind::Provision)).await;
            return Ok(());
        };

        let status = self.provisioner.describe(&handle).await?;
        self.metrics
            .emit(&job.spec.name, "ready_nodes", status.ready_count() as f64);

        if status.is_fully_ready() {
            self.queue.enqueue(Task::new(job.id, TaskKind::LaunchRun)).await;
            return Ok(());
        }

        if status.state == NodeGroupState::Degraded {
            tracing::warn!(
                job_id = %job.id,
                group = %handle.name,
                ready = status.ready_count(),
                desired = status.desired_size,
                "Node group degraded beyond its replacement budget"
            );
            self.fail_job(job.id, FailureReason::ProvisionExhausted).await?;
            return Ok(());
        }

        let timeout = chrono::Duration::milliseconds(self.config.provision_timeout_ms as i64);
        if Utc::now() - status.created_at > timeout {
            tracing::warn!(
                job_id = %job.id,
                group = %handle.name,
                ready = status.ready_count(),
                desired = status.desired_size,
                "Provisioning timed out before full readiness"
            );
            self.fail_job(job.id, FailureReason::ProvisionTimeout).await?;
        }
        Ok(())
    }

    /// Jobs that are owed a teardown: their group still exists but their
    /// status is stopping, terminal, or unknown. Used by the shutdown drain.
    pub async fn pending_teardowns(&self) -> Result<Vec<Uuid>> {
        let mut pending = Vec::new();
        for handle in self.provisioner.list_groups().await? {
            match self.store.get(handle.job_id).await {
                Ok(job) if job.status == JobStatus::Stopping || job.status.is_terminal() => {
                    pending.push(handle.job_id);
                }
                Ok(_) => {}
                Err(SchedulerError::JobNotFound(_)) => pending.push(handle.job_id),
                Err(e) => return Err(e),
            }
        }
        Ok(pending)
    }

    /// Reclaim groups whose owning job is terminal or unknown, past the
    /// grace period: budget comes back without waiting for job timeouts.
    pub async fn sweep_idle_groups(&self) -> Result<()> {
        let grace = chrono::Duration::milliseconds(self.config.idle_grace_ms as i64);

        for handle in self.provisioner.list_groups().await? {
            let active = match self.store.get(handle.job_id).await {
                Ok(job) => job.status.holds_nodes() || job.status == JobStatus::Admitted,
                Err(SchedulerError::JobNotFound(_)) => false,
                Err(e) => return Err(e),
            };
            if active {
                continue;
            }

            let status = match self.provisioner.describe(&handle).await {
                Ok(status) => status,
                Err(SchedulerError::GroupNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if Utc::now() - status.created_at > grace {
                tracing::warn!(
                    job_id = %handle.job_id,
                    group = %handle.name,
                    "Reclaiming idle node group"
                );
                self.queue
                    .enqueue(Task::new(handle.job_id, TaskKind::Deprovision))
                    .await;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Task handlers (at-least-once, idempotent)
    // ------------------------------------------------------------------

    pub async fn handle(&self, task: &Task) -> Result<()> {
        match task.kind {
            TaskKind::Provision => self.handle_provision(task.job_id).await,
            TaskKind::LaunchRun => self.handle_launch(task.job_id).await,
            TaskKind::Monitor => self.handle_monitor(task.job_id).await,
            TaskKind::Deprovision => self.handle_deprovision(task.job_id).await,
        }
    }

    /// Called by the worker pool once a task has burned its retry budget.
    /// This is the only path from a transient infrastructure fault to a
    /// terminal job status.
    pub async fn task_exhausted(&self, task: &Task, error: &SchedulerError) {
        let reason = match task.kind {
            TaskKind::Provision | TaskKind::LaunchRun => FailureReason::ProvisionExhausted,
            TaskKind::Monitor => FailureReason::HeartbeatLost,
            TaskKind::Deprovision => FailureReason::DeprovisionExhausted,
        };
        tracing::error!(
            job_id = %task.job_id,
            kind = %task.kind,
            error = %error,
            reason = %reason,
            "Task exhausted its retry budget"
        );
        if reason == FailureReason::DeprovisionExhausted {
            tracing::error!(
                job_id = %task.job_id,
                "Teardown kept failing; nodes may be leaked and need operator cleanup"
            );
        }
        if let Err(e) = self.fail_job(task.job_id, reason).await {
            tracing::error!(job_id = %task.job_id, error = %e, "Failed to record job failure");
        }
    }

    async fn handle_provision(&self, job_id: Uuid) -> Result<()> {
        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(SchedulerError::JobNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if !matches!(job.status, JobStatus::Admitted | JobStatus::Provisioning) {
            return Ok(());
        }

        // The driver enforces at-most-one-live-group: a redelivered task
        // gets the existing group back.
        let handle = self.provisioner.provision(job_id, &job.spec).await?;

        if job.status == JobStatus::Admitted {
            match self
                .store
                .compare_and_swap_status(
                    job_id,
                    JobStatus::Admitted,
                    JobStatus::Provisioning,
                    JobUpdate::set_group(handle.name.clone()),
                )
                .await
            {
                Ok(updated) => {
                    self.metrics.status_change(&updated.spec.name, "provisioning");
                    tracing::info!(
                        job_id = %job_id,
                        group = %handle.name,
                        nodes = job.spec.replica_count,
                        "Node group provisioning started"
                    );
                }
                Err(SchedulerError::StatusConflict { .. }) => {
                    // A concurrent stop won the race; the fresh group must
                    // not leak.
                    let current = self.store.get(job_id).await?;
                    if current.status == JobStatus::Stopping || current.status.is_terminal() {
                        self.queue.enqueue(Task::new(job_id, TaskKind::Deprovision)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        } else if job.node_group.as_deref() != Some(handle.name.as_str()) {
            // The group was recreated after a loss; refresh the reference.
            // A conflict means the job moved on, which supersedes this.
            match self
                .store
                .compare_and_swap_status(
                    job_id,
                    JobStatus::Provisioning,
                    JobStatus::Provisioning,
                    JobUpdate::set_group(handle.name.clone()),
                )
                .await
            {
                Ok(_) | Err(SchedulerError::StatusConflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn handle_launch(&self, job_id: Uuid) -> Result<()> {
        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(SchedulerError::JobNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if job.status != JobStatus::Provisioning {
            return Ok(());
        }

        let Some(handle) = self.provisioner.find_group(job_id).await? else {
            return Ok(());
        };

        // Re-check the rendezvous gate at launch time: the group must have
        // every rank ready the moment we start.
        let status = self.provisioner.describe(&handle).await?;
        if !status.is_fully_ready() {
            return Ok(());
        }

        self.launcher.launch(&handle).await?;

        match self
            .store
            .compare_and_swap_status(
                job_id,
                JobStatus::Provisioning,
                JobStatus::Running,
                JobUpdate {
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(updated) => {
                self.metrics.status_change(&updated.spec.name, "running");
                tracing::info!(
                    job_id = %job_id,
                    group = %handle.name,
                    ranks = status.desired_size,
                    "Sampling run started across all ranks"
                );
            }
            // Exactly one concurrent pass wins this transition.
            Err(SchedulerError::StatusConflict { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn handle_monitor(&self, job_id: Uuid) -> Result<()> {
        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(SchedulerError::JobNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if job.status != JobStatus::Running {
            return Ok(());
        }

        let Some(handle) = self.provisioner.find_group(job_id).await? else {
            tracing::warn!(job_id = %job_id, "Node group vanished under a running job");
            self.fail_job(job_id, FailureReason::HeartbeatLost).await?;
            return Ok(());
        };

        let liveness = chrono::Duration::milliseconds(self.config.liveness_timeout_ms as i64);
        match self.launcher.probe(&handle).await? {
            RunHealth::Serving { last_heartbeat } => {
                let age = Utc::now() - last_heartbeat;
                if age > liveness {
                    tracing::warn!(
                        job_id = %job_id,
                        heartbeat_age_ms = age.num_milliseconds(),
                        "Heartbeat overdue"
                    );
                    self.fail_job(job_id, FailureReason::HeartbeatLost).await?;
                }
            }
            RunHealth::Succeeded => {
                match self
                    .store
                    .compare_and_swap_status(
                        job_id,
                        JobStatus::Running,
                        JobStatus::Finished,
                        JobUpdate::finished(),
                    )
                    .await
                {
                    Ok(updated) => {
                        self.metrics.status_change(&updated.spec.name, "finished");
                        tracing::info!(job_id = %job_id, "Sampling run finished");
                        self.queue.enqueue(Task::new(job_id, TaskKind::Deprovision)).await;
                    }
                    Err(SchedulerError::StatusConflict { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            RunHealth::Failed { exit_code } => {
                tracing::warn!(job_id = %job_id, exit_code = ?exit_code, "Run reported failure");
                self.fail_job(job_id, FailureReason::RunFailed).await?;
            }
            RunHealth::Unreachable { since } => {
                if Utc::now() - since > liveness {
                    tracing::warn!(job_id = %job_id, "No rank reachable beyond liveness timeout");
                    self.fail_job(job_id, FailureReason::HeartbeatLost).await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_deprovision(&self, job_id: Uuid) -> Result<()> {
        if let Some(handle) = self.provisioner.find_group(job_id).await? {
            self.provisioner.deprovision(&handle).await?;
            tracing::info!(job_id = %job_id, group = %handle.name, "Node group deprovisioned");
        }

        self.autoscaler.release(job_id).await;

        match self.store.get(job_id).await {
            Ok(job) if job.status == JobStatus::Stopping => {
                match self
                    .store
                    .compare_and_swap_status(
                        job_id,
                        JobStatus::Stopping,
                        JobStatus::Stopped,
                        JobUpdate::finished(),
                    )
                    .await
                {
                    Ok(updated) => {
                        self.metrics.status_change(&updated.spec.name, "stopped");
                        tracing::info!(job_id = %job_id, "Job stopped");
                    }
                    Err(SchedulerError::StatusConflict { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(_) => {}
            // Orphan cleanup from the idle sweep.
            Err(SchedulerError::JobNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Move any non-terminal job to `Failed` with `reason`, re-reading on
    /// CAS conflicts. Teardown of remaining nodes is enqueued automatically
    /// unless teardown itself is what failed.
    async fn fail_job(&self, job_id: Uuid, reason: FailureReason) -> Result<bool> {
        loop {
            let job = match self.store.get(job_id).await {
                Ok(job) => job,
                Err(SchedulerError::JobNotFound(_)) => return Ok(false),
                Err(e) => return Err(e),
            };
            if job.status.is_terminal() {
                return Ok(false);
            }

            match self
                .store
                .compare_and_swap_status(
                    job_id,
                    job.status,
                    JobStatus::Failed,
                    JobUpdate::failed(reason),
                )
                .await
            {
                Ok(updated) => {
                    self.metrics.status_change(&updated.spec.name, "failed");
                    self.metrics
                        .emit(&updated.spec.name, &format!("failure.{}", reason), 1.0);
                    tracing::warn!(job_id = %job_id, reason = %reason, "Job failed");
                    if reason != FailureReason::DeprovisionExhausted {
                        self.queue.enqueue(Task::new(job_id, TaskKind::Deprovision)).await;
                    }
                    return Ok(true);
                }
                Err(SchedulerError::StatusConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
