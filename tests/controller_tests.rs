//! State machine tests driving the controller by hand: no background
//! loops, every reconcile pass and task handler call is explicit, so each
//! transition is asserted deterministically.

use std::sync::Arc;

use uuid::Uuid;

use replex::cluster::mock::MockCluster;
use replex::config::{ImageConfig, SchedulerConfig};
use replex::error::SchedulerError;
use replex::scheduler::job::JobSpec;
use replex::scheduler::{FailureReason, JobStatus};
use replex::server::SchedulerServer;
use replex::store::JobStore;
use replex::tasks::{Task, TaskKind};

fn test_config(max_nodes: u32) -> SchedulerConfig {
    let mut config = SchedulerConfig::new("127.0.0.1:0".parse().unwrap(), max_nodes);
    config.provision_timeout_ms = 1_000;
    config.liveness_timeout_ms = 1_000;
    config.idle_grace_ms = 1_000;
    config
}

fn spec(name: &str, replicas: u32) -> JobSpec {
    JobSpec {
        name: name.to_string(),
        model_ref: "models/test".to_string(),
        replica_count: replicas,
        image: "sampler:latest".to_string(),
        resources: Default::default(),
    }
}

/// Unstarted server: the queue stays open (tasks accumulate unprocessed)
/// and the controller is driven directly.
fn fixture(max_nodes: u32, cluster: Arc<MockCluster>) -> SchedulerServer {
    SchedulerServer::new(test_config(max_nodes), cluster.clone(), cluster)
}

async fn run_task(server: &SchedulerServer, job_id: Uuid, kind: TaskKind) {
    server
        .controller
        .handle(&Task::new(job_id, kind))
        .await
        .expect("task handler");
}

// ==================== Submission validation ====================

#[tokio::test]
async fn submit_rejects_zero_replicas() {
    let server = fixture(8, Arc::new(MockCluster::new()));
    let err = server.controller.submit(spec("bad", 0)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidSpec(_)));
}

#[tokio::test]
async fn submit_rejects_unknown_image() {
    let cluster = Arc::new(MockCluster::new());
    let config = test_config(8).with_image(ImageConfig {
        allowed_images: vec!["sampler:v2".to_string()],
        ..Default::default()
    });
    let server = SchedulerServer::new(config, cluster.clone(), cluster);

    let err = server
        .controller
        .submit(spec("bad-image", 2))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidSpec(_)));
}

#[tokio::test]
async fn submit_fills_default_image() {
    let server = fixture(8, Arc::new(MockCluster::new()));
    let mut s = spec("defaulted", 2);
    s.image = String::new();

    let job = server.controller.submit(s).await.unwrap();
    assert_eq!(job.spec.image, "sampler:latest");
    assert_eq!(job.status, JobStatus::Submitted);
}

// ==================== Happy path, step by step ====================

#[tokio::test]
async fn full_lifecycle_transitions_in_order() {
    let cluster = Arc::new(MockCluster::new());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("lifecycle", 4)).await.unwrap();

    // Admission: Submitted -> Admitted, budget granted.
    server.controller.reconcile_job(job.id).await.unwrap();
    assert_eq!(server.store.get(job.id).await.unwrap().status, JobStatus::Admitted);
    assert!(server.autoscaler.has_grant(job.id).await);
    assert_eq!(server.autoscaler.allocated().await, 4);

    // Provision: Admitted -> Provisioning, group recorded on the job.
    run_task(&server, job.id, TaskKind::Provision).await;
    let provisioning = server.store.get(job.id).await.unwrap();
    assert_eq!(provisioning.status, JobStatus::Provisioning);
    assert!(provisioning.node_group.is_some());
    assert!(cluster.has_group(job.id).await);

    // Launch: all four nodes ready (auto-ready mock) -> Running.
    run_task(&server, job.id, TaskKind::LaunchRun).await;
    let running = server.store.get(job.id).await.unwrap();
    assert_eq!(running.status, JobStatus::Running);
    assert!(running.started_at.is_some());

    // Completion observed by polling -> Finished, group cleared.
    cluster.complete_run(job.id).await;
    run_task(&server, job.id, TaskKind::Monitor).await;
    let finished = server.store.get(job.id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Finished);
    assert!(finished.node_group.is_none());
    assert!(finished.finished_at.is_some());
    assert!(finished.failure_reason.is_none());

    // Teardown releases nodes and budget.
    run_task(&server, job.id, TaskKind::Deprovision).await;
    assert_eq!(cluster.live_groups().await, 0);
    assert_eq!(server.autoscaler.allocated().await, 0);
}

#[tokio::test]
async fn running_requires_every_replica_ready() {
    let cluster = Arc::new(MockCluster::manual());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("rendezvous", 4)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    run_task(&server, job.id, TaskKind::Provision).await;

    // No node ready yet: launch must not fire.
    run_task(&server, job.id, TaskKind::LaunchRun).await;
    assert_eq!(server.store.get(job.id).await.unwrap().status, JobStatus::Provisioning);
    assert_eq!(cluster.launch_calls().await, 0);

    // Partially ready: still gated.
    cluster.set_ready_limit(Some(3)).await;
    cluster.make_ready(job.id).await;
    run_task(&server, job.id, TaskKind::LaunchRun).await;
    assert_eq!(server.store.get(job.id).await.unwrap().status, JobStatus::Provisioning);

    // All ranks present: the collective start may proceed.
    cluster.set_ready_limit(None).await;
    cluster.make_ready(job.id).await;
    run_task(&server, job.id, TaskKind::LaunchRun).await;
    assert_eq!(server.store.get(job.id).await.unwrap().status, JobStatus::Running);
}

// ==================== Idempotence ====================

#[tokio::test]
async fn redelivered_provision_is_noop_for_running_job() {
    let cluster = Arc::new(MockCluster::new());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("redeliver", 2)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    run_task(&server, job.id, TaskKind::Provision).await;
    run_task(&server, job.id, TaskKind::LaunchRun).await;
    assert_eq!(server.store.get(job.id).await.unwrap().status, JobStatus::Running);

    // Redeliver Provision after the job moved on: no duplicate group, no
    // status regression.
    run_task(&server, job.id, TaskKind::Provision).await;
    assert_eq!(server.store.get(job.id).await.unwrap().status, JobStatus::Running);
    assert_eq!(cluster.groups_created().await, 1);
    assert_eq!(cluster.live_groups().await, 1);
}

#[tokio::test]
async fn provision_redelivery_during_provisioning_reuses_group() {
    let cluster = Arc::new(MockCluster::manual());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("reuse", 2)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    run_task(&server, job.id, TaskKind::Provision).await;
    run_task(&server, job.id, TaskKind::Provision).await;
    run_task(&server, job.id, TaskKind::Provision).await;

    assert_eq!(cluster.groups_created().await, 1);
    assert_eq!(cluster.peak_live_groups().await, 1);
}

#[tokio::test]
async fn stop_twice_settles_once() {
    let cluster = Arc::new(MockCluster::new());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("stop-twice", 2)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    run_task(&server, job.id, TaskKind::Provision).await;
    run_task(&server, job.id, TaskKind::LaunchRun).await;

    let first = server.controller.request_stop(job.id).await.unwrap();
    assert_eq!(first.status, JobStatus::Stopping);
    let second = server.controller.request_stop(job.id).await.unwrap();
    assert_eq!(second.status, JobStatus::Stopping);

    run_task(&server, job.id, TaskKind::Deprovision).await;
    let stopped = server.store.get(job.id).await.unwrap();
    assert_eq!(stopped.status, JobStatus::Stopped);
    assert!(stopped.node_group.is_none());

    // Stop after terminal is a no-op returning the settled record.
    let third = server.controller.request_stop(job.id).await.unwrap();
    assert_eq!(third.status, JobStatus::Stopped);
    assert_eq!(cluster.live_groups().await, 0);
}

#[tokio::test]
async fn deprovision_redelivery_is_trivial() {
    let cluster = Arc::new(MockCluster::new());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("dedeprovision", 2)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    run_task(&server, job.id, TaskKind::Provision).await;
    server.controller.request_stop(job.id).await.unwrap();

    run_task(&server, job.id, TaskKind::Deprovision).await;
    run_task(&server, job.id, TaskKind::Deprovision).await;

    assert_eq!(server.store.get(job.id).await.unwrap().status, JobStatus::Stopped);
    assert_eq!(server.autoscaler.allocated().await, 0);
}

// ==================== Stop semantics per state ====================

#[tokio::test]
async fn stop_of_queued_job_skips_teardown() {
    let server = fixture(8, Arc::new(MockCluster::new()));
    let job = server.controller.submit(spec("queued-stop", 2)).await.unwrap();

    let stopped = server.controller.request_stop(job.id).await.unwrap();
    assert_eq!(stopped.status, JobStatus::Stopped);
    assert!(stopped.finished_at.is_some());
}

#[tokio::test]
async fn stop_of_admitted_job_returns_grant() {
    let server = fixture(8, Arc::new(MockCluster::new()));
    let job = server.controller.submit(spec("admitted-stop", 4)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    assert_eq!(server.autoscaler.allocated().await, 4);

    let stopped = server.controller.request_stop(job.id).await.unwrap();
    assert_eq!(stopped.status, JobStatus::Stopped);
    assert_eq!(server.autoscaler.allocated().await, 0);
}

#[tokio::test]
async fn stop_unknown_job_fails_not_found() {
    let server = fixture(8, Arc::new(MockCluster::new()));
    let err = server.controller.request_stop(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotFound(_)));
}

// ==================== Failure paths ====================

#[tokio::test]
async fn provision_timeout_fails_job_and_tears_down() {
    let cluster = Arc::new(MockCluster::manual());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("slow-nodes", 4)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    run_task(&server, job.id, TaskKind::Provision).await;

    // Only 3 of 4 become ready, and the readiness bound passes.
    cluster.set_ready_limit(Some(3)).await;
    cluster.make_ready(job.id).await;
    cluster.backdate_group(job.id, 2_000).await;
    server.controller.reconcile_job(job.id).await.unwrap();

    let failed = server.store.get(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::ProvisionTimeout));
    assert!(failed.node_group.is_none());

    // The automatic teardown leaves zero nodes allocated.
    run_task(&server, job.id, TaskKind::Deprovision).await;
    assert_eq!(cluster.live_groups().await, 0);
    assert_eq!(server.autoscaler.allocated().await, 0);
}

#[tokio::test]
async fn degraded_group_fails_job() {
    let cluster = Arc::new(MockCluster::manual());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("degraded", 4)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    run_task(&server, job.id, TaskKind::Provision).await;
    cluster.degrade_group(job.id).await;
    server.controller.reconcile_job(job.id).await.unwrap();

    let failed = server.store.get(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::ProvisionExhausted));
}

#[tokio::test]
async fn run_failure_is_reported_not_retried() {
    let cluster = Arc::new(MockCluster::new());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("crashing", 2)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    run_task(&server, job.id, TaskKind::Provision).await;
    run_task(&server, job.id, TaskKind::LaunchRun).await;

    cluster.fail_run(job.id, 9).await;
    run_task(&server, job.id, TaskKind::Monitor).await;

    let failed = server.store.get(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::RunFailed));

    // No new group appears afterward: a failed run is never relaunched.
    server.controller.reconcile_job(job.id).await.unwrap();
    assert_eq!(cluster.groups_created().await, 1);
}

#[tokio::test]
async fn stale_heartbeat_fails_with_heartbeat_lost() {
    let cluster = Arc::new(MockCluster::new());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("partitioned", 2)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    run_task(&server, job.id, TaskKind::Provision).await;
    run_task(&server, job.id, TaskKind::LaunchRun).await;

    cluster.silence_heartbeats(job.id).await;
    cluster.backdate_heartbeat(job.id, 5_000).await;
    run_task(&server, job.id, TaskKind::Monitor).await;

    let failed = server.store.get(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::HeartbeatLost));
}

#[tokio::test]
async fn fresh_heartbeat_keeps_job_running() {
    let cluster = Arc::new(MockCluster::new());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("healthy", 2)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    run_task(&server, job.id, TaskKind::Provision).await;
    run_task(&server, job.id, TaskKind::LaunchRun).await;

    run_task(&server, job.id, TaskKind::Monitor).await;
    run_task(&server, job.id, TaskKind::Monitor).await;
    assert_eq!(server.store.get(job.id).await.unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn unreachable_group_fails_after_liveness_timeout() {
    let cluster = Arc::new(MockCluster::new());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("unreachable", 2)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    run_task(&server, job.id, TaskKind::Provision).await;
    run_task(&server, job.id, TaskKind::LaunchRun).await;

    // Recently unreachable: tolerated.
    cluster.make_unreachable(job.id, 10).await;
    run_task(&server, job.id, TaskKind::Monitor).await;
    assert_eq!(server.store.get(job.id).await.unwrap().status, JobStatus::Running);

    // Beyond the liveness bound: node-or-partition failure.
    cluster.make_unreachable(job.id, 5_000).await;
    run_task(&server, job.id, TaskKind::Monitor).await;
    let failed = server.store.get(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::HeartbeatLost));
}

#[tokio::test]
async fn exhausted_provision_surfaces_as_job_failure() {
    let cluster = Arc::new(MockCluster::new());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("exhausted", 2)).await.unwrap();
    server.controller.reconcile_job(job.id).await.unwrap();

    let task = Task::new(job.id, TaskKind::Provision);
    let err = SchedulerError::Provision("cloud said no".to_string());
    server.controller.task_exhausted(&task, &err).await;

    let failed = server.store.get(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::ProvisionExhausted));
}

#[tokio::test]
async fn exhausted_deprovision_marks_leak() {
    let cluster = Arc::new(MockCluster::new());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("leaky", 2)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    run_task(&server, job.id, TaskKind::Provision).await;
    server.controller.request_stop(job.id).await.unwrap();

    let task = Task::new(job.id, TaskKind::Deprovision);
    let err = SchedulerError::Provision("api down".to_string());
    server.controller.task_exhausted(&task, &err).await;

    let failed = server.store.get(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::DeprovisionExhausted));
}

// ==================== Concurrency ====================

/// Two passes race the Provisioning -> Running transition; exactly one CAS
/// wins and the loser is a silent no-op.
#[tokio::test]
async fn concurrent_launch_passes_produce_one_transition() {
    let cluster = Arc::new(MockCluster::new());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("race", 4)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    run_task(&server, job.id, TaskKind::Provision).await;

    let c1 = server.controller.clone();
    let c2 = server.controller.clone();
    let id = job.id;
    let t1 = Task::new(id, TaskKind::LaunchRun);
    let t2 = Task::new(id, TaskKind::LaunchRun);
    let (a, b) = tokio::join!(c1.handle(&t1), c2.handle(&t2),);
    a.unwrap();
    b.unwrap();

    let running = server.store.get(job.id).await.unwrap();
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(cluster.groups_created().await, 1);
}

#[tokio::test]
async fn reconcile_is_reentrant_per_job() {
    let cluster = Arc::new(MockCluster::manual());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("reentrant", 2)).await.unwrap();

    let c1 = server.controller.clone();
    let c2 = server.controller.clone();
    let id = job.id;
    let (a, b) = tokio::join!(c1.reconcile_job(id), c2.reconcile_job(id));
    a.unwrap();
    b.unwrap();

    // Both passes agree on one admission and one grant.
    assert_eq!(server.store.get(id).await.unwrap().status, JobStatus::Admitted);
    assert_eq!(server.autoscaler.allocated().await, 2);
}

// ==================== Restart recovery ====================

/// A new scheduler over the old store and cluster picks supervision back
/// up: grants are rebuilt and a run that finished during the outage is
/// observed on the next monitor poll.
#[tokio::test]
async fn restart_rebuilds_grants_and_resumes_supervision() {
    let cluster = Arc::new(MockCluster::new());
    let first = fixture(8, cluster.clone());
    let job = first.controller.submit(spec("survivor", 3)).await.unwrap();

    first.controller.reconcile_job(job.id).await.unwrap();
    run_task(&first, job.id, TaskKind::Provision).await;
    run_task(&first, job.id, TaskKind::LaunchRun).await;
    assert_eq!(first.store.get(job.id).await.unwrap().status, JobStatus::Running);

    // "Restart": a fresh server over the same store and cluster.
    let second = SchedulerServer::with_store(
        test_config(8),
        first.store.clone(),
        cluster.clone(),
        cluster.clone(),
    );
    second.controller.restore_admissions().await.unwrap();
    assert_eq!(second.autoscaler.allocated().await, 3);

    // The run completed while no scheduler was watching.
    cluster.complete_run(job.id).await;
    second
        .controller
        .handle(&Task::new(job.id, TaskKind::Monitor))
        .await
        .unwrap();
    assert_eq!(second.store.get(job.id).await.unwrap().status, JobStatus::Finished);

    second
        .controller
        .handle(&Task::new(job.id, TaskKind::Deprovision))
        .await
        .unwrap();
    assert_eq!(cluster.live_groups().await, 0);
    assert_eq!(second.autoscaler.allocated().await, 0);
}

// ==================== Teardown bookkeeping ====================

#[tokio::test]
async fn pending_teardowns_lists_owed_groups() {
    let cluster = Arc::new(MockCluster::new());
    let server = fixture(8, cluster.clone());
    let job = server.controller.submit(spec("owed", 2)).await.unwrap();

    server.controller.reconcile_job(job.id).await.unwrap();
    run_task(&server, job.id, TaskKind::Provision).await;
    assert!(server.controller.pending_teardowns().await.unwrap().is_empty());

    server.controller.request_stop(job.id).await.unwrap();
    assert_eq!(server.controller.pending_teardowns().await.unwrap(), vec![job.id]);

    run_task(&server, job.id, TaskKind::Deprovision).await;
    assert!(server.controller.pending_teardowns().await.unwrap().is_empty());
}
