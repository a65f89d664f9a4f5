use chrono::Utc;
use uuid::Uuid;

use replex::error::SchedulerError;
use replex::scheduler::job::{FailureReason, Job, JobSpec, JobStatus};
use replex::store::{JobFilter, JobStore, JobUpdate, MemoryJobStore};

fn spec(name: &str) -> JobSpec {
    JobSpec {
        name: name.to_string(),
        model_ref: "models/test".to_string(),
        replica_count: 2,
        image: "sampler:latest".to_string(),
        resources: Default::default(),
    }
}

#[tokio::test]
async fn put_and_get_roundtrip() {
    let store = MemoryJobStore::new();
    let job = Job::new(spec("roundtrip"));
    let id = job.id;

    store.put(job).await.unwrap();

    let loaded = store.get(id).await.unwrap();
    assert_eq!(loaded.id, id);
    assert_eq!(loaded.spec.name, "roundtrip");
    assert_eq!(loaded.status, JobStatus::Submitted);
    assert!(loaded.node_group.is_none());
}

#[tokio::test]
async fn get_unknown_job_fails() {
    let store = MemoryJobStore::new();
    let err = store.get(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotFound(_)));
}

#[tokio::test]
async fn list_sorts_by_submission_time() {
    let store = MemoryJobStore::new();
    let base = Utc::now();

    // Insert out of order to make the sort observable.
    let second = Job::with_id(Uuid::new_v4(), spec("second"), base + chrono::Duration::seconds(1));
    let first = Job::with_id(Uuid::new_v4(), spec("first"), base);
    store.put(second).await.unwrap();
    store.put(first).await.unwrap();

    let jobs = store.list(JobFilter::default()).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].spec.name, "first");
    assert_eq!(jobs[1].spec.name, "second");
}

#[tokio::test]
async fn list_filters_by_status() {
    let store = MemoryJobStore::new();
    let queued = Job::new(spec("queued"));
    let mut admitted = Job::new(spec("admitted"));
    admitted.status = JobStatus::Admitted;
    store.put(queued).await.unwrap();
    store.put(admitted).await.unwrap();

    let submitted = store
        .list(JobFilter {
            status: Some(JobStatus::Submitted),
        })
        .await
        .unwrap();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].spec.name, "queued");
}

#[tokio::test]
async fn cas_applies_transition_and_fields() {
    let store = MemoryJobStore::new();
    let job = Job::new(spec("cas"));
    let id = job.id;
    store.put(job).await.unwrap();

    let updated = store
        .compare_and_swap_status(
            id,
            JobStatus::Submitted,
            JobStatus::Admitted,
            JobUpdate::default(),
        )
        .await
        .unwrap();
    assert_eq!(updated.status, JobStatus::Admitted);

    let updated = store
        .compare_and_swap_status(
            id,
            JobStatus::Admitted,
            JobStatus::Provisioning,
            JobUpdate::set_group("grp-1".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(updated.node_group.as_deref(), Some("grp-1"));
}

#[tokio::test]
async fn cas_conflict_reports_actual_status() {
    let store = MemoryJobStore::new();
    let job = Job::new(spec("conflict"));
    let id = job.id;
    store.put(job).await.unwrap();

    let err = store
        .compare_and_swap_status(
            id,
            JobStatus::Running,
            JobStatus::Finished,
            JobUpdate::default(),
        )
        .await
        .unwrap_err();

    match err {
        SchedulerError::StatusConflict {
            expected, actual, ..
        } => {
            assert_eq!(expected, JobStatus::Running);
            assert_eq!(actual, JobStatus::Submitted);
        }
        other => panic!("expected StatusConflict, got {}", other),
    }

    // The record is untouched by the failed swap.
    assert_eq!(store.get(id).await.unwrap().status, JobStatus::Submitted);
}

#[tokio::test]
async fn cas_on_unknown_job_fails() {
    let store = MemoryJobStore::new();
    let err = store
        .compare_and_swap_status(
            Uuid::new_v4(),
            JobStatus::Submitted,
            JobStatus::Admitted,
            JobUpdate::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotFound(_)));
}

/// Two concurrent swaps from the same expected status: exactly one wins,
/// the loser sees a conflict. This is the property the whole controller
/// concurrency model rests on.
#[tokio::test]
async fn concurrent_cas_has_exactly_one_winner() {
    let store = std::sync::Arc::new(MemoryJobStore::new());
    let mut job = Job::new(spec("race"));
    job.status = JobStatus::Provisioning;
    let id = job.id;
    store.put(job).await.unwrap();

    let a = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .compare_and_swap_status(
                    id,
                    JobStatus::Provisioning,
                    JobStatus::Running,
                    JobUpdate::default(),
                )
                .await
        })
    };
    let b = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .compare_and_swap_status(
                    id,
                    JobStatus::Provisioning,
                    JobStatus::Stopping,
                    JobUpdate::default(),
                )
                .await
        })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(SchedulerError::StatusConflict { .. })))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 1);
}

#[tokio::test]
async fn failed_update_clears_group_and_stamps_reason() {
    let store = MemoryJobStore::new();
    let mut job = Job::new(spec("failing"));
    job.status = JobStatus::Running;
    job.node_group = Some("grp-9".to_string());
    let id = job.id;
    store.put(job).await.unwrap();

    let updated = store
        .compare_and_swap_status(
            id,
            JobStatus::Running,
            JobStatus::Failed,
            JobUpdate::failed(FailureReason::HeartbeatLost),
        )
        .await
        .unwrap();

    assert_eq!(updated.status, JobStatus::Failed);
    assert_eq!(updated.failure_reason, Some(FailureReason::HeartbeatLost));
    assert!(updated.node_group.is_none());
    assert!(updated.finished_at.is_some());
}

#[tokio::test]
async fn retry_count_bumps_only_when_asked() {
    let store = MemoryJobStore::new();
    let job = Job::new(spec("retries"));
    let id = job.id;
    store.put(job).await.unwrap();

    let updated = store
        .compare_and_swap_status(
            id,
            JobStatus::Submitted,
            JobStatus::Admitted,
            JobUpdate {
                bump_retry: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.retry_count, 1);

    let updated = store
        .compare_and_swap_status(
            id,
            JobStatus::Admitted,
            JobStatus::Submitted,
            JobUpdate::default(),
        )
        .await
        .unwrap();
    assert_eq!(updated.retry_count, 1);
}
