//! REST control surface consumed by the dashboard and the CLI.
//!
//! Thin glue: handlers validate nothing beyond shape, the controller owns
//! all lifecycle decisions. Spec errors map to 400, unknown ids to 404,
//! start on a terminal job to 409.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::scheduler::job::{Job, JobSpec, ResourceRequest};
use crate::scheduler::JobController;
use crate::store::{JobFilter, JobStore};

#[derive(Clone)]
pub struct DashboardState {
    pub controller: Arc<JobController>,
    pub store: Arc<dyn JobStore>,
}

#[derive(Serialize)]
struct JobSummary {
    id: String,
    name: String,
    status: String,
    created_at_ms: i64,
    started_at_ms: Option<i64>,
    finished_at_ms: Option<i64>,
}

impl JobSummary {
    fn from_job(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            name: job.spec.name.clone(),
            status: job.status.to_string(),
            created_at_ms: job.created_at.timestamp_millis(),
            started_at_ms: job.started_at.map(|t| t.timestamp_millis()),
            finished_at_ms: job.finished_at.map(|t| t.timestamp_millis()),
        }
    }
}

#[derive(Serialize)]
struct JobDetail {
    id: String,
    name: String,
    model_ref: String,
    replica_count: u32,
    image: String,
    status: String,
    node_group: Option<String>,
    failure_reason: Option<String>,
    retry_count: u32,
    created_at_ms: i64,
    started_at_ms: Option<i64>,
    finished_at_ms: Option<i64>,
}

impl JobDetail {
    fn from_job(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            name: job.spec.name.clone(),
            model_ref: job.spec.model_ref.clone(),
            replica_count: job.spec.replica_count,
            image: job.spec.image.clone(),
            status: job.status.to_string(),
            node_group: job.node_group.clone(),
            failure_reason: job.failure_reason.map(|r| r.to_string()),
            retry_count: job.retry_count,
            created_at_ms: job.created_at.timestamp_millis(),
            started_at_ms: job.started_at.map(|t| t.timestamp_millis()),
            finished_at_ms: job.finished_at.map(|t| t.timestamp_millis()),
        }
    }
}

#[derive(Deserialize)]
pub struct SubmitJobRequest {
    pub name: String,
    pub model_ref: String,
    pub replica_count: u32,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub resources: Option<ResourceRequest>,
}

#[derive(Serialize)]
struct SubmitJobResponse {
    id: String,
}

#[derive(Serialize)]
struct JobActionResponse {
    id: String,
    status: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

fn error_response(e: &SchedulerError) -> (StatusCode, Json<ErrorResponse>) {
    let (code, tag) = match e {
        SchedulerError::InvalidSpec(_) => (StatusCode::BAD_REQUEST, "invalid_spec"),
        SchedulerError::JobNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    (
        code,
        Json(ErrorResponse {
            error: tag,
            message: e.to_string(),
        }),
    )
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/jobs", get(list_jobs_handler))
        .route("/job", post(submit_job_handler))
        .route("/job/:id", get(get_job_handler))
        .route("/job/:id/start", post(start_job_handler))
        .route("/job/:id/stop", post(stop_job_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "API server failed");
    }
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.store.list(JobFilter::default()).await {
        Ok(jobs) => {
            let summaries: Vec<JobSummary> = jobs.iter().map(JobSummary::from_job).collect();
            Json(summaries).into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitJobRequest>,
) -> impl IntoResponse {
    let spec = JobSpec {
        name: payload.name,
        model_ref: payload.model_ref,
        replica_count: payload.replica_count,
        image: payload.image,
        resources: payload.resources.unwrap_or_default(),
    };

    match state.controller.submit(spec).await {
        Ok(job) => (
            StatusCode::OK,
            Json(SubmitJobResponse {
                id: job.id.to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn get_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.store.get(id).await {
        Ok(job) => Json(JobDetail::from_job(&job)).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn start_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.controller.start(id).await {
        Ok(job) if job.status.is_terminal() => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "conflict",
                message: format!("job is {}; submit a new job to run again", job.status),
            }),
        )
            .into_response(),
        Ok(job) => Json(JobActionResponse {
            id: job.id.to_string(),
            status: job.status.to_string(),
        })
        .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn stop_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.controller.request_stop(id).await {
        Ok(job) => Json(JobActionResponse {
            id: job.id.to_string(),
            status: job.status.to_string(),
        })
        .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}
