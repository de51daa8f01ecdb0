//! API route definitions.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::model::{Region, TriggerSource};
use crate::queue::{EnqueueOptions, JobKind, JobPayload, JobState, QueueName, RunTestPayload};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/queues", get(list_queues))
        .route("/queues/{name}", get(queue_detail))
        .route("/queues/{name}/pause", post(pause_queue))
        .route("/queues/{name}/resume", post(resume_queue))
        .route("/queues/{name}/purge", post(purge_queue))
        .route("/queues/{name}/jobs", get(list_jobs).post(enqueue_job))
        .route("/queues/{name}/jobs/{id}", get(get_job).delete(remove_job))
        .route("/tests/{id}/run", post(run_test))
        .route("/executions/{id}", get(get_execution))
        .route("/scheduler/tasks", get(scheduler_tasks))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn queue_name(raw: &str) -> ApiResult<QueueName> {
    raw.parse::<QueueName>().map_err(ApiError::from)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "queues": state.queues.all_stats().await,
            "connections": state.notifier.connection_count().await,
        },
        "meta": meta()
    }))
}

async fn list_queues(State(state): State<AppState>) -> Json<Value> {
    let stats = state.queues.all_stats().await;
    Json(json!({ "data": stats, "meta": { "total": stats.len() } }))
}

async fn queue_detail(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let name = queue_name(&name)?;
    let stats = state.queues.stats(name).await?;
    let config = state.queues.config(name).await?;
    Ok(Json(json!({
        "data": { "name": name, "stats": stats, "config": config },
        "meta": meta()
    })))
}

async fn pause_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let name = queue_name(&name)?;
    state.queues.pause(name).await?;
    info!(queue = %name, "Queue paused via API");
    Ok(Json(json!({ "data": { "queue": name, "paused": true } })))
}

async fn resume_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let name = queue_name(&name)?;
    state.queues.resume(name).await?;
    info!(queue = %name, "Queue resumed via API");
    Ok(Json(json!({ "data": { "queue": name, "paused": false } })))
}

#[derive(Deserialize)]
struct PurgeParams {
    #[serde(default = "default_purge_age")]
    older_than_secs: u64,
}

fn default_purge_age() -> u64 {
    86_400
}

async fn purge_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<PurgeParams>,
) -> ApiResult<Json<Value>> {
    let name = queue_name(&name)?;
    let purged = state
        .queues
        .purge_old(name, Duration::from_secs(params.older_than_secs))
        .await?;
    Ok(Json(json!({
        "data": { "queue": name, "purged": purged, "older_than_secs": params.older_than_secs }
    })))
}

#[derive(Deserialize)]
struct JobsParams {
    state: Option<JobState>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<JobsParams>,
) -> ApiResult<Json<Value>> {
    let name = queue_name(&name)?;
    let jobs = state.queues.jobs(name, params.state).await?;
    Ok(Json(json!({ "data": jobs, "meta": { "total": jobs.len() } })))
}

#[derive(Deserialize)]
struct EnqueueRequest {
    #[serde(rename = "type")]
    kind: JobKind,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    delay_ms: Option<u64>,
}

async fn enqueue_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let name = queue_name(&name)?;
    let payload = JobPayload::from_json(request.kind, request.data)?;
    let options = match request.delay_ms {
        Some(ms) => EnqueueOptions::delayed(Duration::from_millis(ms)),
        None => EnqueueOptions::default(),
    };
    let handle = state.queues.enqueue(name, payload, options).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "data": { "job_id": handle.id, "queue": name, "state": handle.state() }
        })),
    ))
}

async fn get_job(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Value>> {
    let name = queue_name(&name)?;
    let job = state.queues.get_job(name, id).await?;
    Ok(Json(json!({ "data": job })))
}

async fn remove_job(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, Uuid)>,
) -> ApiResult<StatusCode> {
    let name = queue_name(&name)?;
    state.queues.remove_job(name, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Default)]
struct RunRequest {
    #[serde(default)]
    triggered_by: Option<TriggerSource>,
    #[serde(default)]
    regions: Vec<Region>,
}

/// Manual trigger. Goes through the same queue as scheduled runs.
async fn run_test(
    State(state): State<AppState>,
    Path(test_id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let request: RunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid run request: {}", e)))?
    };

    let test = state
        .store
        .get_test(&test_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("test {} not found", test_id)))?;

    let regions = if request.regions.is_empty() {
        test.target_regions()
    } else {
        request.regions
    };
    let payload = JobPayload::RunTest(RunTestPayload {
        test_id: test.id.clone(),
        triggered_by: request.triggered_by.unwrap_or(TriggerSource::Manual),
        regions: regions.clone(),
    });
    let handle = state
        .queues
        .enqueue(QueueName::TestExecution, payload, EnqueueOptions::default())
        .await?;

    info!(test = %test.id, job_id = %handle.id, "Manual run enqueued");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "data": { "job_id": handle.id, "test_id": test.id, "regions": regions }
        })),
    ))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let record = state
        .store
        .get_execution(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("execution {} not found", id)))?;
    Ok(Json(json!({ "data": record })))
}

async fn scheduler_tasks(State(state): State<AppState>) -> Json<Value> {
    let tasks = state.scheduler.tasks().await;
    Json(json!({ "data": tasks, "meta": { "total": tasks.len() } }))
}
