//! Queue API handlers.
//!
//! Thin HTTP surface over [`QueueService`]; the interesting logic (leasing,
//! retry/dead-letter decisions, reaping) lives in the service and query
//! layers so it can be driven directly by the broker as well.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::db::models::{
    CompleteRequest, EnqueueRequest, FailRequest, HeartbeatRequest, LeaseRequest, QueueJob,
};
use crate::error::{AppError, AppResult};
use crate::services::QueueService;

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub status: &'static str,
    pub id: Option<String>,
}

/// `POST /api/queue/enqueue`
pub async fn enqueue(
    State(service): State<QueueService>,
    Json(request): Json<EnqueueRequest>,
) -> AppResult<Json<EnqueueResponse>> {
    let id = service
        .enqueue_for_execution(
            request.execution_id,
            &request.node_id,
            &request.action,
            &request.context,
            request.priority,
            request.max_attempts,
            request.available_at,
        )
        .await?;

    Ok(Json(EnqueueResponse {
        status: "ok",
        id: id.map(|i| i.to_string()),
    }))
}

#[derive(Debug, Serialize)]
pub struct LeaseResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<QueueJob>,
}

/// `POST /api/queue/lease`
pub async fn lease(
    State(service): State<QueueService>,
    Json(request): Json<LeaseRequest>,
) -> AppResult<Json<LeaseResponse>> {
    if request.worker_id.is_empty() {
        return Err(AppError::Validation("worker_id is required".to_string()));
    }

    let job = service.lease(&request.worker_id, request.lease_seconds).await?;

    Ok(Json(LeaseResponse {
        status: if job.is_some() { "ok" } else { "empty" },
        job,
    }))
}

/// `POST /api/queue/{id}/complete`
pub async fn complete(
    State(service): State<QueueService>,
    Path(queue_id): Path<i64>,
    Json(request): Json<CompleteRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let job = service.complete(queue_id, &request.worker_id).await?;
    Ok(Json(json!({
        "status": "ok",
        "id": job.queue_id.to_string(),
        "execution_id": job.execution_id.to_string(),
    })))
}

/// `POST /api/queue/{id}/fail`
pub async fn fail(
    State(service): State<QueueService>,
    Path(queue_id): Path<i64>,
    Json(request): Json<FailRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let job = service
        .fail(
            queue_id,
            &request.worker_id,
            request.retry_delay_seconds,
            request.retry,
        )
        .await?;

    Ok(Json(json!({
        "status": "ok",
        "id": job.queue_id.to_string(),
        "job_status": job.status,
    })))
}

/// `POST /api/queue/{id}/heartbeat`
pub async fn heartbeat(
    State(service): State<QueueService>,
    Path(queue_id): Path<i64>,
    Json(request): Json<HeartbeatRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let job = service
        .heartbeat(queue_id, &request.worker_id, request.extend_seconds)
        .await?;
    Ok(Json(json!({ "status": "ok", "id": job.queue_id.to_string() })))
}

/// `POST /api/queue/reap-expired`
pub async fn reap_expired(
    State(service): State<QueueService>,
) -> AppResult<Json<serde_json::Value>> {
    let reclaimed = service.reap_expired().await?;
    Ok(Json(json!({ "reclaimed": reclaimed.len() })))
}

/// `GET /api/queue/{id}`
pub async fn get(
    State(service): State<QueueService>,
    Path(queue_id): Path<i64>,
) -> AppResult<Json<QueueJob>> {
    Ok(Json(service.get(queue_id).await?))
}

#[derive(Debug, serde::Deserialize)]
pub struct ListQueueParams {
    pub execution_id: i64,
}

/// `GET /api/queue?execution_id=`
pub async fn list_for_execution(
    State(service): State<QueueService>,
    axum::extract::Query(params): axum::extract::Query<ListQueueParams>,
) -> AppResult<Json<Vec<QueueJob>>> {
    Ok(Json(service.list_for_execution(params.execution_id).await?))
}

#[derive(Debug, serde::Deserialize)]
pub struct QueueSizeParams {
    #[serde(default = "default_size_status")]
    pub status: String,
}

fn default_size_status() -> String {
    "queued".to_string()
}

#[derive(Debug, Serialize)]
pub struct QueueSizeResponse {
    pub status: String,
    pub count: i64,
}

/// `GET /api/queue/size?status=`
pub async fn size(
    State(service): State<QueueService>,
    axum::extract::Query(params): axum::extract::Query<QueueSizeParams>,
) -> AppResult<Json<QueueSizeResponse>> {
    let count = service.count_by_status(&params.status).await?;
    Ok(Json(QueueSizeResponse {
        status: params.status,
        count,
    }))
}
