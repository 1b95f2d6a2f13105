//! Queue model for the durable, lease-based work queue.
//!
//! `noetl.queue` is the handoff point between the broker and worker pools.
//! A row is the unit of dispatch for a single step/iteration; workers lease
//! a row, execute it, and report completion or failure back through the
//! same row. Unlike the event log, queue rows are mutated in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Closed set of queue job states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Leased,
    Done,
    Failed,
    Dead,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Leased => "leased",
            QueueStatus::Done => "done",
            QueueStatus::Failed => "failed",
            QueueStatus::Dead => "dead",
        };
        write!(f, "{}", s)
    }
}

impl From<&str> for QueueStatus {
    fn from(s: &str) -> Self {
        match s {
            "leased" => QueueStatus::Leased,
            "done" => QueueStatus::Done,
            "failed" => QueueStatus::Failed,
            "dead" => QueueStatus::Dead,
            _ => QueueStatus::Queued,
        }
    }
}

/// Database queue record. Unique on `(execution_id, node_id)` so a retried
/// enqueue from the broker is a no-op rather than a duplicate job.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueJob {
    /// Surrogate primary key.
    pub queue_id: i64,

    /// Execution this job belongs to.
    pub execution_id: i64,

    /// Catalog entry ID for the playbook driving this execution.
    pub catalog_id: i64,

    /// Stable identifier for the step/iteration (includes loop index for
    /// iterator children). Forms the idempotency key with `execution_id`.
    pub node_id: String,

    /// Action payload the worker should execute (tool kind + rendered args).
    pub action: serde_json::Value,

    /// Render context captured at enqueue time.
    pub context: serde_json::Value,

    /// Dispatch priority; higher leases first.
    pub priority: i32,

    /// Number of lease attempts made so far.
    pub attempts: i32,

    /// Attempts allowed before the job is dead-lettered.
    pub max_attempts: i32,

    /// Job is not eligible for lease before this time.
    pub available_at: DateTime<Utc>,

    /// Current job status.
    pub status: String,

    /// Worker holding the current lease, if any.
    pub worker_id: Option<String>,

    /// Lease expiry; a leased job whose lease has passed is eligible for
    /// reaping back to `queued`.
    pub lease_until: Option<DateTime<Utc>>,

    /// Last heartbeat received from the leasing worker.
    pub last_heartbeat: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to enqueue a job. Mirrors `POST /api/queue/enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub execution_id: i64,
    pub node_id: String,
    pub action: serde_json::Value,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
    #[serde(default)]
    pub available_at: Option<DateTime<Utc>>,
}

/// Request to lease the next available job. Mirrors `POST /api/queue/lease`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub worker_id: String,
    #[serde(default)]
    pub lease_seconds: Option<i64>,
}

/// Request to mark a job complete. Mirrors `POST /api/queue/{id}/complete`.
/// `worker_id` must match the current lease holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub worker_id: String,
}

/// Request to fail a job. Mirrors `POST /api/queue/{id}/fail`.
/// `worker_id` must match the current lease holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRequest {
    pub worker_id: String,
    #[serde(default)]
    pub retry_delay_seconds: Option<i64>,
    /// Explicit `false` dead-letters the job immediately, bypassing the
    /// attempts budget.
    #[serde(default)]
    pub retry: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Request to heartbeat a leased job. Mirrors `POST /api/queue/{id}/heartbeat`.
/// `worker_id` must match the current lease holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    #[serde(default)]
    pub extend_seconds: Option<i64>,
}
