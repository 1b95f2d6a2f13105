//! Queue database queries: enqueue, lease, heartbeat, complete, fail, reap.

use crate::db::models::QueueJob;
use crate::db::DbPool;
use crate::error::AppResult;
use chrono::{DateTime, Utc};

const QUEUE_COLUMNS: &str = "queue_id, execution_id, catalog_id, node_id, action, context, \
     priority, attempts, max_attempts, available_at, status, worker_id, lease_until, \
     last_heartbeat, created_at, updated_at";

/// Enqueue a job. Idempotent on `(execution_id, node_id)`: a retried enqueue
/// with the same key is a no-op and returns `None`.
#[allow(clippy::too_many_arguments)]
pub async fn enqueue(
    pool: &DbPool,
    execution_id: i64,
    catalog_id: i64,
    node_id: &str,
    action: &serde_json::Value,
    context: &serde_json::Value,
    priority: i32,
    max_attempts: i32,
    available_at: Option<DateTime<Utc>>,
) -> AppResult<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO noetl.queue (execution_id, catalog_id, node_id, action, context, priority, max_attempts, available_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, COALESCE($8, now()))
        ON CONFLICT (execution_id, node_id) DO NOTHING
        RETURNING queue_id
        "#,
    )
    .bind(execution_id)
    .bind(catalog_id)
    .bind(node_id)
    .bind(action)
    .bind(context)
    .bind(priority)
    .bind(max_attempts)
    .bind(available_at)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id,)| id))
}

/// Atomically lease the next available job for a worker.
///
/// Uses `FOR UPDATE SKIP LOCKED` so concurrent lease calls from different
/// workers never contend on the same row, ordered `priority DESC, queue_id`
/// (highest priority, then oldest, first).
pub async fn lease_next(
    pool: &DbPool,
    worker_id: &str,
    lease_seconds: i64,
) -> AppResult<Option<QueueJob>> {
    let job = sqlx::query_as::<_, QueueJob>(&format!(
        r#"
        WITH cte AS (
          SELECT queue_id FROM noetl.queue
          WHERE status = 'queued' AND (available_at IS NULL OR available_at <= now())
          ORDER BY priority DESC, queue_id
          FOR UPDATE SKIP LOCKED
          LIMIT 1
        )
        UPDATE noetl.queue q
        SET status = 'leased',
            worker_id = $1,
            lease_until = now() + ($2 || ' seconds')::interval,
            last_heartbeat = now(),
            attempts = q.attempts + 1,
            updated_at = now()
        FROM cte
        WHERE q.queue_id = cte.queue_id
        RETURNING {QUEUE_COLUMNS}
        "#
    ))
    .bind(worker_id)
    .bind(lease_seconds.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(job)
}

/// Mark a job complete and release its lease. The `WHERE worker_id = $2`
/// guard is the ownership proof: a caller whose lease was reaped or stolen
/// updates zero rows instead of silently completing another worker's job.
pub async fn complete(
    pool: &DbPool,
    queue_id: i64,
    worker_id: &str,
) -> AppResult<Option<QueueJob>> {
    let job = sqlx::query_as::<_, QueueJob>(&format!(
        r#"
        UPDATE noetl.queue
        SET status = 'done', lease_until = NULL, updated_at = now()
        WHERE queue_id = $1 AND worker_id = $2
        RETURNING {QUEUE_COLUMNS}
        "#
    ))
    .bind(queue_id)
    .bind(worker_id)
    .fetch_optional(pool)
    .await?;

    Ok(job)
}

/// Mark a job failed. Retries by resetting to `queued` with a delayed
/// `available_at` unless the attempts budget is exhausted or the caller
/// explicitly requests no retry, in which case the job is dead-lettered.
///
/// Scoped to `worker_id` throughout: a stolen-lease caller sees a `None`
/// current row and never reaches the dead-letter/retry decision.
pub async fn fail(
    pool: &DbPool,
    queue_id: i64,
    worker_id: &str,
    retry_delay_seconds: i64,
    retry: bool,
) -> AppResult<Option<QueueJob>> {
    let current = sqlx::query_as::<_, QueueJob>(&format!(
        "SELECT {QUEUE_COLUMNS} FROM noetl.queue WHERE queue_id = $1 AND worker_id = $2"
    ))
    .bind(queue_id)
    .bind(worker_id)
    .fetch_optional(pool)
    .await?;

    let Some(current) = current else {
        return Ok(None);
    };

    let dead = !retry || current.attempts >= current.max_attempts;

    let job = if dead {
        sqlx::query_as::<_, QueueJob>(&format!(
            "UPDATE noetl.queue SET status = 'dead', updated_at = now() WHERE queue_id = $1 AND worker_id = $2 RETURNING {QUEUE_COLUMNS}"
        ))
        .bind(queue_id)
        .bind(worker_id)
        .fetch_optional(pool)
        .await?
    } else {
        sqlx::query_as::<_, QueueJob>(&format!(
            r#"
            UPDATE noetl.queue
            SET status = 'queued',
                worker_id = NULL,
                lease_until = NULL,
                available_at = now() + ($3 || ' seconds')::interval,
                updated_at = now()
            WHERE queue_id = $1 AND worker_id = $2
            RETURNING {QUEUE_COLUMNS}
            "#
        ))
        .bind(queue_id)
        .bind(worker_id)
        .bind(retry_delay_seconds.to_string())
        .fetch_optional(pool)
        .await?
    };

    Ok(job)
}

/// Touch a leased job's heartbeat, optionally extending its lease. Scoped to
/// `worker_id` so a worker that lost its lease cannot keep it alive.
pub async fn heartbeat(
    pool: &DbPool,
    queue_id: i64,
    worker_id: &str,
    extend_seconds: Option<i64>,
) -> AppResult<Option<QueueJob>> {
    let job = if let Some(extend) = extend_seconds {
        sqlx::query_as::<_, QueueJob>(&format!(
            r#"
            UPDATE noetl.queue
            SET last_heartbeat = now(),
                lease_until = now() + ($3 || ' seconds')::interval,
                updated_at = now()
            WHERE queue_id = $1 AND worker_id = $2
            RETURNING {QUEUE_COLUMNS}
            "#
        ))
        .bind(queue_id)
        .bind(worker_id)
        .bind(extend.to_string())
        .fetch_optional(pool)
        .await?
    } else {
        sqlx::query_as::<_, QueueJob>(&format!(
            "UPDATE noetl.queue SET last_heartbeat = now(), updated_at = now() WHERE queue_id = $1 AND worker_id = $2 RETURNING {QUEUE_COLUMNS}"
        ))
        .bind(queue_id)
        .bind(worker_id)
        .fetch_optional(pool)
        .await?
    };

    Ok(job)
}

/// Reclaim jobs whose lease expired without a heartbeat/completion,
/// returning them to `queued` for another worker to pick up.
pub async fn reap_expired(pool: &DbPool) -> AppResult<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        UPDATE noetl.queue
        SET status = 'queued', worker_id = NULL, lease_until = NULL, updated_at = now()
        WHERE status = 'leased' AND lease_until IS NOT NULL AND lease_until < now()
        RETURNING queue_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Fetch a single job by id.
pub async fn get(pool: &DbPool, queue_id: i64) -> AppResult<Option<QueueJob>> {
    let job = sqlx::query_as::<_, QueueJob>(&format!(
        "SELECT {QUEUE_COLUMNS} FROM noetl.queue WHERE queue_id = $1"
    ))
    .bind(queue_id)
    .fetch_optional(pool)
    .await?;

    Ok(job)
}

/// List jobs for an execution, newest first.
pub async fn list_for_execution(pool: &DbPool, execution_id: i64) -> AppResult<Vec<QueueJob>> {
    let jobs = sqlx::query_as::<_, QueueJob>(&format!(
        "SELECT {QUEUE_COLUMNS} FROM noetl.queue WHERE execution_id = $1 ORDER BY queue_id DESC"
    ))
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(jobs)
}

/// Count queued jobs, for the `/api/queue/size` style health surface.
pub async fn count_by_status(pool: &DbPool, status: &str) -> AppResult<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM noetl.queue WHERE status = $1")
            .bind(status)
            .fetch_one(pool)
            .await?;

    Ok(count)
}

/// Whether a job exists and is already terminal (`done`, `failed`, `dead`)
/// for the given `(execution_id, node_id)` key, used by the broker to avoid
/// re-enqueuing work the frontier already covers.
pub async fn exists_for_node(pool: &DbPool, execution_id: i64, node_id: &str) -> AppResult<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT queue_id FROM noetl.queue WHERE execution_id = $1 AND node_id = $2",
    )
    .bind(execution_id)
    .bind(node_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}
