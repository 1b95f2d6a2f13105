//! Queue service: the durable work-dispatch layer between the broker and
//! worker pools.

use std::sync::Arc;

use crate::db::models::QueueJob;
use crate::db::queries::{self, event::get_earliest_event};
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::nats::publisher::DEFAULT_SUBJECT as WAKE_SUBJECT;

const DEFAULT_PRIORITY: i32 = 0;
const DEFAULT_MAX_ATTEMPTS: i32 = 5;
const DEFAULT_LEASE_SECONDS: i64 = 60;
const DEFAULT_RETRY_DELAY_SECONDS: i64 = 60;

/// Service wrapping `noetl.queue` access for handlers and the broker.
#[derive(Clone)]
pub struct QueueService {
    pool: DbPool,
    /// Optional wake-up publisher; strictly a latency optimization. A
    /// worker missing this notification simply notices the new job on its
    /// next poll tick instead of immediately.
    nats: Option<Arc<async_nats::Client>>,
}

impl QueueService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, nats: None }
    }

    pub fn with_nats(pool: DbPool, nats: Option<Arc<async_nats::Client>>) -> Self {
        Self { pool, nats }
    }

    fn notify_wake(&self) {
        if let Some(nats) = self.nats.clone() {
            tokio::spawn(async move {
                if let Err(e) = nats.publish(WAKE_SUBJECT, "".into()).await {
                    tracing::debug!(error = %e, "queue wake-up publish failed, workers fall back to polling");
                }
            });
        }
    }

    /// Enqueue a job for `(execution_id, node_id)`. Returns `None` when a
    /// job with the same key already exists (idempotent re-evaluation).
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue(
        &self,
        execution_id: i64,
        catalog_id: i64,
        node_id: &str,
        action: &serde_json::Value,
        context: &serde_json::Value,
        priority: Option<i32>,
        max_attempts: Option<i32>,
        available_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> AppResult<Option<i64>> {
        let id = queries::queue::enqueue(
            &self.pool,
            execution_id,
            catalog_id,
            node_id,
            action,
            context,
            priority.unwrap_or(DEFAULT_PRIORITY),
            max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            available_at,
        )
        .await?;

        if id.is_some() {
            self.notify_wake();
        }
        Ok(id)
    }

    /// Enqueue a job for an execution whose `catalog_id` is not known to
    /// the caller, resolving it from the execution's earliest event (the
    /// way the broker itself always has the catalog_id already, but
    /// external/API-driven enqueues typically don't).
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_for_execution(
        &self,
        execution_id: i64,
        node_id: &str,
        action: &serde_json::Value,
        context: &serde_json::Value,
        priority: Option<i32>,
        max_attempts: Option<i32>,
        available_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> AppResult<Option<i64>> {
        let catalog_id = get_earliest_event(&self.pool, execution_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("no events found for execution {execution_id}"))
            })?
            .catalog_id;

        self.enqueue(
            execution_id,
            catalog_id,
            node_id,
            action,
            context,
            priority,
            max_attempts,
            available_at,
        )
        .await
    }

    /// Lease the next available job for a worker.
    pub async fn lease(
        &self,
        worker_id: &str,
        lease_seconds: Option<i64>,
    ) -> AppResult<Option<QueueJob>> {
        queries::queue::lease_next(
            &self.pool,
            worker_id,
            lease_seconds.unwrap_or(DEFAULT_LEASE_SECONDS),
        )
        .await
    }

    /// Mark a job done, releasing its lease. The caller must prove
    /// `worker_id` matches the current lease holder; a mismatch (stolen or
    /// reaped lease) is reported as a 409 Conflict rather than silently
    /// completing someone else's job.
    pub async fn complete(&self, queue_id: i64, worker_id: &str) -> AppResult<QueueJob> {
        match queries::queue::complete(&self.pool, queue_id, worker_id).await? {
            Some(job) => Ok(job),
            None => Err(self.ownership_conflict(queue_id, worker_id).await?),
        }
    }

    /// Mark a job failed, retrying or dead-lettering per the attempts
    /// budget and the caller's `retry` hint. Same ownership guard as
    /// [`complete`](Self::complete).
    pub async fn fail(
        &self,
        queue_id: i64,
        worker_id: &str,
        retry_delay_seconds: Option<i64>,
        retry: Option<bool>,
    ) -> AppResult<QueueJob> {
        match queries::queue::fail(
            &self.pool,
            queue_id,
            worker_id,
            retry_delay_seconds.unwrap_or(DEFAULT_RETRY_DELAY_SECONDS),
            retry.unwrap_or(true),
        )
        .await?
        {
            Some(job) => Ok(job),
            None => Err(self.ownership_conflict(queue_id, worker_id).await?),
        }
    }

    /// Touch a job's heartbeat, optionally extending its lease. Same
    /// ownership guard as [`complete`](Self::complete).
    pub async fn heartbeat(
        &self,
        queue_id: i64,
        worker_id: &str,
        extend_seconds: Option<i64>,
    ) -> AppResult<QueueJob> {
        match queries::queue::heartbeat(&self.pool, queue_id, worker_id, extend_seconds).await? {
            Some(job) => Ok(job),
            None => Err(self.ownership_conflict(queue_id, worker_id).await?),
        }
    }

    /// Distinguish "no such job" (404) from "leased by someone else" (409)
    /// for a failed ownership-scoped update.
    async fn ownership_conflict(&self, queue_id: i64, worker_id: &str) -> AppResult<AppError> {
        let job = queries::queue::get(&self.pool, queue_id).await?;
        Ok(match job {
            None => AppError::NotFound(format!("queue job not found: {queue_id}")),
            Some(job) => AppError::Conflict(format!(
                "queue job {queue_id} is leased by {:?}, not {worker_id}",
                job.worker_id
            )),
        })
    }

    /// Reclaim jobs whose lease expired without completion or heartbeat.
    pub async fn reap_expired(&self) -> AppResult<Vec<i64>> {
        queries::queue::reap_expired(&self.pool).await
    }

    pub async fn get(&self, queue_id: i64) -> AppResult<QueueJob> {
        queries::queue::get(&self.pool, queue_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("queue job not found: {queue_id}")))
    }

    pub async fn list_for_execution(&self, execution_id: i64) -> AppResult<Vec<QueueJob>> {
        queries::queue::list_for_execution(&self.pool, execution_id).await
    }

    pub async fn count_by_status(&self, status: &str) -> AppResult<i64> {
        queries::queue::count_by_status(&self.pool, status).await
    }

    /// True when a job already exists for this step/iteration, so the
    /// broker should not enqueue it again.
    pub async fn exists_for_node(&self, execution_id: i64, node_id: &str) -> AppResult<bool> {
        queries::queue::exists_for_node(&self.pool, execution_id, node_id).await
    }
}
