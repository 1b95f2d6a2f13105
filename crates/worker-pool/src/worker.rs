//! Worker lifecycle: lease-poll loop, bounded backoff, concurrent dispatch.
//!
//! `run` registers the pool in the Runtime Registry, starts a self-heartbeat
//! task, then loops leasing jobs. Each leased job is dispatched to its own
//! task behind a semaphore permit so a slow plugin body doesn't stall the
//! poll loop. While a job runs, a heartbeat task keeps extending its lease;
//! if that heartbeat ever reports the lease was lost (another worker reaped
//! and re-leased it after `reap_expired`), this worker discards its result
//! instead of writing a completion event for work it no longer owns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use crate::client::{ControlPlaneClient, Leased, QueueJob};
use crate::config::WorkerConfig;
use crate::events::{action_completed, action_failed, action_started, NodeIdentity};
use crate::executor::{step_name, tool_kind, JobExecutor};
use crate::nats::run_wake_listener;

/// The default delay before a failed job becomes eligible for retry.
/// Bounded by the step's own `max_attempts`; the queue service owns the
/// dead-letter decision once that budget is exhausted.
const RETRY_DELAY_SECONDS: i64 = 5;

/// Worker pool process: one lease-poll loop per OS process, `max_concurrent_tasks`
/// jobs in flight at once. A single leased job's plugin body still runs
/// single-threaded within its own task.
pub struct Worker {
    config: WorkerConfig,
    client: ControlPlaneClient,
    executor: Arc<JobExecutor>,
    semaphore: Arc<Semaphore>,
}

impl Worker {
    /// Create a new worker. Does not register or lease anything yet.
    pub async fn new(config: WorkerConfig) -> Result<Self> {
        let client = ControlPlaneClient::new(&config.server_url);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks));

        Ok(Self {
            executor: Arc::new(JobExecutor::new()),
            client,
            semaphore,
            config,
        })
    }

    /// Run the worker until its poll loop errors out or the process is
    /// asked to shut down (the caller races this against a signal future).
    pub async fn run(&self) -> Result<()> {
        self.register().await?;
        let heartbeat_handle = self.start_registry_heartbeat();

        let (wake_tx, mut wake_rx) = mpsc::channel(1);
        let wake_handle = self.config.nats_url.clone().map(|nats_url| {
            let tx = wake_tx;
            tokio::spawn(async move {
                if let Err(e) = run_wake_listener(&nats_url, tx).await {
                    tracing::warn!(
                        error = %e,
                        "queue wake-up subscription failed, falling back to pure polling"
                    );
                }
            })
        });

        let result = self.poll_loop(&mut wake_rx).await;

        heartbeat_handle.abort();
        if let Some(handle) = wake_handle {
            handle.abort();
        }
        self.deregister().await?;

        result
    }

    /// Register this worker pool in the Runtime Registry
    /// (`component_type = worker_pool`).
    async fn register(&self) -> Result<()> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        self.client
            .register_runtime(
                &self.config.pool_name,
                &self.config.server_url,
                serde_json::json!({
                    "pid": std::process::id(),
                    "hostname": hostname,
                    "worker_id": self.config.worker_id,
                    "max_concurrent_tasks": self.config.max_concurrent_tasks,
                }),
            )
            .await?;

        tracing::info!(
            worker_id = %self.config.worker_id,
            pool_name = %self.config.pool_name,
            hostname = %hostname,
            "worker pool registered"
        );

        Ok(())
    }

    /// Deregister this worker pool from the Runtime Registry.
    async fn deregister(&self) -> Result<()> {
        self.client.deregister_runtime(&self.config.pool_name).await?;
        tracing::info!(pool_name = %self.config.pool_name, "worker pool deregistered");
        Ok(())
    }

    /// Self-heartbeat the worker pool's own runtime row.
    fn start_registry_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let pool_name = self.config.pool_name.clone();
        let interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it

            loop {
                ticker.tick().await;
                if let Err(e) = client.heartbeat_runtime(&pool_name).await {
                    tracing::warn!(error = %e, "worker pool registry heartbeat failed");
                }
            }
        })
    }

    /// Lease, dispatch, repeat. Empty leases back off up to
    /// `poll_interval_max`; a successful lease resets the backoff and, if a
    /// wake-up arrived meanwhile, is tried again immediately next loop.
    async fn poll_loop(&self, wake_rx: &mut mpsc::Receiver<()>) -> Result<()> {
        let mut backoff = self.config.poll_interval_min;

        loop {
            let permit = self.semaphore.clone().acquire_owned().await?;

            match self
                .client
                .lease(&self.config.worker_id, self.config.lease_seconds)
                .await
            {
                Ok(Leased::Job(job)) => {
                    backoff = self.config.poll_interval_min;
                    self.spawn_job(job, permit);
                }
                Ok(Leased::Empty) => {
                    drop(permit);
                    wait_for_wake_or_timeout(wake_rx, backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.config.poll_interval_max);
                }
                Err(e) => {
                    drop(permit);
                    tracing::warn!(error = %e, "lease request failed");
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.config.poll_interval_max);
                }
            }
        }
    }

    /// Spawn one leased job onto its own task, holding `permit` until it
    /// finishes so the semaphore gates total concurrency.
    fn spawn_job(&self, job: QueueJob, permit: OwnedSemaphorePermit) {
        let client = self.client.clone();
        let executor = self.executor.clone();
        let worker_id = self.config.worker_id.clone();
        let lease_seconds = self.config.lease_seconds;

        tokio::spawn(async move {
            let _permit = permit;
            run_job(&client, &executor, job, &worker_id, lease_seconds).await;
        });
    }
}

/// Block until either a wake-up notification arrives or `timeout` elapses,
/// whichever comes first.
async fn wait_for_wake_or_timeout(wake_rx: &mut mpsc::Receiver<()>, timeout: Duration) {
    tokio::select! {
        _ = wake_rx.recv() => {}
        _ = tokio::time::sleep(timeout) => {}
    }
}

/// Run one leased job end to end: `action_started`, execute, report
/// `action_completed`/`action_failed`, then `complete`/`fail` the queue row.
/// A lease lost mid-execution (the heartbeat task observes a 409) short-
/// circuits straight to discarding the result — no event, no queue call.
async fn run_job(
    client: &ControlPlaneClient,
    executor: &JobExecutor,
    job: QueueJob,
    worker_id: &str,
    lease_seconds: i64,
) {
    let node = NodeIdentity {
        execution_id: job.execution_id,
        catalog_id: job.catalog_id,
        node_id: job.node_id.clone(),
        node_name: step_name(&job.node_id).to_string(),
        node_type: tool_kind(&job.action),
    };

    let start_event = action_started(&node, 0, worker_id);
    if let Err(e) = client.emit_event_with_retry(&start_event, 3).await {
        tracing::warn!(error = %e, node_id = %node.node_id, "failed to report action_started");
    }

    let lease_lost = Arc::new(AtomicBool::new(false));
    let heartbeat_stop = Arc::new(AtomicBool::new(false));
    let heartbeat_handle = spawn_lease_heartbeat(
        client.clone(),
        job.queue_id,
        worker_id.to_string(),
        lease_seconds,
        lease_lost.clone(),
        heartbeat_stop.clone(),
    );

    let outcome = executor.execute(&job, worker_id).await;

    heartbeat_stop.store(true, Ordering::SeqCst);
    heartbeat_handle.abort();

    if lease_lost.load(Ordering::SeqCst) {
        tracing::warn!(
            node_id = %node.node_id,
            queue_id = job.queue_id,
            "lease lost mid-execution, discarding result"
        );
        return;
    }

    match outcome {
        Ok(result) if result.result.is_success() => {
            let event = action_completed(&node, 0, worker_id, result.duration_ms, result.result.to_envelope());
            if let Err(e) = client.emit_event_with_retry(&event, 3).await {
                tracing::error!(error = %e, node_id = %node.node_id, "failed to report action_completed");
            }
            if let Err(e) = client.complete(job.queue_id, worker_id).await {
                tracing::error!(error = %e, queue_id = job.queue_id, "failed to mark queue job done");
            }
        }
        Ok(result) => {
            let error = result.result.error.clone().unwrap_or_else(|| "tool reported failure".to_string());
            report_failure(client, &node, &job, worker_id, result.duration_ms, error, None).await;
        }
        Err(e) => {
            report_failure(client, &node, &job, worker_id, 0, e.to_string(), None).await;
        }
    }
}

async fn report_failure(
    client: &ControlPlaneClient,
    node: &NodeIdentity,
    job: &QueueJob,
    worker_id: &str,
    duration_ms: i64,
    error: String,
    stack_trace: Option<String>,
) {
    let event = action_failed(node, 0, worker_id, duration_ms, error.clone(), stack_trace);
    if let Err(e) = client.emit_event_with_retry(&event, 3).await {
        tracing::error!(error = %e, node_id = %node.node_id, "failed to report action_failed");
    }

    let retry = job.attempts < job.max_attempts;
    if let Err(e) = client
        .fail(job.queue_id, worker_id, retry, Some(RETRY_DELAY_SECONDS), Some(error))
        .await
    {
        tracing::error!(error = %e, queue_id = job.queue_id, "failed to report queue job failure");
    }
}

/// Extends `queue_id`'s lease at half the lease interval until `stop` is
/// set. Sets `lease_lost` and exits as soon as a heartbeat reports the
/// lease was reaped out from under this worker.
fn spawn_lease_heartbeat(
    client: ControlPlaneClient,
    queue_id: i64,
    worker_id: String,
    lease_seconds: i64,
    lease_lost: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs((lease_seconds / 2).max(1) as u64);

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if stop.load(Ordering::SeqCst) {
                return;
            }

            match client.heartbeat(queue_id, &worker_id, lease_seconds).await {
                Ok(true) => {}
                Ok(false) => {
                    lease_lost.store(true, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, queue_id, "lease heartbeat request failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config() {
        let config = WorkerConfig::default();
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.pool_name, "default");
    }

    #[tokio::test]
    async fn new_worker_builds_without_connecting() {
        let worker = Worker::new(WorkerConfig::default()).await.unwrap();
        assert_eq!(worker.config.pool_name, "default");
    }
}
