//! Worker configuration.

use std::time::Duration;
use anyhow::Result;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier (UUID).
    pub worker_id: String,

    /// Worker pool name, used as the Runtime Registry's `name` for
    /// `component_type = worker_pool`.
    pub pool_name: String,

    /// Control plane server URL.
    pub server_url: String,

    /// Seconds requested on every `POST /api/queue/lease` call; the worker
    /// re-extends it with `heartbeat` while a job runs longer than this.
    pub lease_seconds: i64,

    /// Poll interval floor when the queue is empty.
    pub poll_interval_min: Duration,

    /// Poll interval ceiling; backoff on empty leases doubles up to this.
    pub poll_interval_max: Duration,

    /// Registration/self-heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Maximum concurrent leased jobs this process will run at once.
    pub max_concurrent_tasks: usize,

    /// Optional NATS URL for the best-effort wake-up subscription. Absent
    /// (or unreachable) means the worker falls back to pure polling —
    /// correct, just slower to notice new work.
    pub nats_url: Option<String>,

    /// NATS subject the control plane publishes enqueue notifications to.
    pub nats_subject: String,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let worker_id = std::env::var("NOETL_WORKER_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let pool_name = std::env::var("NOETL_WORKER_POOL_NAME")
            .unwrap_or_else(|_| "default".to_string());

        let server_url = std::env::var("NOETL_SERVER_URL")
            .unwrap_or_else(|_| "http://localhost:8082".to_string());

        let lease_seconds: i64 = std::env::var("NOETL_WORKER_LEASE_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let poll_min_ms: u64 = std::env::var("NOETL_WORKER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(250);

        let poll_max_ms: u64 = std::env::var("NOETL_WORKER_POLL_INTERVAL_MAX_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000);

        let heartbeat_secs: u64 = std::env::var("NOETL_WORKER_HEARTBEAT_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(15);

        let max_concurrent: usize = std::env::var("NOETL_WORKER_MAX_CONCURRENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        let nats_url = std::env::var("NATS_URL").ok();

        let nats_subject = std::env::var("NOETL_WORKER_NATS_SUBJECT")
            .unwrap_or_else(|_| "noetl.queue.enqueued".to_string());

        Ok(Self {
            worker_id,
            pool_name,
            server_url,
            lease_seconds,
            poll_interval_min: Duration::from_millis(poll_min_ms),
            poll_interval_max: Duration::from_millis(poll_max_ms),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            max_concurrent_tasks: max_concurrent,
            nats_url,
            nats_subject,
        })
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            pool_name: "default".to_string(),
            server_url: "http://localhost:8082".to_string(),
            lease_seconds: 60,
            poll_interval_min: Duration::from_millis(250),
            poll_interval_max: Duration::from_millis(5_000),
            heartbeat_interval: Duration::from_secs(15),
            max_concurrent_tasks: 4,
            nats_url: None,
            nats_subject: "noetl.queue.enqueued".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.pool_name, "default");
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.lease_seconds, 60);
        assert!(config.nats_url.is_none());
    }
}
