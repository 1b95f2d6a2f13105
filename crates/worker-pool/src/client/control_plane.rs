//! Control plane HTTP client.
//!
//! Speaks the exact wire contract of `noetl.queue`/`noetl.event`/
//! `noetl.runtime`: lease/heartbeat/complete/fail, event append, and
//! runtime registration. No command-claiming handshake — leasing a queue
//! row IS the claim, enforced server-side by `FOR UPDATE SKIP LOCKED`.

use anyhow::Result;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A leased job, mirroring `noetl.queue`'s row shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub queue_id: i64,
    pub execution_id: i64,
    pub catalog_id: i64,
    pub node_id: String,
    pub action: serde_json::Value,
    #[serde(default)]
    pub context: serde_json::Value,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
struct LeaseRequest<'a> {
    worker_id: &'a str,
    lease_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct LeaseResponse {
    status: String,
    job: Option<QueueJob>,
}

/// Whether a lease attempt found a job or the queue was empty at that
/// moment — distinct from a transport/server error, which surfaces as `Err`.
pub enum Leased {
    Job(QueueJob),
    Empty,
}

/// Event append request, mirroring `EventCreateRequest`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventCreateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,
    pub execution_id: i64,
    pub catalog_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<i64>,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<i32>,
}

/// HTTP client for the control plane's queue/event/runtime surface.
#[derive(Clone)]
pub struct ControlPlaneClient {
    client: reqwest::Client,
    server_url: String,
}

impl ControlPlaneClient {
    /// Create a new control plane client.
    pub fn new(server_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    /// `POST /api/queue/lease`
    pub async fn lease(&self, worker_id: &str, lease_seconds: i64) -> Result<Leased> {
        let response = self
            .client
            .post(format!("{}/api/queue/lease", self.server_url))
            .json(&LeaseRequest { worker_id, lease_seconds })
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("lease failed: {}", body);
        }

        let parsed: LeaseResponse = response.json().await?;
        match parsed.job {
            Some(job) if parsed.status == "ok" => Ok(Leased::Job(job)),
            _ => Ok(Leased::Empty),
        }
    }

    /// `POST /api/queue/{id}/heartbeat`. Returns `false` if the lease was
    /// lost (409 — another worker reaped and re-leased the job), in which
    /// case the caller must abandon the job and discard its result.
    pub async fn heartbeat(&self, queue_id: i64, worker_id: &str, extend_seconds: i64) -> Result<bool> {
        let response = self
            .client
            .post(format!("{}/api/queue/{}/heartbeat", self.server_url, queue_id))
            .json(&serde_json::json!({"worker_id": worker_id, "extend_seconds": extend_seconds}))
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Ok(false);
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("heartbeat failed: {}", body);
        }
        Ok(true)
    }

    /// `POST /api/queue/{id}/complete`. Returns `false` on a lost lease.
    pub async fn complete(&self, queue_id: i64, worker_id: &str) -> Result<bool> {
        let response = self
            .client
            .post(format!("{}/api/queue/{}/complete", self.server_url, queue_id))
            .json(&serde_json::json!({"worker_id": worker_id}))
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Ok(false);
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("complete failed: {}", body);
        }
        Ok(true)
    }

    /// `POST /api/queue/{id}/fail`. Returns `false` on a lost lease.
    pub async fn fail(
        &self,
        queue_id: i64,
        worker_id: &str,
        retry: bool,
        retry_delay_seconds: Option<i64>,
        error: Option<String>,
    ) -> Result<bool> {
        let response = self
            .client
            .post(format!("{}/api/queue/{}/fail", self.server_url, queue_id))
            .json(&serde_json::json!({
                "worker_id": worker_id,
                "retry": retry,
                "retry_delay_seconds": retry_delay_seconds,
                "error": error,
            }))
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Ok(false);
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("fail failed: {}", body);
        }
        Ok(true)
    }

    /// `POST /api/events` — append an event, triggering an opportunistic
    /// broker re-evaluation server-side.
    pub async fn emit_event(&self, event: &EventCreateRequest) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/events", self.server_url))
            .json(event)
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("emit_event failed: {}", body);
        }

        Ok(())
    }

    /// Emit an event, retrying transient failures with capped exponential
    /// backoff. Used for the terminal `action_completed`/`action_failed`
    /// report, which must not silently drop on one flaky request.
    pub async fn emit_event_with_retry(&self, event: &EventCreateRequest, max_retries: u32) -> Result<()> {
        let mut delay = Duration::from_millis(500);

        for attempt in 0..=max_retries {
            match self.emit_event(event).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_retries => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries,
                        error = %e,
                        "event emission failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(10));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// `POST /api/worker/pool/register` (upsert by `(kind, name)`).
    pub async fn register_runtime(
        &self,
        name: &str,
        uri: &str,
        runtime_meta: serde_json::Value,
    ) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/worker/pool/register", self.server_url))
            .json(&serde_json::json!({
                "name": name,
                "kind": "worker_pool",
                "uri": uri,
                "status": "active",
                "runtime": runtime_meta,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("register_runtime failed: {}", body);
        }

        Ok(())
    }

    /// `POST /api/worker/pool/heartbeat`.
    pub async fn heartbeat_runtime(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/worker/pool/heartbeat", self.server_url))
            .json(&serde_json::json!({"kind": "worker_pool", "name": name}))
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("runtime heartbeat failed: {}", body);
        }

        Ok(())
    }

    /// `DELETE /api/worker/pool/deregister`.
    pub async fn deregister_runtime(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/api/worker/pool/deregister", self.server_url))
            .json(&serde_json::json!({"kind": "worker_pool", "name": name}))
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("runtime deregister failed: {}", body);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = ControlPlaneClient::new("http://localhost:8082");
        assert_eq!(client.server_url, "http://localhost:8082");

        let client = ControlPlaneClient::new("http://localhost:8082/");
        assert_eq!(client.server_url, "http://localhost:8082");
    }

    #[test]
    fn test_queue_job_deserialization() {
        let json = serde_json::json!({
            "queue_id": 1,
            "execution_id": 12345,
            "catalog_id": 1,
            "node_id": "process",
            "action": {"type": "shell", "body": {"command": "echo hello"}},
            "context": {},
            "priority": 0,
            "attempts": 0,
            "max_attempts": 3,
            "status": "leased"
        });

        let job: QueueJob = serde_json::from_value(json).unwrap();
        assert_eq!(job.execution_id, 12345);
        assert_eq!(job.node_id, "process");
    }

    #[test]
    fn test_event_create_request_serialization() {
        let event = EventCreateRequest {
            execution_id: 1,
            catalog_id: 1,
            event_type: "action_completed".to_string(),
            status: "COMPLETED".to_string(),
            ..Default::default()
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("action_completed"));
        assert!(!json.contains("event_id"));
    }
}
