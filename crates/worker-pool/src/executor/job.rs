//! Runs one leased queue job's action through the tool registry.
//!
//! The job's `action` JSON is the rendered `ToolCall` the broker built,
//! with its input already fully resolved against execution context; it
//! deserializes straight into `noetl_tools::registry::ToolConfig` since
//! both flatten their tool-specific fields alongside `kind`.

use std::time::Instant;

use anyhow::{Context, Result};
use noetl_tools::context::ExecutionContext;
use noetl_tools::registry::{ToolConfig, ToolRegistry};
use noetl_tools::result::ToolResult;
use noetl_tools::tools::create_default_registry;

use crate::client::QueueJob;

/// Dispatches leased jobs to the built-in tool registry (`script`, `http`).
/// Other `tool.kind` values a playbook may name dispatch the same way but
/// have no body in this workspace — plugin bodies are an external
/// collaborator this crate only needs the input/output contract of.
pub struct JobExecutor {
    tool_registry: ToolRegistry,
}

/// What came back from running a job's action, independent of whether the
/// tool itself reported success or failure.
pub struct JobOutcome {
    pub result: ToolResult,
    pub duration_ms: i64,
}

impl JobExecutor {
    pub fn new() -> Self {
        Self {
            tool_registry: create_default_registry(),
        }
    }

    /// Render `job.action` into a `ToolConfig`, build an `ExecutionContext`
    /// from `job.context`, and run it. Only a malformed action (not a tool
    /// failure) returns `Err` — a tool that runs and reports an error comes
    /// back as `Ok` with `result.status == Error`.
    pub async fn execute(&self, job: &QueueJob, worker_id: &str) -> Result<JobOutcome> {
        let tool_config: ToolConfig = serde_json::from_value(job.action.clone())
            .with_context(|| format!("job {} carries an unparseable action", job.node_id))?;

        let mut ctx = ExecutionContext::new(job.execution_id, &job.node_id, "")
            .with_worker_id(worker_id)
            .with_node_id(&job.node_id);

        if let serde_json::Value::Object(map) = &job.context {
            ctx.merge_variables(&map.clone().into_iter().collect());
        }

        let started = Instant::now();
        let result = match self.tool_registry.execute_from_config(&tool_config, &ctx).await {
            Ok(result) => result,
            Err(e) => ToolResult::error(e.to_string()),
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        Ok(JobOutcome { result, duration_ms })
    }
}

impl Default for JobExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// The step/loop-iteration name reported as an event's `node_name`: the
/// queue job's `node_id` with any trailing `[index]` loop suffix stripped.
pub fn step_name(node_id: &str) -> &str {
    match node_id.rfind('[') {
        Some(idx) if node_id.ends_with(']') => &node_id[..idx],
        _ => node_id,
    }
}

/// `node_type` reported on worker-side events: the tool's own `kind`, since
/// a worker has no view of the playbook's step-type vocabulary (task vs.
/// workbook vs. iterator) — only of what it was asked to run.
pub fn tool_kind(action: &serde_json::Value) -> String {
    action
        .get("kind")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_name_strips_loop_suffix() {
        assert_eq!(step_name("users[3]"), "users");
        assert_eq!(step_name("process"), "process");
        assert_eq!(step_name("weird[not-closed"), "weird[not-closed");
    }

    #[test]
    fn tool_kind_reads_action_kind() {
        assert_eq!(tool_kind(&serde_json::json!({"kind": "http"})), "http");
        assert_eq!(tool_kind(&serde_json::json!({})), "unknown");
    }

    #[tokio::test]
    async fn execute_runs_script_action() {
        let executor = JobExecutor::new();
        let job = QueueJob {
            queue_id: 1,
            execution_id: 1,
            catalog_id: 1,
            node_id: "echo_step".to_string(),
            action: serde_json::json!({"kind": "script", "command": "echo hi"}),
            context: serde_json::json!({}),
            priority: 0,
            attempts: 1,
            max_attempts: 3,
            status: "leased".to_string(),
        };

        let outcome = executor.execute(&job, "worker-1").await.unwrap();
        assert!(outcome.result.is_success());
    }

    #[tokio::test]
    async fn execute_rejects_unparseable_action() {
        let executor = JobExecutor::new();
        let job = QueueJob {
            queue_id: 1,
            execution_id: 1,
            catalog_id: 1,
            node_id: "broken_step".to_string(),
            action: serde_json::json!("not an object"),
            context: serde_json::json!({}),
            priority: 0,
            attempts: 1,
            max_attempts: 3,
            status: "leased".to_string(),
        };

        assert!(executor.execute(&job, "worker-1").await.is_err());
    }
}
