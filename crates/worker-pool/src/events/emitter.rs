//! Builders for the worker-reported event types: `action_started`,
//! `action_completed`, `action_failed`.

use crate::client::EventCreateRequest;

/// Node identity a worker reports events against — the queue job's own
/// `(execution_id, node_id)` plus the node's declared name/type.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub execution_id: i64,
    pub catalog_id: i64,
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
}

/// Build the `action_started` event emitted before a plugin body runs.
pub fn action_started(node: &NodeIdentity, event_id: i64, worker_id: &str) -> EventCreateRequest {
    EventCreateRequest {
        event_id: Some(event_id),
        execution_id: node.execution_id,
        catalog_id: node.catalog_id,
        node_id: Some(node.node_id.clone()),
        node_name: Some(node.node_name.clone()),
        node_type: Some(node.node_type.clone()),
        event_type: "action_started".to_string(),
        status: "IN_PROGRESS".to_string(),
        worker_id: Some(worker_id.to_string()),
        ..Default::default()
    }
}

/// Build the `action_completed` event reporting a successful plugin result.
pub fn action_completed(
    node: &NodeIdentity,
    event_id: i64,
    worker_id: &str,
    duration_ms: i64,
    result: serde_json::Value,
) -> EventCreateRequest {
    EventCreateRequest {
        event_id: Some(event_id),
        execution_id: node.execution_id,
        catalog_id: node.catalog_id,
        node_id: Some(node.node_id.clone()),
        node_name: Some(node.node_name.clone()),
        node_type: Some(node.node_type.clone()),
        event_type: "action_completed".to_string(),
        status: "COMPLETED".to_string(),
        duration_ms: Some(duration_ms),
        result: Some(result),
        worker_id: Some(worker_id.to_string()),
        ..Default::default()
    }
}

/// Build the `action_failed` event reporting a plugin error or rendering
/// failure. `stack_trace` carries the plugin's traceback, if any.
pub fn action_failed(
    node: &NodeIdentity,
    event_id: i64,
    worker_id: &str,
    duration_ms: i64,
    error: String,
    stack_trace: Option<String>,
) -> EventCreateRequest {
    EventCreateRequest {
        event_id: Some(event_id),
        execution_id: node.execution_id,
        catalog_id: node.catalog_id,
        node_id: Some(node.node_id.clone()),
        node_name: Some(node.node_name.clone()),
        node_type: Some(node.node_type.clone()),
        event_type: "action_failed".to_string(),
        status: "FAILED".to_string(),
        duration_ms: Some(duration_ms),
        error: Some(error),
        stack_trace,
        worker_id: Some(worker_id.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeIdentity {
        NodeIdentity {
            execution_id: 1,
            catalog_id: 1,
            node_id: "exec-1-step-a".to_string(),
            node_name: "step_a".to_string(),
            node_type: "task".to_string(),
        }
    }

    #[test]
    fn completed_carries_result_and_status() {
        let event = action_completed(&node(), 2, "worker-1", 42, serde_json::json!({"ok": true}));
        assert_eq!(event.event_type, "action_completed");
        assert_eq!(event.status, "COMPLETED");
        assert_eq!(event.duration_ms, Some(42));
        assert_eq!(event.result, Some(serde_json::json!({"ok": true})));
    }

    #[test]
    fn failed_carries_error_and_trace() {
        let event = action_failed(&node(), 3, "worker-1", 10, "boom".to_string(), Some("trace".to_string()));
        assert_eq!(event.event_type, "action_failed");
        assert_eq!(event.error, Some("boom".to_string()));
        assert_eq!(event.stack_trace, Some("trace".to_string()));
    }
}
