//! Event service for event sourcing operations.
//!
//! SECURITY: All event context, result, and metadata are sanitized before storage
//! to prevent sensitive data (bearer tokens, passwords, API keys) from being persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::Event;
use crate::db::queries::event as queries;
use crate::db::DbPool;
use crate::error::AppResult;
use crate::sanitize::sanitize_sensitive_data;

/// Request to emit an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitEventRequest {
    pub event_id: i64,
    pub execution_id: i64,
    pub catalog_id: i64,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<i64>,
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
    pub loop_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_index: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_item: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<i32>,
}

/// Response after emitting an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitEventResponse {
    /// Surrogate row id, `None` when the insert was a no-op due to an
    /// already-seen `(execution_id, event_id)` pair.
    pub id: Option<i64>,
    pub event_id: i64,
    pub status: String,
}

/// Execution status derived from events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub execution_id: i64,
    pub status: String,
    pub event_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_event: Option<Event>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Step status derived from events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatus {
    pub step_name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub events: Vec<Event>,
}

/// Service for event operations.
#[derive(Clone)]
pub struct EventService {
    pool: DbPool,
}

impl EventService {
    /// Create a new event service.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Emit a new event.
    ///
    /// SECURITY: Context, meta, and result fields are sanitized to remove sensitive data.
    pub async fn emit(&self, request: EmitEventRequest) -> AppResult<EmitEventResponse> {
        let sanitized_context = request.context.as_ref().map(sanitize_sensitive_data);
        let sanitized_meta = request.meta.as_ref().map(sanitize_sensitive_data);
        let sanitized_result = request.result.as_ref().map(sanitize_sensitive_data);
        let sanitized_item = request.current_item.as_ref().map(sanitize_sensitive_data);

        let id = queries::insert_event(
            &self.pool,
            request.event_id,
            request.execution_id,
            request.catalog_id,
            request.parent_event_id,
            request.parent_execution_id,
            &request.event_type,
            request.node_id.as_deref(),
            request.node_name.as_deref(),
            request.node_type.as_deref(),
            &request.status,
            request.duration_ms,
            sanitized_context.as_ref(),
            sanitized_result.as_ref(),
            sanitized_meta.as_ref(),
            request.error.as_deref(),
            request.stack_trace.as_deref(),
            request.loop_id.as_deref(),
            request.loop_name.as_deref(),
            request.iterator.as_deref(),
            request.current_index,
            sanitized_item.as_ref(),
            request.worker_id.as_deref(),
            request.attempt,
        )
        .await?;

        Ok(EmitEventResponse {
            id,
            event_id: request.event_id,
            status: "emitted".to_string(),
        })
    }

    /// Emit the execution-start event. This is the first event in every
    /// execution's log and carries the initial workload.
    ///
    /// SECURITY: Context and meta (including workload) are sanitized to remove sensitive data.
    #[allow(clippy::too_many_arguments)]
    pub async fn emit_execution_start(
        &self,
        event_id: i64,
        execution_id: i64,
        catalog_id: i64,
        path: &str,
        version: i32,
        workload: &serde_json::Value,
        parent_execution_id: Option<i64>,
        parent_event_id: Option<i64>,
        requestor_info: Option<&serde_json::Value>,
    ) -> AppResult<Option<i64>> {
        let sanitized_workload = sanitize_sensitive_data(workload);

        let mut context = serde_json::json!({
            "catalog_id": catalog_id.to_string(),
            "execution_id": execution_id.to_string(),
            "path": path,
            "version": version.to_string(),
            "workload": sanitized_workload,
        });

        if let Some(parent_exec) = parent_execution_id {
            context["parent_execution_id"] = serde_json::json!(parent_exec.to_string());
        }
        if let Some(parent_evt) = parent_event_id {
            context["parent_event_id"] = serde_json::json!(parent_evt.to_string());
        }

        let mut meta = serde_json::json!({
            "emitted_at": Utc::now().to_rfc3339(),
            "emitter": "control_plane",
        });

        if let Some(req_info) = requestor_info {
            meta["requestor"] = sanitize_sensitive_data(req_info);
        }

        queries::insert_event(
            &self.pool,
            event_id,
            execution_id,
            catalog_id,
            parent_event_id,
            parent_execution_id,
            "execution_start",
            Some("playbook"),
            Some(path),
            Some("execution"),
            "CREATED",
            None,
            Some(&context),
            None,
            Some(&meta),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        )
        .await
    }

    /// Emit a step-started event, marking entry into a step's evaluation.
    ///
    /// SECURITY: Context is sanitized to remove sensitive data.
    #[allow(clippy::too_many_arguments)]
    pub async fn emit_step_started(
        &self,
        event_id: i64,
        execution_id: i64,
        catalog_id: i64,
        parent_event_id: i64,
        step_id: &str,
        step_name: &str,
        step_type: &str,
        context: Option<&serde_json::Value>,
    ) -> AppResult<Option<i64>> {
        let meta = serde_json::json!({
            "emitted_at": Utc::now().to_rfc3339(),
            "emitter": "control_plane",
        });

        let sanitized_context = context.map(sanitize_sensitive_data);

        queries::insert_event(
            &self.pool,
            event_id,
            execution_id,
            catalog_id,
            Some(parent_event_id),
            None,
            "step_started",
            Some(step_id),
            Some(step_name),
            Some(step_type),
            "IN_PROGRESS",
            None,
            sanitized_context.as_ref(),
            None,
            Some(&meta),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        )
        .await
    }

    /// Emit an action-started event, marking dispatch of a unit of work to
    /// the queue.
    ///
    /// SECURITY: Action context is sanitized to remove sensitive data.
    #[allow(clippy::too_many_arguments)]
    pub async fn emit_action_started(
        &self,
        event_id: i64,
        execution_id: i64,
        catalog_id: i64,
        parent_event_id: i64,
        step_name: &str,
        action: &serde_json::Value,
    ) -> AppResult<Option<i64>> {
        let meta = serde_json::json!({
            "emitted_at": Utc::now().to_rfc3339(),
            "emitter": "control_plane",
        });

        let sanitized_action = sanitize_sensitive_data(action);

        queries::insert_event(
            &self.pool,
            event_id,
            execution_id,
            catalog_id,
            Some(parent_event_id),
            None,
            "action_started",
            None,
            Some(step_name),
            Some("action"),
            "IN_PROGRESS",
            None,
            Some(&sanitized_action),
            None,
            Some(&meta),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        )
        .await
    }

    /// Get an event by ID.
    pub async fn get_event(&self, event_id: i64) -> AppResult<Option<Event>> {
        queries::get_event_by_id(&self.pool, event_id).await
    }

    /// Get events for an execution.
    pub async fn get_events(
        &self,
        execution_id: i64,
        event_type: Option<&str>,
        limit: Option<i64>,
    ) -> AppResult<Vec<Event>> {
        queries::get_events_by_execution(&self.pool, execution_id, event_type, limit).await
    }

    /// Get events by multiple types.
    pub async fn get_events_by_types(
        &self,
        execution_id: i64,
        event_types: &[&str],
    ) -> AppResult<Vec<Event>> {
        queries::get_events_by_types(&self.pool, execution_id, event_types).await
    }

    /// Get the latest event for an execution.
    pub async fn get_latest_event(
        &self,
        execution_id: i64,
        event_type: Option<&str>,
    ) -> AppResult<Option<Event>> {
        queries::get_latest_event(&self.pool, execution_id, event_type).await
    }

    /// Get execution status from events.
    pub async fn get_execution_status(&self, execution_id: i64) -> AppResult<ExecutionStatus> {
        let status = queries::get_execution_status(&self.pool, execution_id).await?;
        let event_count = queries::count_events(&self.pool, execution_id, None).await?;
        let latest_event = queries::get_latest_event(&self.pool, execution_id, None).await?;

        let start_event = queries::get_execution_start_event(&self.pool, execution_id).await?;
        let started_at = start_event.map(|e| e.created_at);

        let completed_at = if status == "COMPLETED" || status == "FAILED" {
            latest_event.as_ref().map(|e| e.created_at)
        } else {
            None
        };

        Ok(ExecutionStatus {
            execution_id,
            status,
            event_count,
            latest_event,
            started_at,
            completed_at,
        })
    }

    /// Get step status from events.
    pub async fn get_step_status(
        &self,
        execution_id: i64,
        step_name: &str,
    ) -> AppResult<StepStatus> {
        let events = queries::get_events_by_step(&self.pool, execution_id, step_name).await?;
        let result = queries::get_step_result(&self.pool, execution_id, step_name).await?;

        let status = if events.is_empty() {
            "PENDING".to_string()
        } else {
            let last_event = events.last().unwrap();
            match last_event.event_type.as_str() {
                "step_started" => "IN_PROGRESS".to_string(),
                "action_completed" | "result" => "COMPLETED".to_string(),
                "action_failed" | "error" => "FAILED".to_string(),
                _ => last_event.status.clone(),
            }
        };

        Ok(StepStatus {
            step_name: step_name.to_string(),
            status,
            result,
            events,
        })
    }

    /// Get all step results for an execution.
    pub async fn get_all_step_results(
        &self,
        execution_id: i64,
    ) -> AppResult<Vec<(String, serde_json::Value)>> {
        queries::get_all_step_results(&self.pool, execution_id).await
    }

    /// Check if execution has started.
    pub async fn is_execution_started(&self, execution_id: i64) -> AppResult<bool> {
        queries::is_execution_started(&self.pool, execution_id).await
    }

    /// Check if execution is completed.
    pub async fn is_execution_completed(&self, execution_id: i64) -> AppResult<bool> {
        queries::is_execution_completed(&self.pool, execution_id).await
    }

    /// Check if execution has an unresolved error.
    pub async fn has_unresolved_error(&self, execution_id: i64) -> AppResult<bool> {
        queries::has_unresolved_error(&self.pool, execution_id).await
    }

    /// Get events since a timestamp.
    pub async fn get_events_since(
        &self,
        execution_id: i64,
        since: DateTime<Utc>,
    ) -> AppResult<Vec<Event>> {
        queries::get_events_since(&self.pool, execution_id, since).await
    }

    /// Get the execution-start event.
    pub async fn get_execution_start_event(&self, execution_id: i64) -> AppResult<Option<Event>> {
        queries::get_execution_start_event(&self.pool, execution_id).await
    }

    /// Count events for an execution.
    pub async fn count_events(
        &self,
        execution_id: i64,
        event_type: Option<&str>,
    ) -> AppResult<i64> {
        queries::count_events(&self.pool, execution_id, event_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_event_request_serialization() {
        let request = EmitEventRequest {
            event_id: 12345,
            execution_id: 67890,
            catalog_id: 11111,
            event_type: "execution_start".to_string(),
            parent_event_id: None,
            parent_execution_id: None,
            node_id: Some("playbook".to_string()),
            node_name: Some("test-playbook".to_string()),
            node_type: Some("execution".to_string()),
            status: "CREATED".to_string(),
            duration_ms: None,
            context: Some(serde_json::json!({"key": "value"})),
            result: None,
            meta: None,
            error: None,
            stack_trace: None,
            loop_id: None,
            loop_name: None,
            iterator: None,
            current_index: None,
            current_item: None,
            worker_id: None,
            attempt: None,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("execution_start"));
        assert!(json.contains("12345"));

        assert!(!json.contains("parent_event_id"));
        assert!(!json.contains("\"meta\""));
    }

    #[test]
    fn test_execution_status_serialization() {
        let status = ExecutionStatus {
            execution_id: 12345,
            status: "RUNNING".to_string(),
            event_count: 5,
            latest_event: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("RUNNING"));
        assert!(json.contains("12345"));
        assert!(json.contains("started_at"));
        assert!(!json.contains("completed_at"));
    }

    #[test]
    fn test_step_status_serialization() {
        let status = StepStatus {
            step_name: "step1".to_string(),
            status: "COMPLETED".to_string(),
            result: Some(serde_json::json!({"output": "success"})),
            events: vec![],
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("step1"));
        assert!(json.contains("COMPLETED"));
        assert!(json.contains("output"));
    }
}
