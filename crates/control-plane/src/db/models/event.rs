//! Event model for execution event sourcing.
//!
//! All workflow state is derived from events stored in the event table.
//! The event table is append-only: no row is ever mutated after insert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Closed set of event types the broker and context service understand.
///
/// `Custom` exists only for forward-compatibility with rows written by a
/// newer server version; the broker never emits it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionStart,
    StepStarted,
    ActionStarted,
    ActionCompleted,
    ActionFailed,
    LoopIteration,
    LoopCompleted,
    Result,
    ExecutionCompleted,
    ExecutionComplete,
    Error,
    ErrorResolved,
    Custom(String),
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::ExecutionStart => "execution_start",
            EventType::StepStarted => "step_started",
            EventType::ActionStarted => "action_started",
            EventType::ActionCompleted => "action_completed",
            EventType::ActionFailed => "action_failed",
            EventType::LoopIteration => "loop_iteration",
            EventType::LoopCompleted => "loop_completed",
            EventType::Result => "result",
            EventType::ExecutionCompleted => "execution_completed",
            EventType::ExecutionComplete => "execution_complete",
            EventType::Error => "error",
            EventType::ErrorResolved => "error_resolved",
            EventType::Custom(s) => s,
        };
        write!(f, "{}", s)
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "execution_start" => EventType::ExecutionStart,
            "step_started" => EventType::StepStarted,
            "action_started" => EventType::ActionStarted,
            "action_completed" => EventType::ActionCompleted,
            "action_failed" => EventType::ActionFailed,
            "loop_iteration" => EventType::LoopIteration,
            "loop_completed" => EventType::LoopCompleted,
            "result" => EventType::Result,
            "execution_completed" => EventType::ExecutionCompleted,
            "execution_complete" => EventType::ExecutionComplete,
            "error" => EventType::Error,
            "error_resolved" => EventType::ErrorResolved,
            other => EventType::Custom(other.to_string()),
        }
    }
}

impl EventType {
    /// True for the two spellings of the terminal completion marker.
    ///
    /// The original source emits both `execution_completed` and
    /// `execution_complete` depending on code path; both are authoritative
    /// terminal markers and callers must treat either as "done".
    pub fn is_execution_terminal(&self) -> bool {
        matches!(
            self,
            EventType::ExecutionCompleted | EventType::ExecutionComplete
        )
    }
}

/// Event status values (closed set per the data model).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Created,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::Created => "CREATED",
            EventStatus::InProgress => "IN_PROGRESS",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
            EventStatus::Skipped => "SKIPPED",
        };
        write!(f, "{}", s)
    }
}

impl From<&str> for EventStatus {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "CREATED" => EventStatus::Created,
            "IN_PROGRESS" | "RUNNING" => EventStatus::InProgress,
            "COMPLETED" => EventStatus::Completed,
            "FAILED" => EventStatus::Failed,
            "SKIPPED" => EventStatus::Skipped,
            _ => EventStatus::Created,
        }
    }
}

/// Database event record. Append-only: rows are inserted once, never
/// updated. Key is `(execution_id, event_id)`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Event {
    /// Surrogate primary key.
    pub id: i64,

    /// Execution identifier.
    pub execution_id: i64,

    /// Catalog entry ID this execution was started from.
    pub catalog_id: i64,

    /// Event identifier (snowflake ID, client-suppliable for idempotent retry).
    pub event_id: i64,

    /// Parent event ID within the same execution (ordering/hierarchy).
    pub parent_event_id: Option<i64>,

    /// Parent execution ID, for nested-playbook child executions.
    pub parent_execution_id: Option<i64>,

    /// Event type, drawn from the closed `EventType` set.
    pub event_type: String,

    /// Node identifier (stable per step instance, includes loop index).
    pub node_id: Option<String>,

    /// Node name (step name).
    pub node_name: Option<String>,

    /// Node type (task, iterator, playbook, end, execution, ...).
    pub node_type: Option<String>,

    /// Event status, drawn from the closed `EventStatus` set.
    pub status: String,

    /// Event duration in milliseconds, when known.
    pub duration_ms: Option<i64>,

    /// Event context (JSON) — inputs/render context at the time of emission.
    pub context: Option<serde_json::Value>,

    /// Result data (JSON) — for completion events.
    pub result: Option<serde_json::Value>,

    /// Event metadata (JSON).
    pub meta: Option<serde_json::Value>,

    /// Error message, for failure events.
    pub error: Option<String>,

    /// Stack trace / traceback text, for failure events.
    pub stack_trace: Option<String>,

    /// Loop identifier, for events belonging to an iterator step.
    pub loop_id: Option<String>,

    /// Loop/iterator step name.
    pub loop_name: Option<String>,

    /// Iterator variable name bound per-iteration.
    pub iterator: Option<String>,

    /// Zero-based index of this iteration.
    pub current_index: Option<i32>,

    /// The item value bound for this iteration.
    pub current_item: Option<serde_json::Value>,

    /// Worker ID that produced this event, for worker-reported events.
    pub worker_id: Option<String>,

    /// Attempt number (for retries).
    pub attempt: Option<i32>,

    /// When the event was inserted.
    pub created_at: DateTime<Utc>,
}

/// Request to append a new event. Mirrors `POST /api/events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCreateRequest {
    /// Event id. Client-suppliable so retries are idempotent; generated
    /// server-side via `noetl.snowflake_id()` when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,

    pub execution_id: i64,
    pub catalog_id: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<i64>,

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

/// Event response for API consumers (ids rendered as strings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResponse {
    pub event_id: String,
    pub execution_id: String,
    pub event_type: String,
    pub node_name: Option<String>,
    pub status: String,
    pub context: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Event> for EventResponse {
    fn from(e: Event) -> Self {
        Self {
            event_id: e.event_id.to_string(),
            execution_id: e.execution_id.to_string(),
            event_type: e.event_type,
            node_name: e.node_name,
            status: e.status,
            context: e.context,
            result: e.result,
            error: e.error,
            created_at: e.created_at,
        }
    }
}

/// List of events response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventListResponse {
    pub events: Vec<EventResponse>,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::ExecutionStart.to_string(), "execution_start");
        assert_eq!(EventType::ActionCompleted.to_string(), "action_completed");
        assert_eq!(EventType::LoopCompleted.to_string(), "loop_completed");
    }

    #[test]
    fn test_event_type_from_str_round_trip() {
        for s in [
            "execution_start",
            "step_started",
            "action_started",
            "action_completed",
            "action_failed",
            "loop_iteration",
            "loop_completed",
            "result",
            "execution_completed",
            "execution_complete",
            "error",
            "error_resolved",
        ] {
            assert_eq!(EventType::from(s).to_string(), s);
        }
        assert_eq!(
            EventType::from("vendor_custom"),
            EventType::Custom("vendor_custom".to_string())
        );
    }

    #[test]
    fn test_is_execution_terminal() {
        assert!(EventType::ExecutionCompleted.is_execution_terminal());
        assert!(EventType::ExecutionComplete.is_execution_terminal());
        assert!(!EventType::ActionCompleted.is_execution_terminal());
    }

    #[test]
    fn test_event_status_display_and_parse() {
        assert_eq!(EventStatus::Completed.to_string(), "COMPLETED");
        assert_eq!(EventStatus::from("in_progress"), EventStatus::InProgress);
        assert_eq!(EventStatus::from("skipped"), EventStatus::Skipped);
        assert_eq!(EventStatus::from("garbage"), EventStatus::Created);
    }
}
