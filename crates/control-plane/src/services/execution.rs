//! Execution management service.
//!
//! Read-side views over the event log (listing, status, detail) plus the
//! one write path outside the broker: forcing an execution to a terminal
//! state. There is no dedicated execution table — everything here is
//! derived from `noetl.event` on every call, the same way the broker
//! derives its frontier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::DbPool;
use crate::engine::state::StepState;
use crate::engine::WorkflowState;
use crate::error::{AppError, AppResult};
use crate::services::EventService;

/// Execution summary for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: i64,
    pub catalog_id: i64,
    pub path: Option<String>,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub event_count: i64,
}

/// Detailed execution information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetail {
    pub execution_id: i64,
    pub catalog_id: i64,
    pub path: Option<String>,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub parent_execution_id: Option<i64>,
    pub workload: Option<serde_json::Value>,
    pub events: Vec<ExecutionEvent>,
}

/// Event in an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub event_id: i64,
    pub event_type: String,
    pub node_name: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Execution status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub execution_id: i64,
    pub status: String,
    pub current_step: Option<String>,
    pub progress: ExecutionProgress,
}

/// Execution progress information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub total_steps: i32,
    pub completed_steps: i32,
    pub running_steps: i32,
    pub failed_steps: i32,
}

/// Filter for listing executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub catalog_id: Option<i64>,
    pub path: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i32>,
    pub offset: Option<i32>,
}

/// Execution management service.
#[derive(Clone)]
pub struct ExecutionService {
    db: DbPool,
    events: EventService,
}

impl ExecutionService {
    pub fn new(db: DbPool) -> Self {
        Self {
            events: EventService::new(db.clone()),
            db,
        }
    }

    /// List executions with optional filters.
    #[allow(clippy::type_complexity)]
    pub async fn list(&self, filter: &ExecutionFilter) -> AppResult<Vec<ExecutionSummary>> {
        let limit = filter.limit.unwrap_or(50).min(100);
        let offset = filter.offset.unwrap_or(0);

        let rows: Vec<(i64, i64, Option<String>, String, DateTime<Utc>, Option<DateTime<Utc>>, i64)> =
            sqlx::query_as(
                r#"
                WITH execution_stats AS (
                    SELECT
                        execution_id,
                        catalog_id,
                        MIN(created_at) FILTER (WHERE event_type = 'execution_start') as started_at,
                        MAX(created_at) FILTER (
                            WHERE event_type IN ('execution_completed', 'execution_complete')
                        ) as completed_at,
                        COUNT(*) as event_count,
                        MAX(CASE
                            WHEN event_type IN ('execution_completed', 'execution_complete')
                                 AND status = 'FAILED' THEN 'FAILED'
                            WHEN event_type IN ('execution_completed', 'execution_complete')
                                 THEN 'COMPLETED'
                            ELSE 'RUNNING'
                        END) as status
                    FROM noetl.event
                    WHERE ($1::BIGINT IS NULL OR catalog_id = $1)
                    GROUP BY execution_id, catalog_id
                )
                SELECT
                    e.execution_id,
                    e.catalog_id,
                    c.path,
                    e.status,
                    e.started_at,
                    e.completed_at,
                    e.event_count
                FROM execution_stats e
                LEFT JOIN noetl.catalog c ON e.catalog_id = c.id
                WHERE e.started_at IS NOT NULL
                  AND ($2::TEXT IS NULL OR c.path LIKE $2)
                  AND ($3::TEXT IS NULL OR e.status = $3)
                ORDER BY e.started_at DESC
                LIMIT $4 OFFSET $5
                "#,
            )
            .bind(filter.catalog_id)
            .bind(filter.path.as_ref().map(|p| format!("%{p}%")))
            .bind(&filter.status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(execution_id, catalog_id, path, status, started_at, completed_at, event_count)| {
                    ExecutionSummary {
                        execution_id,
                        catalog_id,
                        path,
                        status,
                        started_at,
                        completed_at,
                        event_count,
                    }
                },
            )
            .collect())
    }

    /// Get detailed execution information.
    pub async fn get(&self, execution_id: i64) -> AppResult<ExecutionDetail> {
        let start_event = self
            .events
            .get_execution_start_event(execution_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("execution {execution_id} not found")))?;

        let path: Option<(String,)> = sqlx::query_as("SELECT path FROM noetl.catalog WHERE id = $1")
            .bind(start_event.catalog_id)
            .fetch_optional(&self.db)
            .await?;

        let raw_events = self.events.get_events(execution_id, None, None).await?;
        let events: Vec<ExecutionEvent> = raw_events
            .iter()
            .map(|e| ExecutionEvent {
                event_id: e.event_id,
                event_type: e.event_type.clone(),
                node_name: e.node_name.clone(),
                status: e.status.clone(),
                created_at: e.created_at,
                result: e.result.clone(),
                error: e.error.clone(),
            })
            .collect();

        let status = self.determine_status(&events);
        let completed_at = events
            .iter()
            .filter(|e| matches!(e.event_type.as_str(), "execution_completed" | "execution_complete"))
            .map(|e| e.created_at)
            .max();

        let parent_execution_id = start_event
            .context
            .as_ref()
            .and_then(|c| c.get("parent_execution_id"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i64>().ok());

        let workload = start_event
            .context
            .as_ref()
            .and_then(|c| c.get("workload"))
            .cloned();

        Ok(ExecutionDetail {
            execution_id,
            catalog_id: start_event.catalog_id,
            path: path.map(|(p,)| p),
            status,
            started_at: start_event.created_at,
            completed_at,
            parent_execution_id,
            workload,
            events,
        })
    }

    /// Get a lightweight status/progress view, reusing the same event-log
    /// reconstruction the broker uses for dispatch decisions.
    pub async fn get_status(&self, execution_id: i64) -> AppResult<ExecutionStatus> {
        let raw_events = self.events.get_events(execution_id, None, None).await?;
        let state = WorkflowState::from_events(&raw_events)
            .ok_or_else(|| AppError::NotFound(format!("execution {execution_id} not found")))?;

        let total_steps = state.steps.len() as i32;
        let completed_steps = state.completed_steps().len() as i32;
        let running_steps = state.running_steps().len() as i32;
        let failed_steps = state
            .steps
            .values()
            .filter(|s| matches!(s.state, StepState::Failed))
            .count() as i32;

        let current_step = state
            .running_steps()
            .into_iter()
            .next()
            .map(|s| s.to_string());

        Ok(ExecutionStatus {
            execution_id,
            status: state.state.to_string().to_uppercase(),
            current_step,
            progress: ExecutionProgress {
                total_steps,
                completed_steps,
                running_steps,
                failed_steps,
            },
        })
    }

    /// Force an execution to FAILED. There is no execution-cancel primitive
    /// in the event vocabulary — cancellation is just finalization with an
    /// explanatory error, which makes every future broker evaluation
    /// short-circuit on `is_execution_completed`.
    pub async fn cancel(&self, execution_id: i64) -> AppResult<()> {
        let status = self.get_status(execution_id).await?;
        if status.status == "COMPLETED" || status.status == "FAILED" {
            return Err(AppError::Validation(format!(
                "cannot cancel execution in {} state",
                status.status
            )));
        }

        self.finalize(execution_id, "FAILED", Some("cancelled")).await
    }

    /// Best-effort view of whether a FAILED execution was a user cancel
    /// rather than an action failure: the error text set by `cancel`.
    pub async fn is_cancelled(&self, execution_id: i64) -> AppResult<bool> {
        for event_type in ["execution_completed", "execution_complete"] {
            if let Some(event) = self.events.get_latest_event(execution_id, Some(event_type)).await? {
                return Ok(event.error.as_deref() == Some("cancelled"));
            }
        }
        Ok(false)
    }

    /// Finalize an execution (mark as completed or failed), emitting both
    /// terminal spellings the rest of the system checks for.
    pub async fn finalize(&self, execution_id: i64, status: &str, error: Option<&str>) -> AppResult<()> {
        if status != "COMPLETED" && status != "FAILED" {
            return Err(AppError::Validation(format!(
                "invalid finalization status: {status}"
            )));
        }

        let start_event = self
            .events
            .get_execution_start_event(execution_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("execution {execution_id} not found")))?;

        let parent_event_id = self.events.get_latest_event(execution_id, None).await?.map(|e| e.event_id);
        let result = serde_json::json!({"status": status});

        for event_type in ["execution_completed", "execution_complete"] {
            let event_id = crate::db::next_id(&self.db).await?;
            self.events
                .emit(crate::services::event::EmitEventRequest {
                    event_id,
                    execution_id,
                    catalog_id: start_event.catalog_id,
                    event_type: event_type.to_string(),
                    parent_event_id,
                    parent_execution_id: None,
                    node_id: None,
                    node_name: None,
                    node_type: Some("execution".to_string()),
                    status: status.to_string(),
                    duration_ms: None,
                    context: None,
                    result: Some(result.clone()),
                    meta: None,
                    error: error.map(|e| e.to_string()),
                    stack_trace: None,
                    loop_id: None,
                    loop_name: None,
                    iterator: None,
                    current_index: None,
                    current_item: None,
                    worker_id: None,
                    attempt: None,
                })
                .await?;
        }

        Ok(())
    }

    /// Determine overall execution status from its event list, newest first.
    fn determine_status(&self, events: &[ExecutionEvent]) -> String {
        for event in events.iter().rev() {
            match event.event_type.as_str() {
                "execution_completed" | "execution_complete" => return event.status.clone(),
                _ => {}
            }
        }
        "RUNNING".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_summary_serialization() {
        let summary = ExecutionSummary {
            execution_id: 12345,
            catalog_id: 67890,
            path: Some("test/playbook".to_string()),
            status: "RUNNING".to_string(),
            started_at: Utc::now(),
            completed_at: None,
            event_count: 5,
        };

        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("12345"));
        assert!(json.contains("RUNNING"));
    }

    #[test]
    fn test_execution_status_serialization() {
        let status = ExecutionStatus {
            execution_id: 12345,
            status: "RUNNING".to_string(),
            current_step: Some("process_data".to_string()),
            progress: ExecutionProgress {
                total_steps: 5,
                completed_steps: 2,
                running_steps: 1,
                failed_steps: 0,
            },
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("process_data"));
        assert!(json.contains("total_steps"));
    }

    #[test]
    fn test_execution_filter_default() {
        let filter = ExecutionFilter::default();
        assert!(filter.catalog_id.is_none());
        assert!(filter.limit.is_none());
    }
}
