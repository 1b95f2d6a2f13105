//! Event database queries.
//!
//! The event table is append-only and the sole source of truth for
//! execution state; nothing here ever issues an `UPDATE` against it.

use chrono::{DateTime, Utc};

use crate::db::models::Event;
use crate::db::DbPool;
use crate::error::AppResult;

/// Column list shared by every `SELECT * FROM noetl.event` query, kept in
/// one place so new columns only need adding here and in `Event`.
const EVENT_COLUMNS: &str = r#"
    id, execution_id, catalog_id, event_id, parent_event_id, parent_execution_id,
    event_type, node_id, node_name, node_type, status, duration_ms,
    context, result, meta, error, stack_trace,
    loop_id, loop_name, iterator, current_index, current_item,
    worker_id, attempt, created_at
"#;

/// Insert a new event. Idempotent on `(execution_id, event_id)`: a retried
/// insert with the same ids is a no-op rather than a duplicate row, so
/// callers may safely retry on timeout.
#[allow(clippy::too_many_arguments)]
pub async fn insert_event(
    pool: &DbPool,
    event_id: i64,
    execution_id: i64,
    catalog_id: i64,
    parent_event_id: Option<i64>,
    parent_execution_id: Option<i64>,
    event_type: &str,
    node_id: Option<&str>,
    node_name: Option<&str>,
    node_type: Option<&str>,
    status: &str,
    duration_ms: Option<i64>,
    context: Option<&serde_json::Value>,
    result: Option<&serde_json::Value>,
    meta: Option<&serde_json::Value>,
    error: Option<&str>,
    stack_trace: Option<&str>,
    loop_id: Option<&str>,
    loop_name: Option<&str>,
    iterator: Option<&str>,
    current_index: Option<i32>,
    current_item: Option<&serde_json::Value>,
    worker_id: Option<&str>,
    attempt: Option<i32>,
) -> AppResult<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO noetl.event (
            event_id, execution_id, catalog_id, parent_event_id, parent_execution_id,
            event_type, node_id, node_name, node_type, status, duration_ms,
            context, result, meta, error, stack_trace,
            loop_id, loop_name, iterator, current_index, current_item,
            worker_id, attempt, created_at
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
            $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24
        )
        ON CONFLICT (execution_id, event_id) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(event_id)
    .bind(execution_id)
    .bind(catalog_id)
    .bind(parent_event_id)
    .bind(parent_execution_id)
    .bind(event_type)
    .bind(node_id)
    .bind(node_name)
    .bind(node_type)
    .bind(status)
    .bind(duration_ms)
    .bind(context)
    .bind(result)
    .bind(meta)
    .bind(error)
    .bind(stack_trace)
    .bind(loop_id)
    .bind(loop_name)
    .bind(iterator)
    .bind(current_index)
    .bind(current_item)
    .bind(worker_id)
    .bind(attempt)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id,)| id))
}

/// Get an event by event_id.
pub async fn get_event_by_id(pool: &DbPool, event_id: i64) -> AppResult<Option<Event>> {
    let query = format!(
        "SELECT {} FROM noetl.event WHERE event_id = $1",
        EVENT_COLUMNS
    );
    let event = sqlx::query_as::<_, Event>(&query)
        .bind(event_id)
        .fetch_optional(pool)
        .await?;

    Ok(event)
}

/// Get all events for an execution, in emission order.
pub async fn get_events_by_execution(
    pool: &DbPool,
    execution_id: i64,
    event_type: Option<&str>,
    limit: Option<i64>,
) -> AppResult<Vec<Event>> {
    let events = if let Some(et) = event_type {
        let query = format!(
            "SELECT {} FROM noetl.event WHERE execution_id = $1 AND event_type = $2 ORDER BY id ASC LIMIT $3",
            EVENT_COLUMNS
        );
        sqlx::query_as::<_, Event>(&query)
            .bind(execution_id)
            .bind(et)
            .bind(limit.unwrap_or(1000))
            .fetch_all(pool)
            .await?
    } else {
        let query = format!(
            "SELECT {} FROM noetl.event WHERE execution_id = $1 ORDER BY id ASC LIMIT $2",
            EVENT_COLUMNS
        );
        sqlx::query_as::<_, Event>(&query)
            .bind(execution_id)
            .bind(limit.unwrap_or(1000))
            .fetch_all(pool)
            .await?
    };

    Ok(events)
}

/// Get events by execution and multiple event types.
pub async fn get_events_by_types(
    pool: &DbPool,
    execution_id: i64,
    event_types: &[&str],
) -> AppResult<Vec<Event>> {
    let placeholders: Vec<String> = (2..=event_types.len() + 1)
        .map(|i| format!("${}", i))
        .collect();
    let in_clause = placeholders.join(", ");

    let query = format!(
        "SELECT {} FROM noetl.event WHERE execution_id = $1 AND event_type IN ({}) ORDER BY id ASC",
        EVENT_COLUMNS, in_clause
    );

    let mut query_builder = sqlx::query_as::<_, Event>(&query).bind(execution_id);

    for et in event_types {
        query_builder = query_builder.bind(*et);
    }

    let events = query_builder.fetch_all(pool).await?;
    Ok(events)
}

/// Get the latest event for an execution, optionally filtered by type.
pub async fn get_latest_event(
    pool: &DbPool,
    execution_id: i64,
    event_type: Option<&str>,
) -> AppResult<Option<Event>> {
    let event = if let Some(et) = event_type {
        let query = format!(
            "SELECT {} FROM noetl.event WHERE execution_id = $1 AND event_type = $2 ORDER BY id DESC LIMIT 1",
            EVENT_COLUMNS
        );
        sqlx::query_as::<_, Event>(&query)
            .bind(execution_id)
            .bind(et)
            .fetch_optional(pool)
            .await?
    } else {
        let query = format!(
            "SELECT {} FROM noetl.event WHERE execution_id = $1 ORDER BY id DESC LIMIT 1",
            EVENT_COLUMNS
        );
        sqlx::query_as::<_, Event>(&query)
            .bind(execution_id)
            .fetch_optional(pool)
            .await?
    };

    Ok(event)
}

/// Get events for a specific step (node).
pub async fn get_events_by_step(
    pool: &DbPool,
    execution_id: i64,
    node_name: &str,
) -> AppResult<Vec<Event>> {
    let query = format!(
        "SELECT {} FROM noetl.event WHERE execution_id = $1 AND node_name = $2 ORDER BY id ASC",
        EVENT_COLUMNS
    );
    let events = sqlx::query_as::<_, Event>(&query)
        .bind(execution_id)
        .bind(node_name)
        .fetch_all(pool)
        .await?;

    Ok(events)
}

/// Latest `action_completed` result for a step.
pub async fn get_step_result(
    pool: &DbPool,
    execution_id: i64,
    node_name: &str,
) -> AppResult<Option<serde_json::Value>> {
    let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(
        r#"
        SELECT result
        FROM noetl.event
        WHERE execution_id = $1
          AND node_name = $2
          AND event_type = 'action_completed'
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(execution_id)
    .bind(node_name)
    .fetch_optional(pool)
    .await?;

    Ok(row.and_then(|(r,)| r))
}

/// Latest `action_completed` result for every node that has one, keyed by
/// node name. Used to build the results half of the rendering context.
pub async fn get_all_step_results(
    pool: &DbPool,
    execution_id: i64,
) -> AppResult<Vec<(String, serde_json::Value)>> {
    let rows: Vec<(Option<String>, Option<serde_json::Value>)> = sqlx::query_as(
        r#"
        SELECT DISTINCT ON (node_name) node_name, result
        FROM noetl.event
        WHERE execution_id = $1
          AND event_type = 'action_completed'
          AND result IS NOT NULL
        ORDER BY node_name, id DESC
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(name, result)| name.zip(result))
        .collect())
}

/// The earliest event for an execution — carries the initial workload
/// context the execution was started with.
pub async fn get_earliest_event(pool: &DbPool, execution_id: i64) -> AppResult<Option<Event>> {
    let query = format!(
        "SELECT {} FROM noetl.event WHERE execution_id = $1 ORDER BY id ASC LIMIT 1",
        EVENT_COLUMNS
    );
    let event = sqlx::query_as::<_, Event>(&query)
        .bind(execution_id)
        .fetch_optional(pool)
        .await?;

    Ok(event)
}

/// Count completed iterations of a loop step that each spawned a child
/// execution, using a structured predicate rather than a substring match
/// against the context blob.
pub async fn count_completed_iterations_with_child(
    pool: &DbPool,
    execution_id: i64,
    loop_name: &str,
) -> AppResult<i64> {
    let count: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM noetl.event
        WHERE execution_id = $1
          AND loop_name = $2
          AND event_type = 'loop_iteration'
          AND status = 'COMPLETED'
          AND context ->> 'child_execution_id' IS NOT NULL
        "#,
    )
    .bind(execution_id)
    .bind(loop_name)
    .fetch_one(pool)
    .await?;

    Ok(count.0)
}

/// List the child execution ids spawned by a loop step's iterations, using
/// a structured predicate rather than a substring match.
pub async fn list_child_executions_for_parent(
    pool: &DbPool,
    parent_execution_id: i64,
    loop_name: &str,
) -> AppResult<Vec<i64>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT context ->> 'child_execution_id'
        FROM noetl.event
        WHERE execution_id = $1
          AND loop_name = $2
          AND context ->> 'child_execution_id' IS NOT NULL
        "#,
    )
    .bind(parent_execution_id)
    .bind(loop_name)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(s,)| s.parse::<i64>().ok())
        .collect())
}

/// True if a `loop_completed` marker already exists for this loop step,
/// using a structured equality predicate — this is the idempotency guard
/// the loop aggregator checks before emitting completion markers.
pub async fn has_loop_completed(
    pool: &DbPool,
    execution_id: i64,
    loop_name: &str,
) -> AppResult<bool> {
    let row: Option<(i32,)> = sqlx::query_as(
        r#"
        SELECT 1
        FROM noetl.event
        WHERE execution_id = $1
          AND loop_name = $2
          AND event_type = 'loop_completed'
        LIMIT 1
        "#,
    )
    .bind(execution_id)
    .bind(loop_name)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

/// Check if an event type exists for an execution.
pub async fn has_event_type(pool: &DbPool, execution_id: i64, event_type: &str) -> AppResult<bool> {
    let row: Option<(i32,)> = sqlx::query_as(
        r#"
        SELECT 1
        FROM noetl.event
        WHERE execution_id = $1 AND event_type = $2
        LIMIT 1
        "#,
    )
    .bind(execution_id)
    .bind(event_type)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

/// Check if execution has started.
pub async fn is_execution_started(pool: &DbPool, execution_id: i64) -> AppResult<bool> {
    has_event_type(pool, execution_id, "execution_start").await
}

/// Check if execution has completed (either terminal spelling).
pub async fn is_execution_completed(pool: &DbPool, execution_id: i64) -> AppResult<bool> {
    Ok(has_event_type(pool, execution_id, "execution_completed").await?
        || has_event_type(pool, execution_id, "execution_complete").await?)
}

/// Check if execution has an unresolved error event.
///
/// An `error` is only terminal if no later `error_resolved` event for the
/// same node supersedes it; callers that need that nuance should instead
/// compare event order directly, this is the cheap existence check used by
/// the status summary endpoint.
pub async fn has_unresolved_error(pool: &DbPool, execution_id: i64) -> AppResult<bool> {
    let row: Option<(i32,)> = sqlx::query_as(
        r#"
        SELECT 1
        FROM noetl.event e
        WHERE e.execution_id = $1
          AND e.event_type = 'error'
          AND NOT EXISTS (
              SELECT 1 FROM noetl.event r
              WHERE r.execution_id = e.execution_id
                AND r.event_type = 'error_resolved'
                AND r.node_name IS NOT DISTINCT FROM e.node_name
                AND r.id > e.id
          )
        LIMIT 1
        "#,
    )
    .bind(execution_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

/// Derive an execution's overall status purely from its event log.
pub async fn get_execution_status(pool: &DbPool, execution_id: i64) -> AppResult<String> {
    if has_unresolved_error(pool, execution_id).await? {
        return Ok("FAILED".to_string());
    }
    if is_execution_completed(pool, execution_id).await? {
        return Ok("COMPLETED".to_string());
    }
    if is_execution_started(pool, execution_id).await? {
        return Ok("RUNNING".to_string());
    }

    Ok("PENDING".to_string())
}

/// Count events for an execution.
pub async fn count_events(
    pool: &DbPool,
    execution_id: i64,
    event_type: Option<&str>,
) -> AppResult<i64> {
    let count: (i64,) = if let Some(et) = event_type {
        sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM noetl.event
            WHERE execution_id = $1 AND event_type = $2
            "#,
        )
        .bind(execution_id)
        .bind(et)
        .fetch_one(pool)
        .await?
    } else {
        sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM noetl.event
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_one(pool)
        .await?
    };

    Ok(count.0)
}

/// Get events since a specific timestamp.
pub async fn get_events_since(
    pool: &DbPool,
    execution_id: i64,
    since: DateTime<Utc>,
) -> AppResult<Vec<Event>> {
    let query = format!(
        "SELECT {} FROM noetl.event WHERE execution_id = $1 AND created_at > $2 ORDER BY id ASC",
        EVENT_COLUMNS
    );
    let events = sqlx::query_as::<_, Event>(&query)
        .bind(execution_id)
        .bind(since)
        .fetch_all(pool)
        .await?;

    Ok(events)
}

/// Get the execution-start event, which carries the initial workload.
pub async fn get_execution_start_event(
    pool: &DbPool,
    execution_id: i64,
) -> AppResult<Option<Event>> {
    get_latest_event(pool, execution_id, Some("execution_start")).await
}

/// Latest event matching `(execution_id, node_id, event_type)`, used by the
/// broker to check whether a step instance has already been dispatched or
/// completed before re-evaluating the frontier.
pub async fn get_latest_event_for_node(
    pool: &DbPool,
    execution_id: i64,
    node_id: &str,
    event_type: &str,
) -> AppResult<Option<Event>> {
    let query = format!(
        "SELECT {} FROM noetl.event WHERE execution_id = $1 AND node_id = $2 AND event_type = $3 ORDER BY id DESC LIMIT 1",
        EVENT_COLUMNS
    );
    let event = sqlx::query_as::<_, Event>(&query)
        .bind(execution_id)
        .bind(node_id)
        .bind(event_type)
        .fetch_optional(pool)
        .await?;

    Ok(event)
}

/// True if any of `event_types` has been recorded for `node_id`. The broker
/// uses this to decide whether a step instance is already in flight or done
/// before dispatching it again.
pub async fn has_event_for_node(
    pool: &DbPool,
    execution_id: i64,
    node_id: &str,
    event_types: &[&str],
) -> AppResult<bool> {
    let placeholders: Vec<String> = (3..=event_types.len() + 2)
        .map(|i| format!("${}", i))
        .collect();
    let in_clause = placeholders.join(", ");

    let query = format!(
        "SELECT 1 FROM noetl.event WHERE execution_id = $1 AND node_id = $2 AND event_type IN ({}) LIMIT 1",
        in_clause
    );

    let mut query_builder = sqlx::query_as::<_, (i32,)>(&query)
        .bind(execution_id)
        .bind(node_id);
    for et in event_types {
        query_builder = query_builder.bind(*et);
    }

    Ok(query_builder.fetch_optional(pool).await?.is_some())
}

/// All `loop_iteration` events recorded for a loop step, in emission order —
/// the aggregator's view of which iterations have been dispatched and which
/// have reported back.
pub async fn get_loop_iteration_events(
    pool: &DbPool,
    execution_id: i64,
    loop_name: &str,
) -> AppResult<Vec<Event>> {
    let query = format!(
        "SELECT {} FROM noetl.event WHERE execution_id = $1 AND loop_name = $2 AND event_type = 'loop_iteration' ORDER BY id ASC",
        EVENT_COLUMNS
    );
    let events = sqlx::query_as::<_, Event>(&query)
        .bind(execution_id)
        .bind(loop_name)
        .fetch_all(pool)
        .await?;

    Ok(events)
}

/// Count of iterations reported back (either an inline `action_completed`
/// iteration result or a nested-playbook `result` aggregation) for a loop
/// step, regardless of whether they spawned a child execution. Compared
/// against the iterable's length to decide whether a loop is complete.
pub async fn count_loop_results(
    pool: &DbPool,
    execution_id: i64,
    loop_name: &str,
) -> AppResult<i64> {
    let count: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(DISTINCT node_id)
        FROM noetl.event
        WHERE execution_id = $1
          AND loop_name = $2
          AND event_type IN ('action_completed', 'result')
        "#,
    )
    .bind(execution_id)
    .bind(loop_name)
    .fetch_one(pool)
    .await?;

    Ok(count.0)
}

#[cfg(test)]
mod tests {
    use super::EVENT_COLUMNS;

    #[test]
    fn test_event_columns_cover_new_fields() {
        for col in [
            "duration_ms",
            "error",
            "stack_trace",
            "loop_id",
            "loop_name",
            "iterator",
            "current_index",
            "current_item",
        ] {
            assert!(
                EVENT_COLUMNS.contains(col),
                "EVENT_COLUMNS missing `{}`",
                col
            );
        }
    }
}
