//! Workload table queries.
//!
//! `noetl.workload` holds the input payload an execution was started with,
//! keyed by `execution_id`. The context service prefers this table and
//! falls back to the `execution_start` event's `context.workload` field
//! when no row exists (e.g. for executions started before the table was
//! populated, or nested executions that only ever wrote the event).

use crate::db::DbPool;
use crate::error::AppResult;

/// Fetch the stored workload for an execution, if any.
pub async fn get_workload(
    pool: &DbPool,
    execution_id: i64,
) -> AppResult<Option<serde_json::Value>> {
    let row: Option<(serde_json::Value,)> =
        sqlx::query_as("SELECT workload FROM noetl.workload WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|(w,)| w))
}

/// Insert or replace the stored workload for an execution.
pub async fn upsert_workload(
    pool: &DbPool,
    execution_id: i64,
    workload: &serde_json::Value,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO noetl.workload (execution_id, workload)
        VALUES ($1, $2)
        ON CONFLICT (execution_id) DO UPDATE SET workload = EXCLUDED.workload
        "#,
    )
    .bind(execution_id)
    .bind(workload)
    .execute(pool)
    .await?;

    Ok(())
}
