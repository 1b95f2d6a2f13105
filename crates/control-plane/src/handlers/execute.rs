//! Execution API handlers.
//!
//! Starts a playbook execution by writing its `execution_start` event, then
//! hands off to the broker to dispatch whatever is reachable from that
//! single event. All subsequent progress is driven by events handlers
//! triggering the broker again — there is no separate orchestration loop.

use std::collections::HashMap;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Request to start playbook execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Playbook catalog path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Catalog ID (alternative to path).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<i64>,
    /// Playbook version, or "latest". Ignored when `catalog_id` is set.
    #[serde(default)]
    pub version: Option<String>,
    /// Input payload/workload.
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    /// Parent execution ID (for nested executions).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<i64>,
}

impl ExecuteRequest {
    /// Validate the request.
    pub fn validate(&self) -> Result<(), String> {
        if self.path.is_none() && self.catalog_id.is_none() {
            return Err("Either 'path' or 'catalog_id' must be provided".to_string());
        }
        Ok(())
    }
}

/// Response for starting execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub execution_id: String,
    pub status: String,
}

/// `POST /api/executions/run`
pub async fn run(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> AppResult<Json<ExecuteResponse>> {
    request.validate().map_err(AppError::Validation)?;

    let catalog = resolve_catalog(&state, &request).await?;

    info!(
        path = %catalog.path,
        catalog_id = catalog.id,
        "starting execution"
    );

    let execution_id = crate::db::next_id(&state.db).await?;
    let start_event_id = crate::db::next_id(&state.db).await?;

    let workload = serde_json::to_value(&request.payload)
        .map_err(|e| AppError::Internal(format!("failed to serialize payload: {e}")))?;

    let events = crate::services::EventService::new(state.db.clone());
    events
        .emit_execution_start(
            start_event_id,
            execution_id,
            catalog.id,
            &catalog.path,
            catalog.version,
            &workload,
            request.parent_execution_id,
            None,
            None,
        )
        .await?;

    state.broker.evaluate_for_execution(execution_id).await?;

    Ok(Json(ExecuteResponse {
        execution_id: execution_id.to_string(),
        status: "started".to_string(),
    }))
}

async fn resolve_catalog(
    state: &AppState,
    request: &ExecuteRequest,
) -> AppResult<crate::db::models::CatalogEntry> {
    if let Some(catalog_id) = request.catalog_id {
        return crate::db::queries::catalog::get_catalog_by_id(&state.db, catalog_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("catalog entry {catalog_id} not found")));
    }

    let path = request
        .path
        .as_ref()
        .ok_or_else(|| AppError::Validation("either path or catalog_id is required".to_string()))?;

    match request.version.as_deref() {
        Some(v) if v != "latest" => {
            let version: i32 = v
                .parse()
                .map_err(|_| AppError::Validation(format!("invalid version '{v}'")))?;
            crate::db::queries::catalog::get_catalog_by_path_version(&state.db, path, version)
                .await?
        }
        _ => crate::db::queries::catalog::get_catalog_latest(&state.db, path).await?,
    }
    .ok_or_else(|| AppError::NotFound(format!("playbook '{path}' not found")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_request_validation() {
        let request = ExecuteRequest {
            path: None,
            catalog_id: None,
            version: None,
            payload: HashMap::new(),
            parent_execution_id: None,
        };
        assert!(request.validate().is_err());

        let request = ExecuteRequest {
            path: Some("test/playbook".to_string()),
            catalog_id: None,
            version: None,
            payload: HashMap::new(),
            parent_execution_id: None,
        };
        assert!(request.validate().is_ok());

        let request = ExecuteRequest {
            path: None,
            catalog_id: Some(12345),
            version: None,
            payload: HashMap::new(),
            parent_execution_id: None,
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_execute_response_serialization() {
        let response = ExecuteResponse {
            execution_id: "12345".to_string(),
            status: "started".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("12345"));
        assert!(json.contains("started"));
    }
}
