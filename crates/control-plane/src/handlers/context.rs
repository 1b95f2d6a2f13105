//! Context rendering debug/introspection API.

use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::services::ContextService;

#[derive(Debug, Deserialize)]
pub struct RenderRequest {
    pub execution_id: i64,
    pub template: serde_json::Value,
    #[serde(default)]
    pub extra_context: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub strict: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct RenderResponse {
    pub rendered: serde_json::Value,
    pub context_keys: Vec<String>,
}

/// `POST /api/context/render`
pub async fn render(
    State(service): State<ContextService>,
    Json(request): Json<RenderRequest>,
) -> AppResult<Json<RenderResponse>> {
    let mut context = service.build_context(request.execution_id, None).await?;

    if let Some(extra) = request.extra_context {
        for (k, v) in extra {
            context.insert(k, v);
        }
    }

    let strict = request.strict.unwrap_or(true);
    let rendered = service.render_value(&request.template, &context, strict)?;
    let context_keys = context.keys().cloned().collect();

    Ok(Json(RenderResponse {
        rendered,
        context_keys,
    }))
}
