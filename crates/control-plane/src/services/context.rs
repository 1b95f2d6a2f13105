//! Context service: builds the render context for a running execution and
//! renders templates against it.
//!
//! The render context is reconstructed from the event log on every call
//! rather than cached, mirroring the broker's "recompute from the log"
//! design. Callers (the broker building a job payload, or the
//! `/api/context/render` debug endpoint) always see a context consistent
//! with the latest committed events.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::db::queries::{event::get_all_step_results, workload};
use crate::db::DbPool;
use crate::error::AppResult;
use crate::playbook::types::{Playbook, ToolDefinition, ToolKind};
use crate::template::TemplateRenderer;

/// Builds and renders the per-execution context described in the context
/// service spec: workload, prior step results (with `{status, data}`
/// envelopes unwrapped), workbook task-name aliasing, and a stable
/// `job.uuid`.
#[derive(Clone)]
pub struct ContextService {
    pool: DbPool,
    renderer: TemplateRenderer,
}

impl ContextService {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            renderer: TemplateRenderer::new(),
        }
    }

    /// Build the base render context for an execution.
    ///
    /// `playbook` is optional: when given, workbook steps whose declared
    /// task name differs from the step name get their result aliased under
    /// the step name too (a user-visible contract the original workers
    /// depend on).
    pub async fn build_context(
        &self,
        execution_id: i64,
        playbook: Option<&Playbook>,
    ) -> AppResult<HashMap<String, Value>> {
        let mut ctx: HashMap<String, Value> = HashMap::new();

        let workload = self.load_workload(execution_id).await?;
        if let Value::Object(fields) = &workload {
            for (k, v) in fields {
                ctx.insert(k.clone(), v.clone());
            }
        }
        ctx.insert("workload".to_string(), workload);
        ctx.insert("job".to_string(), json!({ "uuid": execution_id.to_string() }));

        let step_results = get_all_step_results(&self.pool, execution_id).await?;
        let mut results = serde_json::Map::new();
        for (node_name, result) in &step_results {
            results.insert(node_name.clone(), unwrap_envelope(result));
        }

        if let Some(playbook) = playbook {
            for step in &playbook.workflow {
                let task_name = workbook_task_name(step);
                if let Some(task_name) = task_name {
                    if task_name != step.step {
                        if let Some(value) = results.get(&task_name).cloned() {
                            results.insert(step.step.clone(), value);
                        }
                    }
                }
            }
        }

        ctx.insert("results".to_string(), Value::Object(results));
        Ok(ctx)
    }

    /// Load the workload: prefer the dedicated table, fall back to the
    /// `execution_start` event's `context.workload` field.
    async fn load_workload(&self, execution_id: i64) -> AppResult<Value> {
        if let Some(workload) = workload::get_workload(&self.pool, execution_id).await? {
            return Ok(workload);
        }

        let earliest = crate::db::queries::event::get_earliest_event(&self.pool, execution_id)
            .await?;

        Ok(earliest
            .and_then(|e| e.context)
            .and_then(|c| c.get("workload").cloned())
            .unwrap_or_else(|| json!({})))
    }

    /// Render a template string against a context, honoring the
    /// `{{ }}`/`{% %}` strict-undefined default. `work` blocks should be
    /// rendered with `strict = false` by callers building a job's `work`
    /// payload.
    pub fn render(
        &self,
        template: &str,
        context: &HashMap<String, Value>,
        strict: bool,
    ) -> AppResult<Value> {
        self.renderer.render_to_value_with_mode(template, context, strict)
    }

    /// Render a nested structure (object/array) recursively, honoring
    /// `strict`.
    pub fn render_value(
        &self,
        value: &Value,
        context: &HashMap<String, Value>,
        strict: bool,
    ) -> AppResult<Value> {
        self.renderer.render_value_with_mode(value, context, strict)
    }

    /// Render a step's job payload: `work` merges into the top-level
    /// context (without overwriting `results`), `task` may be re-parsed as
    /// JSON after rendering, everything else renders strict.
    pub fn render_job_payload(
        &self,
        payload: &Value,
        context: &HashMap<String, Value>,
    ) -> AppResult<Value> {
        render_job_payload_with(&self.renderer, payload, context)
    }
}

/// Implements `ContextService::render_job_payload` against a bare
/// `TemplateRenderer`, so the strict/non-strict split is unit-testable
/// without a database-backed `ContextService`.
fn render_job_payload_with(
    renderer: &TemplateRenderer,
    payload: &Value,
    context: &HashMap<String, Value>,
) -> AppResult<Value> {
    let Value::Object(map) = payload else {
        return renderer.render_value_with_mode(payload, context, true);
    };

    let mut rendered = serde_json::Map::new();
    for (key, value) in map {
        let strict_for_key = key != "work";
        // Non-strict fields (the `work` block) fall back to the unrendered
        // value on a render error instead of failing the whole step, so a
        // partially-resolved template still flows through to the worker's
        // own final render.
        let mut out = if strict_for_key {
            renderer.render_value_with_mode(value, context, true)?
        } else {
            renderer
                .render_value_with_mode(value, context, false)
                .unwrap_or_else(|_| value.clone())
        };
        if key == "task" {
            if let Value::String(s) = &out {
                if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                    out = parsed;
                }
            }
        }
        rendered.insert(key.clone(), out);
    }

    Ok(Value::Object(rendered))
}

/// Unwrap a `{status, data}` completion envelope, exposing `data` directly
/// under the step name. Results that aren't wrapped pass through unchanged.
fn unwrap_envelope(result: &Value) -> Value {
    match result {
        Value::Object(map) if map.contains_key("status") && map.contains_key("data") => {
            map.get("data").cloned().unwrap_or(Value::Null)
        }
        other => other.clone(),
    }
}

/// Resolve the workbook task name a step invokes, if it's a workbook step.
fn workbook_task_name(step: &crate::playbook::types::Step) -> Option<String> {
    let ToolDefinition::Single(spec) = &step.tool else {
        return None;
    };
    if spec.kind != ToolKind::Workbook {
        return None;
    }
    spec.extra
        .get("task")
        .or_else(|| spec.extra.get("name"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_envelope() {
        let wrapped = json!({"status": "COMPLETED", "data": {"value": 1}});
        assert_eq!(unwrap_envelope(&wrapped), json!({"value": 1}));

        let plain = json!({"value": 1});
        assert_eq!(unwrap_envelope(&plain), plain);
    }

    #[test]
    fn test_render_job_payload_strict_field_errors_on_missing_var() {
        let renderer = TemplateRenderer::new();
        let context = HashMap::new();
        let payload = json!({"url": "{{ missing_var }}"});
        assert!(render_job_payload_with(&renderer, &payload, &context).is_err());
    }

    #[test]
    fn test_render_job_payload_work_falls_back_to_unrendered_on_error() {
        let renderer = TemplateRenderer::new();
        let context = HashMap::new();
        let payload = json!({"work": "{{ 'not-a-number' | int }}"});
        let rendered = render_job_payload_with(&renderer, &payload, &context).unwrap();
        assert_eq!(rendered["work"], json!("{{ 'not-a-number' | int }}"));
    }

    #[test]
    fn test_render_job_payload_task_is_strict_and_reparsed_as_json() {
        let renderer = TemplateRenderer::new();
        let mut context = HashMap::new();
        context.insert("n".to_string(), json!(3));
        let payload = json!({"task": "{\"n\": {{ n }}}"});
        let rendered = render_job_payload_with(&renderer, &payload, &context).unwrap();
        assert_eq!(rendered["task"], json!({"n": 3}));
    }
}
