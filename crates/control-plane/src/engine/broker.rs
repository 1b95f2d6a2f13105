//! The broker: the single engine that advances every execution.
//!
//! `evaluate_for_execution` recomputes an execution's frontier from its
//! event log and playbook definition on every call. It holds no state
//! across invocations — two concurrent calls for the same execution, or a
//! redundant call after the execution already finished, are both safe and
//! idempotent. This is what lets the broker be triggered opportunistically
//! (after every event append, on a timer, by a worker's completion report)
//! without any coordinator owning a given execution.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::db::queries::catalog as catalog_queries;
use crate::db::queries::event as event_queries;
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::playbook::{parse_playbook, Step, StepType, ToolCall, ToolDefinition};
use crate::services::{ContextService, EventService, QueueService};

use super::evaluator::ConditionEvaluator;
use super::loop_aggregation::LoopAggregator;
use super::state::WorkflowState;

/// Retry budget handed to every dispatched action. The queue service owns
/// the actual retry/dead-letter bookkeeping; this is just the ceiling.
const DEFAULT_MAX_ATTEMPTS: i32 = 5;

#[derive(Clone)]
pub struct Broker {
    pool: DbPool,
    events: EventService,
    queue: QueueService,
    context: ContextService,
    evaluator: ConditionEvaluator,
    loop_aggregator: LoopAggregator,
}

impl Broker {
    pub fn new(pool: DbPool) -> Self {
        Self {
            events: EventService::new(pool.clone()),
            queue: QueueService::new(pool.clone()),
            context: ContextService::new(pool.clone()),
            evaluator: ConditionEvaluator::new(),
            loop_aggregator: LoopAggregator::new(pool.clone()),
            pool,
        }
    }

    /// Advance `execution_id` as far as the current event log allows.
    ///
    /// 1. Short-circuit if the execution already reached a terminal state.
    /// 2. Reconstruct state from the event log.
    /// 3. Load the playbook and recompute the frontier: every step whose
    ///    predecessors are satisfied but which hasn't itself been dispatched.
    /// 4. Dispatch each frontier step per its node type.
    /// 5. If nothing is left running and nothing new was dispatched, the
    ///    execution is done — emit the terminal marker.
    pub async fn evaluate_for_execution(&self, execution_id: i64) -> AppResult<()> {
        if self.events.is_execution_completed(execution_id).await? {
            return Ok(());
        }

        let events = self.events.get_events(execution_id, None, None).await?;
        let Some(state) = WorkflowState::from_events(&events) else {
            debug!(execution_id, "no events yet, nothing to evaluate");
            return Ok(());
        };

        if self.events.has_unresolved_error(execution_id).await? {
            return self.finalize(execution_id, "FAILED", None, None).await;
        }

        let catalog = catalog_queries::get_catalog_by_id(&self.pool, state.catalog_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("catalog entry {} not found", state.catalog_id))
            })?;
        let playbook = parse_playbook(&catalog.content)?;

        let context = self
            .context
            .build_context(execution_id, Some(&playbook))
            .await?;

        if state.steps.is_empty() {
            let start = playbook
                .get_step("start")
                .ok_or_else(|| AppError::Validation("playbook has no 'start' step".to_string()))?;
            self.dispatch_step(execution_id, state.catalog_id, 0, start, &context)
                .await?;
            return Ok(());
        }

        let mut anything_pending = false;

        for step in &playbook.workflow {
            if step.step_type == StepType::End {
                continue;
            }

            let known = state.steps.contains_key(&step.step);
            if !known {
                continue; // not yet reachable
            }
            if !state.is_step_completed(&step.step) {
                if !state.is_step_failed(&step.step) {
                    anything_pending = true;
                }
                continue;
            }

            if step.step_type == StepType::Iterator {
                let ready = self
                    .loop_aggregator
                    .aggregate_if_ready(execution_id, state.catalog_id, step)
                    .await?;
                if !ready {
                    anything_pending = true;
                    continue;
                }
            }

            let context = self
                .context
                .build_context(execution_id, Some(&playbook))
                .await?;

            for transition in self.evaluator.evaluate_next_transitions(step, &context)? {
                if !transition.matched {
                    continue;
                }
                let Some(next_name) = &transition.next_step else {
                    continue;
                };
                let Some(next_step) = playbook.get_step(next_name) else {
                    warn!(execution_id, next_name, "next references unknown step");
                    continue;
                };

                if state.is_step_done(next_name)
                    || state.running_steps().contains(&next_name.as_str())
                {
                    continue;
                }

                anything_pending = true;

                let mut branch_context = context.clone();
                if let Some(serde_json::Value::Object(params)) = &transition.with_params {
                    for (k, v) in params {
                        branch_context.insert(k.clone(), v.clone());
                    }
                }

                let parent_event_id = event_queries::get_latest_event_for_node(
                    &self.pool,
                    execution_id,
                    &step.step,
                    "step_started",
                )
                .await?
                .map(|e| e.event_id)
                .unwrap_or(0);

                self.dispatch_step(
                    execution_id,
                    state.catalog_id,
                    parent_event_id,
                    next_step,
                    &branch_context,
                )
                .await?;
            }
        }

        if !anything_pending {
            let failed = state
                .steps
                .values()
                .any(|s| matches!(s.state, super::state::StepState::Failed));
            let status = if failed { "FAILED" } else { "COMPLETED" };
            let result = resolve_final_result(&state, &playbook);
            self.finalize(execution_id, status, None, result).await?;
        }

        Ok(())
    }

    /// Dispatch a single step: skip if its `when` guard fails or it's
    /// already been dispatched, otherwise emit `step_started` and route to
    /// the node-type-specific dispatch.
    async fn dispatch_step(
        &self,
        execution_id: i64,
        catalog_id: i64,
        parent_event_id: i64,
        step: &Step,
        context: &HashMap<String, serde_json::Value>,
    ) -> AppResult<()> {
        if event_queries::has_event_for_node(
            &self.pool,
            execution_id,
            &step.step,
            &["step_started"],
        )
        .await?
        {
            return Ok(());
        }

        if !self.evaluator.evaluate_step_when(step, context)? {
            debug!(execution_id, step = %step.step, "step skipped by when guard");
            let event_id = crate::db::next_id(&self.pool).await?;
            self.events
                .emit(crate::services::event::EmitEventRequest {
                    event_id,
                    execution_id,
                    catalog_id,
                    event_type: "action_completed".to_string(),
                    parent_event_id: Some(parent_event_id),
                    parent_execution_id: None,
                    node_id: Some(step.step.clone()),
                    node_name: Some(step.step.clone()),
                    node_type: Some(step_type_name(step.step_type)),
                    status: "SKIPPED".to_string(),
                    duration_ms: None,
                    context: None,
                    result: Some(serde_json::json!({"status": "SKIPPED", "data": null})),
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
                })
                .await?;
            return Ok(());
        }

        let step_event_id = crate::db::next_id(&self.pool).await?;
        self.events
            .emit_step_started(
                step_event_id,
                execution_id,
                catalog_id,
                parent_event_id,
                &step.step,
                &step.step,
                &step_type_name(step.step_type),
                Some(&serde_json::to_value(context).unwrap_or(serde_json::json!({}))),
            )
            .await?;

        match step.step_type {
            StepType::Iterator => {
                self.dispatch_loop(execution_id, catalog_id, step_event_id, step, context)
                    .await
            }
            StepType::Playbook => {
                self.dispatch_nested_playbook(
                    execution_id,
                    catalog_id,
                    step_event_id,
                    step,
                    context,
                    None,
                )
                .await
            }
            StepType::Task | StepType::Workbook | StepType::End => {
                self.dispatch_action(execution_id, catalog_id, step_event_id, step, context)
                    .await
            }
        }
    }

    /// Enqueue a single task/workbook step as one queue job.
    async fn dispatch_action(
        &self,
        execution_id: i64,
        catalog_id: i64,
        parent_event_id: i64,
        step: &Step,
        context: &HashMap<String, serde_json::Value>,
    ) -> AppResult<()> {
        let action = match self.render_action(&step.tool, context) {
            Ok(action) => action,
            Err(err) => {
                return self
                    .emit_render_failure(execution_id, catalog_id, parent_event_id, step, &err)
                    .await;
            }
        };

        let action_event_id = crate::db::next_id(&self.pool).await?;
        self.events
            .emit_action_started(
                action_event_id,
                execution_id,
                catalog_id,
                parent_event_id,
                &step.step,
                &action,
            )
            .await?;

        let ctx_value = serde_json::to_value(context).unwrap_or(serde_json::json!({}));
        self.queue
            .enqueue(
                execution_id,
                catalog_id,
                &step.step,
                &action,
                &ctx_value,
                None,
                Some(DEFAULT_MAX_ATTEMPTS),
                None,
            )
            .await?;

        Ok(())
    }

    /// Spawn every iteration of a loop step: a nested execution when the
    /// step's tool is `playbook`, otherwise a queue job per item with the
    /// iterator variable bound into its context.
    async fn dispatch_loop(
        &self,
        execution_id: i64,
        catalog_id: i64,
        parent_event_id: i64,
        step: &Step,
        context: &HashMap<String, serde_json::Value>,
    ) -> AppResult<()> {
        let loop_cfg = step.r#loop.as_ref().ok_or_else(|| {
            AppError::Validation(format!(
                "step '{}' is type iterator but has no loop config",
                step.step
            ))
        })?;

        let items = self.evaluator.evaluate_loop(&loop_cfg.in_expr, context)?;
        let is_nested_playbook = matches!(&step.tool, ToolDefinition::Single(spec) if spec.kind == crate::playbook::ToolKind::Playbook);

        for (index, item) in items.iter().enumerate() {
            let node_id = format!("{}[{}]", step.step, index);

            if event_queries::has_event_for_node(
                &self.pool,
                execution_id,
                &node_id,
                &["loop_iteration"],
            )
            .await?
            {
                continue;
            }

            let mut item_context = context.clone();
            item_context.insert(loop_cfg.iterator.clone(), item.clone());
            item_context.insert("_index".to_string(), serde_json::json!(index));
            item_context.insert("_total".to_string(), serde_json::json!(items.len()));

            let iter_event_id = crate::db::next_id(&self.pool).await?;
            self.events
                .emit(crate::services::event::EmitEventRequest {
                    event_id: iter_event_id,
                    execution_id,
                    catalog_id,
                    event_type: "loop_iteration".to_string(),
                    parent_event_id: Some(parent_event_id),
                    parent_execution_id: None,
                    node_id: Some(node_id.clone()),
                    node_name: Some(step.step.clone()),
                    node_type: Some("iterator".to_string()),
                    status: "IN_PROGRESS".to_string(),
                    duration_ms: None,
                    context: Some(serde_json::json!({"child_execution_id": serde_json::Value::Null})),
                    result: None,
                    meta: None,
                    error: None,
                    stack_trace: None,
                    loop_id: None,
                    loop_name: Some(step.step.clone()),
                    iterator: Some(loop_cfg.iterator.clone()),
                    current_index: Some(index as i32),
                    current_item: Some(item.clone()),
                    worker_id: None,
                    attempt: None,
                })
                .await?;

            if is_nested_playbook {
                self.dispatch_nested_playbook(
                    execution_id,
                    catalog_id,
                    iter_event_id,
                    step,
                    &item_context,
                    Some(&node_id),
                )
                .await?;
            } else {
                let action = match self.render_action(&step.tool, &item_context) {
                    Ok(action) => action,
                    Err(err) => {
                        self.emit_render_failure(
                            execution_id,
                            catalog_id,
                            iter_event_id,
                            step,
                            &err,
                        )
                        .await?;
                        continue;
                    }
                };
                let ctx_value = serde_json::to_value(&item_context).unwrap_or(serde_json::json!({}));
                self.queue
                    .enqueue(
                        execution_id,
                        catalog_id,
                        &node_id,
                        &action,
                        &ctx_value,
                        None,
                        Some(DEFAULT_MAX_ATTEMPTS),
                        None,
                    )
                    .await?;
            }
        }

        Ok(())
    }

    /// Start a nested execution for a `playbook`-kind step (or one loop
    /// iteration of one). The broker never waits on it inline; the nested
    /// execution's own `execution_complete` event is what the loop
    /// aggregator (or, for a non-loop nested call, the `next[]` evaluation
    /// above) reacts to.
    async fn dispatch_nested_playbook(
        &self,
        execution_id: i64,
        catalog_id: i64,
        parent_event_id: i64,
        step: &Step,
        context: &HashMap<String, serde_json::Value>,
        loop_node_id: Option<&str>,
    ) -> AppResult<()> {
        let ToolDefinition::Single(spec) = &step.tool else {
            return Err(AppError::Validation(format!(
                "step '{}' is type playbook but tool is a pipeline",
                step.step
            )));
        };

        let path = spec
            .extra
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AppError::Validation(format!("step '{}' playbook tool missing 'path'", step.step))
            })?;
        let version = spec.extra.get("version").and_then(|v| v.as_str());

        let child_catalog = match version {
            Some(v) if v != "latest" => {
                let v: i32 = v
                    .parse()
                    .map_err(|_| AppError::Validation("invalid playbook version".to_string()))?;
                catalog_queries::get_catalog_by_path_version(&self.pool, path, v).await?
            }
            _ => catalog_queries::get_catalog_latest(&self.pool, path).await?,
        }
        .ok_or_else(|| AppError::NotFound(format!("playbook '{}' not found", path)))?;

        let args = spec
            .extra
            .get("args")
            .cloned()
            .unwrap_or(serde_json::json!({}));
        let workload = self.context.render_value(&args, context, false)?;

        let child_execution_id = crate::db::next_id(&self.pool).await?;
        let start_event_id = crate::db::next_id(&self.pool).await?;

        self.events
            .emit_execution_start(
                start_event_id,
                child_execution_id,
                child_catalog.id,
                path,
                child_catalog.version,
                &workload,
                Some(execution_id),
                Some(parent_event_id),
                None,
            )
            .await?;

        if let Some(node_id) = loop_node_id {
            let backfill_event_id = crate::db::next_id(&self.pool).await?;
            self.events
                .emit(crate::services::event::EmitEventRequest {
                    event_id: backfill_event_id,
                    execution_id,
                    catalog_id,
                    event_type: "loop_iteration".to_string(),
                    parent_event_id: Some(parent_event_id),
                    parent_execution_id: None,
                    node_id: Some(format!("{node_id}#child")),
                    node_name: Some(step.step.clone()),
                    node_type: Some("iterator".to_string()),
                    status: "IN_PROGRESS".to_string(),
                    duration_ms: None,
                    context: Some(serde_json::json!({
                        "child_execution_id": child_execution_id.to_string(),
                    })),
                    result: None,
                    meta: None,
                    error: None,
                    stack_trace: None,
                    loop_id: None,
                    loop_name: Some(step.step.clone()),
                    iterator: None,
                    current_index: None,
                    current_item: None,
                    worker_id: None,
                    attempt: None,
                })
                .await?;
        }

        Box::pin(self.evaluate_for_execution(child_execution_id)).await
    }

    /// Render a step's tool into the action JSON handed to a worker, via the
    /// same `work`=non-strict/everything-else=strict split
    /// `ContextService::render_job_payload` applies to job payloads: an
    /// unresolved `{{ var }}` reference outside a `work` block is a
    /// rendering error, not a silently-empty string.
    fn render_action(
        &self,
        tool: &ToolDefinition,
        context: &HashMap<String, serde_json::Value>,
    ) -> AppResult<serde_json::Value> {
        match tool {
            ToolDefinition::Single(spec) => {
                let call = ToolCall::from_spec(spec);
                let value = serde_json::to_value(&call)?;
                self.context.render_job_payload(&value, context)
            }
            ToolDefinition::Pipeline(tasks) => {
                let value = serde_json::json!({
                    "kind": "task_sequence",
                    "tasks": tasks,
                });
                self.context.render_job_payload(&value, context)
            }
        }
    }

    /// Emit `action_failed` for a step whose job payload failed to render in
    /// strict mode (spec.md §7: "Rendering error in strict mode: ...
    /// error_type=template_rendering"). The step is left failed; the next
    /// evaluation pass sees it via `state.is_step_failed` and the execution
    /// finalizes as FAILED once nothing else is pending.
    async fn emit_render_failure(
        &self,
        execution_id: i64,
        catalog_id: i64,
        parent_event_id: i64,
        step: &Step,
        err: &AppError,
    ) -> AppResult<()> {
        warn!(execution_id, step = %step.step, error = %err, "step job payload failed to render");
        let event_id = crate::db::next_id(&self.pool).await?;
        self.events
            .emit(crate::services::event::EmitEventRequest {
                event_id,
                execution_id,
                catalog_id,
                event_type: "action_failed".to_string(),
                parent_event_id: Some(parent_event_id),
                parent_execution_id: None,
                node_id: Some(step.step.clone()),
                node_name: Some(step.step.clone()),
                node_type: Some(step_type_name(step.step_type)),
                status: "FAILED".to_string(),
                duration_ms: None,
                context: None,
                result: None,
                meta: Some(serde_json::json!({"error_type": "template_rendering"})),
                error: Some(err.to_string()),
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
        Ok(())
    }

    /// Emit the terminal marker for an execution. Emits both spellings the
    /// rest of the system checks for (`execution_completed` is the primary
    /// one; `execution_complete` mirrors it for callers that only know the
    /// other spelling), so every reader sees a terminal state regardless of
    /// which one it happens to query for.
    async fn finalize(
        &self,
        execution_id: i64,
        status: &str,
        error: Option<&str>,
        result: Option<serde_json::Value>,
    ) -> AppResult<()> {
        let parent_event_id = self
            .events
            .get_latest_event(execution_id, None)
            .await?
            .map(|e| e.event_id);

        let catalog_id = self
            .events
            .get_execution_start_event(execution_id)
            .await?
            .map(|e| e.catalog_id)
            .ok_or_else(|| AppError::NotFound(format!("no start event for {execution_id}")))?;

        let result = result.unwrap_or_else(|| serde_json::json!({"status": status}));

        for event_type in ["execution_completed", "execution_complete"] {
            let event_id = crate::db::next_id(&self.pool).await?;
            self.events
                .emit(crate::services::event::EmitEventRequest {
                    event_id,
                    execution_id,
                    catalog_id,
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
}

/// Pick the execution's aggregated result per spec.md §4.3 step 5: the
/// `end` step's result if the playbook has one and it ran, otherwise the
/// most recently completed step's result. Both are unwrapped from their
/// `{status, data}` completion envelope, matching the round-trip contract
/// (`execution_completed(result={hello: world})` for a step whose action
/// result was `{status: success, data: {hello: world}}`).
fn resolve_final_result(
    state: &WorkflowState,
    playbook: &crate::playbook::Playbook,
) -> Option<serde_json::Value> {
    if let Some(end_step) = playbook
        .workflow
        .iter()
        .find(|s| s.step_type == StepType::End)
    {
        if let Some(result) = state
            .steps
            .get(&end_step.step)
            .and_then(|info| info.result.as_ref())
        {
            return Some(unwrap_result(result));
        }
    }

    state
        .steps
        .values()
        .filter(|info| matches!(info.state, super::state::StepState::Completed))
        .filter_map(|info| info.completed_at.map(|at| (at, &info.result)))
        .max_by_key(|(at, _)| *at)
        .and_then(|(_, result)| result.as_ref())
        .map(unwrap_result)
}

/// Unwrap a `{status, data}` completion envelope, mirroring
/// `ContextService`'s rule for exposing `results.<step>` directly.
fn unwrap_result(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) if map.contains_key("status") && map.contains_key("data") => {
            map.get("data").cloned().unwrap_or(serde_json::Value::Null)
        }
        other => other.clone(),
    }
}

fn step_type_name(step_type: StepType) -> String {
    match step_type {
        StepType::Task => "task",
        StepType::Workbook => "workbook",
        StepType::Iterator => "iterator",
        StepType::Playbook => "playbook",
        StepType::End => "end",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_type_name() {
        assert_eq!(step_type_name(StepType::Task), "task");
        assert_eq!(step_type_name(StepType::Iterator), "iterator");
        assert_eq!(step_type_name(StepType::End), "end");
    }

    #[test]
    fn test_unwrap_result_strips_envelope() {
        let wrapped = serde_json::json!({"status": "success", "data": {"hello": "world"}});
        assert_eq!(unwrap_result(&wrapped), serde_json::json!({"hello": "world"}));

        let plain = serde_json::json!({"x": 8});
        assert_eq!(unwrap_result(&plain), plain);
    }
}
