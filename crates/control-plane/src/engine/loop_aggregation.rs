//! Loop Aggregation Protocol.
//!
//! A loop (`iterator`) step fans out into either a queue job per item, or —
//! when its tool is `playbook` — a nested execution per item. Either way the
//! broker can't treat the loop step as done until every iteration has
//! reported back, and it needs one aggregated value to put in `results[<loop
//! step>]` for downstream `next[]` evaluation to use.
//!
//! Readiness and result selection both work off the event log only:
//! `context ->> 'child_execution_id'` is read back as a structured JSONB
//! field, never matched with `LIKE`, so a child id that happens to be a
//! prefix of another one can't cause a false positive.

use serde_json::Value;

use crate::db::queries::event as event_queries;
use crate::db::DbPool;
use crate::error::AppResult;
use crate::playbook::{Loop, ResultSelector, Step};
use crate::services::EventService;

#[derive(Clone)]
pub struct LoopAggregator {
    pool: DbPool,
    events: EventService,
}

impl LoopAggregator {
    pub fn new(pool: DbPool) -> Self {
        Self {
            events: EventService::new(pool.clone()),
            pool,
        }
    }

    /// Returns `true` once the loop step is finalized and its aggregated
    /// result is in the event log, dispatching the finalization events the
    /// first time every iteration is found complete. Returns `false` while
    /// iterations are still outstanding.
    pub async fn aggregate_if_ready(
        &self,
        execution_id: i64,
        catalog_id: i64,
        step: &Step,
    ) -> AppResult<bool> {
        if event_queries::has_loop_completed(&self.pool, execution_id, &step.step).await? {
            return Ok(true);
        }

        let loop_cfg = match &step.r#loop {
            Some(cfg) => cfg,
            None => return Ok(true), // not actually a loop step; nothing to aggregate
        };

        let iterations =
            event_queries::get_loop_iteration_events(&self.pool, execution_id, &step.step).await?;
        if iterations.is_empty() {
            return Ok(false); // dispatch hasn't happened yet
        }

        let total = iterations.len() as i64;
        let is_nested = iterations
            .iter()
            .any(|e| e.context.as_ref().and_then(|c| c.get("child_execution_id")).is_some());

        let completed = if is_nested {
            let mut done = 0i64;
            for iter_event in &iterations {
                let Some(child_id) = iter_event
                    .context
                    .as_ref()
                    .and_then(|c| c.get("child_execution_id"))
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<i64>().ok())
                else {
                    continue;
                };
                if self.events.is_execution_completed(child_id).await? {
                    self.emit_per_iteration_result(
                        execution_id,
                        catalog_id,
                        step,
                        iter_event,
                        child_id,
                    )
                    .await?;
                    done += 1;
                }
            }
            done
        } else {
            event_queries::count_loop_results(&self.pool, execution_id, &step.step).await?
        };

        if completed < total {
            return Ok(false);
        }

        let mut aggregated = Vec::with_capacity(iterations.len());
        for iter_event in &iterations {
            let child_execution_id = iter_event
                .context
                .as_ref()
                .and_then(|c| c.get("child_execution_id"))
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<i64>().ok());

            let node_id = iter_event.node_id.clone().unwrap_or_default();
            let value = self
                .resolve_iteration_result(execution_id, child_execution_id, &node_id, loop_cfg)
                .await?
                .unwrap_or(Value::Null);
            aggregated.push(value);
        }

        self.finalize_loop(execution_id, catalog_id, step, Value::Array(aggregated))
            .await?;

        Ok(true)
    }

    /// Lift a completed child execution's result onto the parent as a
    /// `result` event, per spec: node_id `{step}-iter-{child_execution_id}`,
    /// carrying the iteration's loop_id/iterator/current_index/current_item
    /// so downstream readers can correlate it with its `loop_iteration`.
    /// Idempotent: a second call for the same child is a no-op.
    async fn emit_per_iteration_result(
        &self,
        execution_id: i64,
        catalog_id: i64,
        step: &Step,
        iter_event: &crate::db::models::Event,
        child_execution_id: i64,
    ) -> AppResult<()> {
        let node_id = format!("{}-iter-{}", step.step, child_execution_id);
        if event_queries::has_event_for_node(&self.pool, execution_id, &node_id, &["result"]).await? {
            return Ok(());
        }

        let loop_cfg = step.r#loop.as_ref();
        let value = self
            .resolve_iteration_result(
                execution_id,
                Some(child_execution_id),
                &node_id,
                loop_cfg.expect("is_nested implies a loop config"),
            )
            .await?
            .unwrap_or(serde_json::Value::Null);

        let event_id = crate::db::next_id(&self.pool).await?;
        self.events
            .emit(crate::services::event::EmitEventRequest {
                event_id,
                execution_id,
                catalog_id,
                event_type: "result".to_string(),
                parent_event_id: Some(iter_event.event_id),
                parent_execution_id: Some(child_execution_id),
                node_id: Some(node_id),
                node_name: Some(step.step.clone()),
                node_type: Some("iterator".to_string()),
                status: "COMPLETED".to_string(),
                duration_ms: None,
                context: Some(serde_json::json!({"child_execution_id": child_execution_id.to_string()})),
                result: Some(serde_json::json!({"status": "COMPLETED", "data": value})),
                meta: None,
                error: None,
                stack_trace: None,
                loop_id: iter_event.loop_id.clone(),
                loop_name: Some(step.step.clone()),
                iterator: iter_event.iterator.clone(),
                current_index: iter_event.current_index,
                current_item: iter_event.current_item.clone(),
                worker_id: None,
                attempt: None,
            })
            .await?;

        Ok(())
    }

    /// Resolve one iteration's value by trying the policy's tiers in order,
    /// stopping at the first tier with data.
    async fn resolve_iteration_result(
        &self,
        execution_id: i64,
        child_execution_id: Option<i64>,
        node_id: &str,
        loop_cfg: &Loop,
    ) -> AppResult<Option<Value>> {
        let policy = loop_cfg.result_policy.clone().unwrap_or_default();

        for tier in &policy.order {
            let resolved = match tier {
                ResultSelector::ExecutionComplete => match child_execution_id {
                    Some(child_id) => self.terminal_result(child_id).await?,
                    None => None,
                },
                ResultSelector::ReturnStep => match (&loop_cfg.return_step, child_execution_id) {
                    (Some(return_step), Some(child_id)) => {
                        event_queries::get_step_result(&self.pool, child_id, return_step).await?
                    }
                    _ => None,
                },
                ResultSelector::NamedSteps => {
                    let target = child_execution_id.unwrap_or(execution_id);
                    let mut found = None;
                    for name in &policy.named_steps {
                        if let Some(result) =
                            event_queries::get_step_result(&self.pool, target, name).await?
                        {
                            found = Some(result);
                            break;
                        }
                    }
                    found
                }
                ResultSelector::AnyCompleted => match child_execution_id {
                    Some(child_id) => {
                        let results = event_queries::get_all_step_results(&self.pool, child_id).await?;
                        results.into_iter().next().map(|(_, v)| v)
                    }
                    None => event_queries::get_step_result(&self.pool, execution_id, node_id).await?,
                },
                ResultSelector::ResultEvent => {
                    let target = child_execution_id.unwrap_or(execution_id);
                    let events =
                        event_queries::get_events_by_types(&self.pool, target, &["result"]).await?;
                    events.into_iter().next_back().and_then(|e| e.result)
                }
                ResultSelector::EndStep => match child_execution_id {
                    Some(child_id) => {
                        event_queries::get_step_result(&self.pool, child_id, "end").await?
                    }
                    None => None,
                },
            };

            if resolved.is_some() {
                return Ok(resolved);
            }
        }

        Ok(None)
    }

    /// Count of `loop_iteration` events emitted for this step, used as the
    /// `context.total_iterations` value on the finalization markers.
    async fn count_loop_iterations(&self, execution_id: i64, step_name: &str) -> AppResult<i64> {
        let iterations =
            event_queries::get_loop_iteration_events(&self.pool, execution_id, step_name).await?;
        Ok(iterations.len() as i64)
    }

    /// The child's terminal result, read from whichever terminal spelling
    /// was actually emitted.
    async fn terminal_result(&self, child_execution_id: i64) -> AppResult<Option<Value>> {
        for event_type in ["execution_completed", "execution_complete"] {
            if let Some(event) = self
                .events
                .get_latest_event(child_execution_id, Some(event_type))
                .await?
            {
                if event.result.is_some() {
                    return Ok(event.result);
                }
            }
        }
        Ok(None)
    }

    /// Emit the loop step's finalization: the same `action_completed` /
    /// `result` markers an ordinary step would get, plus `loop_completed` —
    /// the authoritative signal downstream readers key on so they don't have
    /// to re-run this aggregation to know the loop is done.
    async fn finalize_loop(
        &self,
        execution_id: i64,
        catalog_id: i64,
        step: &Step,
        aggregated: Value,
    ) -> AppResult<()> {
        let parent_event_id = event_queries::get_latest_event_for_node(
            &self.pool,
            execution_id,
            &step.step,
            "step_started",
        )
        .await?
        .map(|e| e.event_id);

        let total_iterations = self
            .count_loop_iterations(execution_id, &step.step)
            .await?;
        let result = serde_json::json!({
            "status": "COMPLETED",
            "data": {
                "results": aggregated.clone(),
                "result": aggregated,
                "count": total_iterations,
            },
        });
        let context = serde_json::json!({
            "loop_completed": true,
            "total_iterations": total_iterations,
        });

        for event_type in ["action_completed", "result", "loop_completed"] {
            let event_id = crate::db::next_id(&self.pool).await?;
            self.events
                .emit(crate::services::event::EmitEventRequest {
                    event_id,
                    execution_id,
                    catalog_id,
                    event_type: event_type.to_string(),
                    parent_event_id,
                    parent_execution_id: None,
                    node_id: Some(step.step.clone()),
                    node_name: Some(step.step.clone()),
                    node_type: Some("iterator".to_string()),
                    status: "COMPLETED".to_string(),
                    duration_ms: None,
                    context: Some(context.clone()),
                    result: Some(result.clone()),
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

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::ResultSelectionPolicy;

    #[test]
    fn test_default_policy_tries_execution_complete_first() {
        let policy = ResultSelectionPolicy::default();
        assert_eq!(policy.order.first(), Some(&ResultSelector::ExecutionComplete));
    }

    #[test]
    fn test_finalization_result_carries_results_key() {
        let aggregated = serde_json::json!([1, 4, 9, 16]);
        let total_iterations = 4i64;
        let result = serde_json::json!({
            "status": "COMPLETED",
            "data": {
                "results": aggregated.clone(),
                "result": aggregated,
                "count": total_iterations,
            },
        });
        assert_eq!(result["data"]["results"], serde_json::json!([1, 4, 9, 16]));
        assert_eq!(result["data"]["count"], 4);
    }

    #[test]
    fn test_finalization_context_carries_total_iterations() {
        let context = serde_json::json!({"loop_completed": true, "total_iterations": 4});
        assert_eq!(context["total_iterations"], 4);
        assert_eq!(context["loop_completed"], true);
    }

    #[test]
    fn test_per_iteration_node_id_format() {
        let step_name = "fan_out";
        let child_execution_id = 987654321i64;
        let node_id = format!("{}-iter-{}", step_name, child_execution_id);
        assert_eq!(node_id, "fan_out-iter-987654321");
    }
}
