//! Event append/read API handlers.
//!
//! `POST /api/events` is the one write path every worker and the broker
//! itself use to extend an execution's log. Appending an event is followed
//! by an opportunistic broker re-evaluation — the dispatch decision always
//! comes from re-reading the log, never from anything carried in this
//! request.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::db::models::{EventCreateRequest, EventListResponse};
use crate::error::AppResult;
use crate::services::event::EmitEventResponse;
use crate::services::EventService;
use crate::state::AppState;

/// `POST /api/events`
pub async fn append(
    State(state): State<AppState>,
    Json(request): Json<EventCreateRequest>,
) -> AppResult<Json<EmitEventResponse>> {
    let events = EventService::new(state.db.clone());
    let execution_id = request.execution_id;
    let event_id = match request.event_id {
        Some(id) => id,
        None => crate::db::next_id(&state.db).await?,
    };

    let response = events
        .emit(crate::services::event::EmitEventRequest {
            event_id,
            execution_id,
            catalog_id: request.catalog_id,
            event_type: request.event_type,
            parent_event_id: request.parent_event_id,
            parent_execution_id: request.parent_execution_id,
            node_id: request.node_id,
            node_name: request.node_name,
            node_type: request.node_type,
            status: request.status,
            duration_ms: request.duration_ms,
            context: request.context,
            result: request.result,
            meta: request.meta,
            error: request.error,
            stack_trace: request.stack_trace,
            loop_id: request.loop_id,
            loop_name: request.loop_name,
            iterator: request.iterator,
            current_index: request.current_index,
            current_item: request.current_item,
            worker_id: request.worker_id,
            attempt: request.attempt,
        })
        .await?;

    state.broker.evaluate_for_execution(execution_id).await?;

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub event_type: Option<String>,
    pub limit: Option<i64>,
}

/// `GET /api/events/by-execution/{execution_id}`
pub async fn by_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
    Query(query): Query<ListEventsQuery>,
) -> AppResult<Json<EventListResponse>> {
    let events = EventService::new(state.db.clone());
    let list = events
        .get_events(execution_id, query.event_type.as_deref(), query.limit)
        .await?;

    Ok(Json(EventListResponse {
        total: list.len() as i64,
        events: list.into_iter().map(Into::into).collect(),
    }))
}

/// `GET /api/events/by-id/{event_id}`
pub async fn by_id(
    State(state): State<AppState>,
    Path(event_id): Path<i64>,
) -> AppResult<Json<crate::db::models::EventResponse>> {
    let events = EventService::new(state.db.clone());
    let event = events
        .get_event(event_id)
        .await?
        .ok_or_else(|| crate::error::AppError::NotFound(format!("event {event_id} not found")))?;

    Ok(Json(event.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_events_query_defaults() {
        let query: ListEventsQuery = serde_json::from_str("{}").unwrap();
        assert!(query.event_type.is_none());
        assert!(query.limit.is_none());
    }
}
