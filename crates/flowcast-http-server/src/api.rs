//! REST surface: stream details, history pages, health
//!
//! Read-only endpoints next to the streaming transports. History pages come
//! straight from the store (limit capped at 1000); detail and health payloads
//! come from the broker facade.

use std::collections::HashMap;

use hyper::{Response, StatusCode};
use serde_json::{Value, json};
use tracing::warn;

use crate::handler::{FlowcastHandler, history_query};
use crate::response::{BoxedBody, error_response, json_response};

/// `GET /api/health`: liveness only
pub fn health(handler: &FlowcastHandler, request_id: &str) -> Response<BoxedBody> {
    if handler.broker.is_live() {
        json_response(StatusCode::OK, &json!({"status": "ok"}), request_id)
    } else {
        json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({"status": "shutting_down"}),
            request_id,
        )
    }
}

/// `GET /api/health/detailed`: full report with dependency status
pub async fn health_detailed(handler: &FlowcastHandler, request_id: &str) -> Response<BoxedBody> {
    let health = handler.broker.detailed_health().await;
    let status = if health.store.reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, &health, request_id)
}

/// `GET /api/streams/{streamId}`: details for one stream
pub async fn stream_details(
    handler: &FlowcastHandler,
    stream_id: &str,
    request_id: &str,
) -> Response<BoxedBody> {
    match handler.broker.stream_details(stream_id).await {
        Ok(details) => json_response(StatusCode::OK, &details, request_id),
        Err(err) => error_response(&err, request_id),
    }
}

/// `GET /api/streams/{streamId}/events`: paginated history
pub async fn stream_events(
    handler: &FlowcastHandler,
    stream_id: &str,
    query: &HashMap<String, String>,
    request_id: &str,
) -> Response<BoxedBody> {
    let event_query = match history_query(query) {
        Ok(q) => q,
        Err(err) => return error_response(&err, request_id),
    };
    let limit = event_query.limit;
    let offset = event_query.offset.unwrap_or(0);

    match handler.broker.history(stream_id, event_query).await {
        Ok(stored) => {
            let events: Vec<Value> = stored
                .iter()
                .filter_map(|e| match serde_json::from_str(&e.event_data) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        warn!(event_id = %e.event_id, error = %err, "stored event unreadable");
                        None
                    }
                })
                .collect();
            json_response(
                StatusCode::OK,
                &json!({
                    "streamId": stream_id,
                    "events": events,
                    "count": events.len(),
                    "limit": limit,
                    "offset": offset,
                }),
                request_id,
            )
        }
        Err(err) => error_response(&err, request_id),
    }
}
