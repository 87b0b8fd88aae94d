//! Request routing and query parsing
//!
//! One handler instance serves every connection. Routes:
//!
//! - `GET /api/streams/{streamId}`: stream details
//! - `GET /api/streams/{streamId}/events`: paginated history
//! - `GET /api/stream/sse/{streamId}`: SSE subscription
//! - `GET /api/stream/ws/{streamId}`: WebSocket upgrade
//! - `GET /api/health`, `GET /api/health/detailed`
//!
//! Everything else is a 404 with the standard error body.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use hyper::body::Incoming;
use hyper::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, HeaderMap, HeaderValue,
};
use hyper::{Method, Request, Response, StatusCode};
use tracing::debug;
use uuid::Uuid;

use flowcast_broker::EventBroker;
use flowcast_event_store::EventQuery;
use flowcast_protocol::{BrokerError, EventType, FilterSpec};

use crate::response::{BoxedBody, empty_response, error_response};
use crate::server::ServerConfig;
use crate::{api, sse, ws};

/// Shared per-connection handler
#[derive(Clone)]
pub struct FlowcastHandler {
    pub broker: Arc<EventBroker>,
    pub config: Arc<ServerConfig>,
}

impl FlowcastHandler {
    pub fn new(broker: Arc<EventBroker>, config: Arc<ServerConfig>) -> Self {
        Self { broker, config }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<BoxedBody> {
        let request_id = Uuid::now_v7().to_string();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(%method, %path, request_id, "handling request");

        let mut response = self.route(req, &request_id).await;

        if let Some(origin) = &self.config.cors_origin {
            apply_cors(response.headers_mut(), origin);
        }
        response
    }

    async fn route(&self, req: Request<Incoming>, request_id: &str) -> Response<BoxedBody> {
        if req.method() == Method::OPTIONS {
            return empty_response(StatusCode::NO_CONTENT);
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let query = parse_query(req.uri().query().unwrap_or(""));

        match (&method, segments.as_slice()) {
            (&Method::GET, ["api", "health"]) => api::health(self, request_id),
            (&Method::GET, ["api", "health", "detailed"]) => {
                api::health_detailed(self, request_id).await
            }
            (&Method::GET, ["api", "streams", stream_id]) => {
                api::stream_details(self, stream_id, request_id).await
            }
            (&Method::GET, ["api", "streams", stream_id, "events"]) => {
                api::stream_events(self, stream_id, &query, request_id).await
            }
            (&Method::GET, ["api", "stream", "sse", stream_id]) => {
                match ConnectionQuery::from_map(&query) {
                    Ok(options) => sse::handle_sse(self, stream_id, options, request_id).await,
                    Err(err) => error_response(&err, request_id),
                }
            }
            (&Method::GET, ["api", "stream", "ws", stream_id]) => {
                match ConnectionQuery::from_map(&query) {
                    Ok(options) => {
                        ws::handle_upgrade(self, req, stream_id, options, request_id).await
                    }
                    Err(err) => error_response(&err, request_id),
                }
            }
            _ => error_response(
                &BrokerError::NotFound(format!("no route for {path}")),
                request_id,
            ),
        }
    }
}

/// Options parsed from a subscription URL's query string
#[derive(Debug, Clone, Default)]
pub struct ConnectionQuery {
    pub filters: Vec<FilterSpec>,
    pub include_history: bool,
    pub history_limit: usize,
}

impl ConnectionQuery {
    pub fn from_map(query: &HashMap<String, String>) -> Result<Self, BrokerError> {
        let filters = match query.get("filters") {
            Some(raw) if !raw.is_empty() => {
                serde_json::from_str::<Vec<FilterSpec>>(raw).map_err(|e| {
                    BrokerError::Validation {
                        reasons: vec![format!("invalid filters parameter: {e}")],
                    }
                })?
            }
            _ => match query.get("types") {
                // Convenience shorthand: types=AI_REASONING,COMMAND_STARTED
                Some(raw) if !raw.is_empty() => {
                    vec![FilterSpec::for_types(parse_types(raw)?)]
                }
                _ => Vec::new(),
            },
        };

        let include_history = query
            .get("includeHistory")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let history_limit = query
            .get("historyLimit")
            .and_then(|v| v.parse().ok())
            .unwrap_or(50usize);

        Ok(Self {
            filters,
            include_history,
            history_limit,
        })
    }
}

/// History page parameters for `GET /api/streams/{id}/events`
pub fn history_query(query: &HashMap<String, String>) -> Result<EventQuery, BrokerError> {
    let event_types = match query.get("types") {
        Some(raw) if !raw.is_empty() => Some(parse_types(raw)?),
        _ => None,
    };

    Ok(EventQuery {
        from_timestamp: parse_time(query.get("startTime"))?,
        until_timestamp: parse_time(query.get("endTime"))?,
        event_types,
        limit: query.get("limit").and_then(|v| v.parse().ok()),
        offset: query.get("offset").and_then(|v| v.parse().ok()),
    })
}

fn parse_types(raw: &str) -> Result<Vec<EventType>, BrokerError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| {
            EventType::parse(name).ok_or_else(|| BrokerError::Validation {
                reasons: vec![format!("unknown event type {name}")],
            })
        })
        .collect()
}

fn parse_time(raw: Option<&String>) -> Result<Option<i64>, BrokerError> {
    match raw {
        None => Ok(None),
        Some(value) if value.is_empty() => Ok(None),
        Some(value) => {
            // Accept RFC 3339 or raw unix millis
            if let Ok(ms) = value.parse::<i64>() {
                return Ok(Some(ms));
            }
            DateTime::parse_from_rfc3339(value)
                .map(|dt| Some(dt.timestamp_millis()))
                .map_err(|e| BrokerError::Validation {
                    reasons: vec![format!("invalid timestamp '{value}': {e}")],
                })
        }
    }
}

/// Decode `a=1&b=two` into a map, percent-decoding both sides
pub fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(key).ok()?.into_owned();
            let value = urlencoding::decode(value).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

/// Cross-origin headers for the configured origin. The surface is GET-only;
/// credentials are granted only for a pinned origin, never for `"*"`.
pub fn apply_cors(headers: &mut HeaderMap, origin: &str) {
    let Ok(origin_value) = HeaderValue::from_str(origin) else {
        return;
    };
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin_value);
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Accept, Authorization, Last-Event-ID"),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    if origin != "*" {
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
}

/// Server capabilities advertised in `connection_ack` frames
pub fn server_capabilities() -> Vec<String> {
    vec![
        "filters".to_string(),
        "replay".to_string(),
        "heartbeat".to_string(),
        "history".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_decodes_pairs() {
        let map = parse_query("a=1&b=two%20words&flag");
        assert_eq!(map["a"], "1");
        assert_eq!(map["b"], "two words");
        assert_eq!(map["flag"], "");
    }

    #[test]
    fn test_connection_query_filters_json() {
        let mut map = HashMap::new();
        map.insert(
            "filters".to_string(),
            r#"[{"eventTypes":["AI_REASONING"]}]"#.to_string(),
        );
        map.insert("includeHistory".to_string(), "true".to_string());

        let options = ConnectionQuery::from_map(&map).unwrap();
        assert_eq!(options.filters.len(), 1);
        assert!(options.include_history);
        assert_eq!(options.history_limit, 50);
    }

    #[test]
    fn test_connection_query_types_shorthand() {
        let mut map = HashMap::new();
        map.insert(
            "types".to_string(),
            "AI_REASONING,COMMAND_STARTED".to_string(),
        );
        let options = ConnectionQuery::from_map(&map).unwrap();
        assert_eq!(options.filters.len(), 1);
        assert_eq!(
            options.filters[0].event_types.as_ref().unwrap().len(),
            2
        );
    }

    #[test]
    fn test_connection_query_rejects_bad_filters() {
        let mut map = HashMap::new();
        map.insert("filters".to_string(), "not json".to_string());
        let err = ConnectionQuery::from_map(&map).unwrap_err();
        assert!(matches!(err, BrokerError::Validation { .. }));
    }

    #[test]
    fn test_history_query_times() {
        let mut map = HashMap::new();
        map.insert("startTime".to_string(), "1700000000000".to_string());
        map.insert("endTime".to_string(), "2024-01-01T00:00:00Z".to_string());
        map.insert("limit".to_string(), "10".to_string());

        let query = history_query(&map).unwrap();
        assert_eq!(query.from_timestamp, Some(1_700_000_000_000));
        assert!(query.until_timestamp.is_some());
        assert_eq!(query.limit, Some(10));
    }

    #[test]
    fn test_history_query_rejects_unknown_type() {
        let mut map = HashMap::new();
        map.insert("types".to_string(), "NOT_A_TYPE".to_string());
        assert!(history_query(&map).is_err());
    }

    #[test]
    fn test_cors_wildcard_skips_credentials() {
        let mut headers = HeaderMap::new();
        apply_cors(&mut headers, "*");

        assert_eq!(headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
            "GET, OPTIONS"
        );
        assert!(headers.get(ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
    }

    #[test]
    fn test_cors_pinned_origin_grants_credentials() {
        let mut headers = HeaderMap::new();
        apply_cors(&mut headers, "https://app.example.com");

        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://app.example.com"
        );
        assert_eq!(
            headers.get(ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
            "true"
        );
    }

    #[test]
    fn test_cors_invalid_origin_adds_nothing() {
        let mut headers = HeaderMap::new();
        apply_cors(&mut headers, "bad\norigin");
        assert!(headers.is_empty());
    }
}
