//! Transport frame envelopes
//!
//! WebSocket messages in both directions are tagged JSON envelopes; SSE
//! reuses the server-side payload shapes under named events. The dispatcher
//! fans out pre-serialized canonical event JSON, so the hot path wraps with
//! `wrap_event_frame` instead of re-parsing into a `Value`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::EventType;
use crate::filter::FilterSpec;

/// SSE event names used on the wire
pub mod sse_names {
    pub const CONNECTION_ESTABLISHED: &str = "connection_established";
    pub const STREAM_EVENT: &str = "stream_event";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const ERROR: &str = "error";
    pub const WARNING: &str = "warning";
    pub const CONNECTION_CLOSE: &str = "connection_close";
    pub const REPLAY_COMPLETE: &str = "replay_complete";
}

/// Metadata sent in the `connection_ack` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckMetadata {
    pub subscriber_id: String,
    pub stream_id: String,
    pub server_capabilities: Vec<String>,
}

/// Error record inside an `error` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameError {
    pub code: String,
    pub message: String,
}

/// Result of a completed replay, reported in the `replay_complete` frame
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySummary {
    pub events_replayed: usize,
    pub total_events_considered: usize,
    pub duration_ms: u64,
}

/// Server → client WebSocket envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionAck { payload: AckPayload },
    Event {
        event: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Error { error: FrameError },
    ReplayComplete { metadata: ReplaySummary },
    Pong,
}

/// `connection_ack` payload wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    pub metadata: AckMetadata,
}

impl ServerFrame {
    pub fn connection_ack(metadata: AckMetadata) -> Self {
        Self::ConnectionAck {
            payload: AckPayload { metadata },
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            error: FrameError {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

/// Wrap canonical event JSON into an `event` envelope without re-parsing
pub fn wrap_event_frame(canonical_event_json: &str) -> String {
    format!("{{\"type\":\"event\",\"event\":{canonical_event_json}}}")
}

/// Payload of an `unsubscribe` control message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<EventType>>,
}

/// Payload of a `filter_update` control message (replaces the filter set)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterUpdatePayload {
    pub filters: Vec<FilterSpec>,
}

/// Payload of a `replay` control message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_events: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<EventType>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

/// Client → server WebSocket envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Subscribe { payload: FilterSpec },
    Unsubscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<UnsubscribePayload>,
    },
    FilterUpdate { payload: FilterUpdatePayload },
    Replay {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<ReplayRequest>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connection_ack_shape() {
        let frame = ServerFrame::connection_ack(AckMetadata {
            subscriber_id: "sub-1".into(),
            stream_id: "stm-1".into(),
            server_capabilities: vec!["replay".into(), "filters".into()],
        });
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["type"], json!("connection_ack"));
        assert_eq!(value["payload"]["metadata"]["subscriberId"], json!("sub-1"));
        assert_eq!(value["payload"]["metadata"]["streamId"], json!("stm-1"));
    }

    #[test]
    fn test_wrap_event_frame_embeds_raw_json() {
        let wrapped = wrap_event_frame(r#"{"id":"evt_1","type":"HEARTBEAT"}"#);
        let value: Value = serde_json::from_str(&wrapped).unwrap();
        assert_eq!(value["type"], json!("event"));
        assert_eq!(value["event"]["id"], json!("evt_1"));
    }

    #[test]
    fn test_replay_complete_wire_names() {
        let frame = ServerFrame::ReplayComplete {
            metadata: ReplaySummary {
                events_replayed: 7,
                total_events_considered: 9,
                duration_ms: 12,
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["metadata"]["eventsReplayed"], json!(7));
        assert_eq!(value["metadata"]["totalEventsConsidered"], json!(9));
        assert_eq!(value["metadata"]["durationMs"], json!(12));
    }

    #[test]
    fn test_client_frame_parsing() {
        let ping: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientFrame::Ping));

        let replay: ClientFrame = serde_json::from_str(
            r#"{"type":"replay","payload":{"maxEvents":50,"eventTypes":["AI_REASONING"]}}"#,
        )
        .unwrap();
        match replay {
            ClientFrame::Replay { payload: Some(req) } => {
                assert_eq!(req.max_events, Some(50));
                assert_eq!(req.event_types, Some(vec![EventType::AiReasoning]));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let bare_unsub: ClientFrame = serde_json::from_str(r#"{"type":"unsubscribe"}"#).unwrap();
        assert!(matches!(bare_unsub, ClientFrame::Unsubscribe { payload: None }));
    }
}
