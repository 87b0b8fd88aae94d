//! Core event model
//!
//! One `StreamEvent` is the broker's unit of delivery: a tagged type from a
//! closed set, a typed payload whose shape depends on the tag, and a free-form
//! metadata bag. Field names on the wire follow the JSON contract
//! (`sessionId`, `stepIndex`, `data`), internal names stay Rust-idiomatic.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of event types carried by the broker.
///
/// Wire representation is SCREAMING_SNAKE (`AI_REASONING`, `COMMAND_STARTED`,
/// ...). Adding a variant is a protocol change; validation dispatches on this
/// tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    AiReasoning,
    CommandStarted,
    CommandCompleted,
    CommandFailed,
    ScreenshotCaptured,
    VariableUpdated,
    SessionStatus,
    ErrorOccurred,
    Heartbeat,
    ConnectionAck,
    WarningIssued,
}

impl EventType {
    /// Wire name of this event type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiReasoning => "AI_REASONING",
            Self::CommandStarted => "COMMAND_STARTED",
            Self::CommandCompleted => "COMMAND_COMPLETED",
            Self::CommandFailed => "COMMAND_FAILED",
            Self::ScreenshotCaptured => "SCREENSHOT_CAPTURED",
            Self::VariableUpdated => "VARIABLE_UPDATED",
            Self::SessionStatus => "SESSION_STATUS",
            Self::ErrorOccurred => "ERROR_OCCURRED",
            Self::Heartbeat => "HEARTBEAT",
            Self::ConnectionAck => "CONNECTION_ACK",
            Self::WarningIssued => "WARNING_ISSUED",
        }
    }

    /// Parse a wire name (used by query-string `types=` filters)
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AI_REASONING" => Some(Self::AiReasoning),
            "COMMAND_STARTED" => Some(Self::CommandStarted),
            "COMMAND_COMPLETED" => Some(Self::CommandCompleted),
            "COMMAND_FAILED" => Some(Self::CommandFailed),
            "SCREENSHOT_CAPTURED" => Some(Self::ScreenshotCaptured),
            "VARIABLE_UPDATED" => Some(Self::VariableUpdated),
            "SESSION_STATUS" => Some(Self::SessionStatus),
            "ERROR_OCCURRED" => Some(Self::ErrorOccurred),
            "HEARTBEAT" => Some(Self::Heartbeat),
            "CONNECTION_ACK" => Some(Self::ConnectionAck),
            "WARNING_ISSUED" => Some(Self::WarningIssued),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// AI reasoning step payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningData {
    pub thought: String,
    /// Model confidence, must lie in `[0, 1]`
    pub confidence: f64,
    pub reasoning_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Command execution payload (started / completed / failed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandData {
    pub command_id: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Value,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Pixel dimensions of a captured screenshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Screenshot capture payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotData {
    pub id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
    pub action_type: String,
    pub timestamp: DateTime<Utc>,
    pub file_path: String,
    pub dimensions: Dimensions,
    pub file_size: u64,
}

/// Variable update payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableData {
    pub name: String,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub source: String,
}

/// Error report payload (`ERROR_OCCURRED`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultData {
    pub id: String,
    pub code: String,
    pub message: String,
    pub module_id: String,
    pub recoverable: bool,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
}

/// `SESSION_STATUS` details record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
}

/// Session status transition payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub details: StatusDetails,
}

/// Type-dependent payload union.
///
/// Untagged on the wire: the `data` object's shape identifies the variant,
/// and the event type tag is cross-checked during validation. `Generic`
/// must stay last so it only absorbs payloads no specific shape matches
/// (heartbeats, acks, warnings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Reasoning { reasoning: ReasoningData },
    Command { command: CommandData },
    Screenshot { screenshot: ScreenshotData },
    Variable { variable: VariableData },
    Fault { error: FaultData },
    Status(StatusData),
    Generic(Value),
}

/// The broker's unit of delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Globally unique, time-prefixed: `evt_<unix_ms>_<rand>`
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Assigned at construction, ISO-8601 UTC on the wire
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "sessionId")]
    pub session_key: String,
    #[serde(rename = "stepIndex", skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
    pub data: EventData,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Generate a time-prefixed event identifier (`evt_<unix_ms>_<rand8hex>`)
pub fn generate_event_id() -> String {
    format!(
        "evt_{}_{:08x}",
        Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

impl StreamEvent {
    /// Create a new event with a generated id and the current timestamp
    pub fn new(event_type: EventType, session_key: impl Into<String>, data: EventData) -> Self {
        Self {
            id: generate_event_id(),
            event_type,
            timestamp: Utc::now(),
            session_key: session_key.into(),
            step_index: None,
            data,
            metadata: HashMap::new(),
        }
    }

    /// AI reasoning event
    pub fn ai_reasoning(
        session_key: impl Into<String>,
        thought: impl Into<String>,
        confidence: f64,
        reasoning_type: impl Into<String>,
    ) -> Self {
        Self::new(
            EventType::AiReasoning,
            session_key,
            EventData::Reasoning {
                reasoning: ReasoningData {
                    thought: thought.into(),
                    confidence,
                    reasoning_type: reasoning_type.into(),
                    context: None,
                },
            },
        )
    }

    /// Command lifecycle event; `event_type` must be one of the `COMMAND_*` tags
    pub fn command(
        event_type: EventType,
        session_key: impl Into<String>,
        command: CommandData,
    ) -> Self {
        Self::new(event_type, session_key, EventData::Command { command })
    }

    /// Session status transition event
    pub fn session_status(
        session_key: impl Into<String>,
        status: impl Into<String>,
        message: Option<String>,
    ) -> Self {
        Self::new(
            EventType::SessionStatus,
            session_key,
            EventData::Status(StatusData {
                message,
                details: StatusDetails {
                    kind: "session".to_string(),
                    status: status.into(),
                },
            }),
        )
    }

    /// Error report event
    pub fn error_occurred(session_key: impl Into<String>, error: FaultData) -> Self {
        Self::new(EventType::ErrorOccurred, session_key, EventData::Fault { error })
    }

    /// Heartbeat event (transport liveness, never persisted by the dispatcher)
    pub fn heartbeat(session_key: impl Into<String>) -> Self {
        Self::new(
            EventType::Heartbeat,
            session_key,
            EventData::Generic(serde_json::json!({"type": "heartbeat"})),
        )
    }

    pub fn with_step_index(mut self, step_index: u32) -> Self {
        self.step_index = Some(step_index);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(EventType::AiReasoning.as_str(), "AI_REASONING");
        assert_eq!(
            serde_json::to_value(EventType::CommandStarted).unwrap(),
            json!("COMMAND_STARTED")
        );
        assert_eq!(EventType::parse("SCREENSHOT_CAPTURED"), Some(EventType::ScreenshotCaptured));
        assert_eq!(EventType::parse("NOPE"), None);
    }

    #[test]
    fn test_event_id_shape() {
        let id = generate_event_id();
        assert!(id.starts_with("evt_"));
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn test_wire_shape_ai_reasoning() {
        let event = StreamEvent::ai_reasoning("sess-1", "hi", 0.9, "planning");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], json!("AI_REASONING"));
        assert_eq!(value["sessionId"], json!("sess-1"));
        assert_eq!(value["data"]["reasoning"]["thought"], json!("hi"));
        assert_eq!(value["data"]["reasoning"]["confidence"], json!(0.9));
        // Optional fields stay off the wire when unset
        assert!(value.get("stepIndex").is_none());
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn test_wire_roundtrip_preserves_payload_variant() {
        let event = StreamEvent::command(
            EventType::CommandStarted,
            "sess-1",
            CommandData {
                command_id: "cmd-9".into(),
                action: "click".into(),
                parameters: json!({"selector": "#go"}),
                status: "started".into(),
                duration: None,
                result: None,
            },
        )
        .with_step_index(3);

        let text = serde_json::to_string(&event).unwrap();
        let back: StreamEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
        assert!(matches!(back.data, EventData::Command { .. }));
    }

    #[test]
    fn test_generic_payload_is_last_resort() {
        let event = StreamEvent::heartbeat("sess-1");
        let text = serde_json::to_string(&event).unwrap();
        let back: StreamEvent = serde_json::from_str(&text).unwrap();
        assert!(matches!(back.data, EventData::Generic(_)));
    }
}
