//! Structural validation, sanitization and canonical serialization
//!
//! `EventCodec::encode` is the single gate every published event passes
//! through: structural checks dispatched on the event type, string
//! sanitization, then canonical JSON. Nothing reaches the store or a
//! subscriber without an `Ok` from here.

use chrono::{Duration, Utc};
use serde_json::Value;

use crate::error::BrokerError;
use crate::event::{EventData, EventType, StreamEvent};

/// Marker appended to strings cut at the length limit
pub const TRUNCATION_MARKER: &str = "…[truncated]";

/// Default per-string length limit applied during sanitization (8 KiB)
pub const DEFAULT_MAX_STRING_LEN: usize = 8 * 1024;

/// Successful encode: canonical JSON plus any non-fatal warnings
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// Canonical wire JSON, sanitized
    pub canonical: String,
    /// Non-fatal observations (odd timestamps etc.)
    pub warnings: Vec<String>,
}

/// Validator + sanitizer + canonical serializer
#[derive(Debug, Clone)]
pub struct EventCodec {
    max_string_len: usize,
}

impl Default for EventCodec {
    fn default() -> Self {
        Self {
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }
}

impl EventCodec {
    pub fn new(max_string_len: usize) -> Self {
        Self { max_string_len }
    }

    /// Validate, sanitize and canonically serialize one event
    pub fn encode(&self, event: &StreamEvent) -> Result<ValidationOutcome, BrokerError> {
        let reasons = validate(event);
        if !reasons.is_empty() {
            return Err(BrokerError::Validation { reasons });
        }

        let warnings = timestamp_warnings(event);

        let mut value =
            serde_json::to_value(event).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        sanitize_value(&mut value, self.max_string_len);

        let canonical =
            serde_json::to_string(&value).map_err(|e| BrokerError::Serialization(e.to_string()))?;

        Ok(ValidationOutcome { canonical, warnings })
    }
}

/// Structural validation, dispatched on the event type tag.
/// Returns every violated rule rather than stopping at the first.
pub fn validate(event: &StreamEvent) -> Vec<String> {
    let mut reasons = Vec::new();

    if event.id.is_empty() {
        reasons.push("event id must be non-empty".to_string());
    }
    if event.session_key.is_empty() {
        reasons.push("sessionId must be non-empty".to_string());
    }

    match (&event.event_type, &event.data) {
        (EventType::AiReasoning, EventData::Reasoning { reasoning }) => {
            if reasoning.thought.is_empty() {
                reasons.push("reasoning.thought must be non-empty".to_string());
            }
            if !(0.0..=1.0).contains(&reasoning.confidence) {
                reasons.push(format!(
                    "reasoning.confidence {} outside [0,1]",
                    reasoning.confidence
                ));
            }
        }
        (
            kind @ (EventType::CommandStarted
            | EventType::CommandCompleted
            | EventType::CommandFailed),
            EventData::Command { command },
        ) => {
            if command.command_id.is_empty() {
                reasons.push("command.commandId must be non-empty".to_string());
            }
            if command.action.is_empty() {
                reasons.push("command.action must be non-empty".to_string());
            }
            let expected = match kind {
                EventType::CommandStarted => "started",
                EventType::CommandCompleted => "completed",
                _ => "failed",
            };
            if command.status != expected {
                reasons.push(format!(
                    "command.status '{}' inconsistent with {}",
                    command.status, kind
                ));
            }
        }
        (EventType::ScreenshotCaptured, EventData::Screenshot { screenshot }) => {
            if screenshot.id.is_empty() {
                reasons.push("screenshot.id must be non-empty".to_string());
            }
            if screenshot.file_path.is_empty() {
                reasons.push("screenshot.filePath must be non-empty".to_string());
            }
            if screenshot.dimensions.width == 0 || screenshot.dimensions.height == 0 {
                reasons.push("screenshot.dimensions must be non-zero".to_string());
            }
        }
        (EventType::VariableUpdated, EventData::Variable { variable }) => {
            if variable.name.is_empty() {
                reasons.push("variable.name must be non-empty".to_string());
            }
        }
        (EventType::ErrorOccurred, EventData::Fault { error }) => {
            if error.id.is_empty() {
                reasons.push("error.id must be non-empty".to_string());
            }
            if error.code.is_empty() {
                reasons.push("error.code must be non-empty".to_string());
            }
            if error.message.is_empty() {
                reasons.push("error.message must be non-empty".to_string());
            }
        }
        (EventType::SessionStatus, EventData::Status(_)) => {}
        (
            EventType::Heartbeat | EventType::ConnectionAck | EventType::WarningIssued,
            EventData::Generic(_),
        ) => {}
        (kind, _) => {
            reasons.push(format!("payload shape does not match event type {kind}"));
        }
    }

    reasons
}

fn timestamp_warnings(event: &StreamEvent) -> Vec<String> {
    let mut warnings = Vec::new();
    let now = Utc::now();

    if event.timestamp > now + Duration::seconds(60) {
        warnings.push(format!(
            "timestamp {} is more than 60s in the future",
            event.timestamp.to_rfc3339()
        ));
    }
    if event.timestamp < now - Duration::hours(24) {
        warnings.push(format!(
            "timestamp {} is more than 24h in the past",
            event.timestamp.to_rfc3339()
        ));
    }
    warnings
}

/// Sanitize one string: strip control characters (keeping `\t`, `\n`, `\r`),
/// then truncate past the byte limit with a visible marker. Idempotent:
/// strings already carrying the marker are left alone.
pub fn sanitize_str(s: &str, max_len: usize) -> String {
    let cleaned: String = s
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect();

    if cleaned.len() <= max_len || cleaned.ends_with(TRUNCATION_MARKER) {
        return cleaned;
    }

    let mut cut = max_len;
    while cut > 0 && !cleaned.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = cleaned[..cut].to_string();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Recursively sanitize every string in a JSON value
pub fn sanitize_value(value: &mut Value, max_len: usize) {
    match value {
        Value::String(s) => {
            let cleaned = sanitize_str(s, max_len);
            if cleaned != *s {
                *s = cleaned;
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitize_value(item, max_len);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                sanitize_value(item, max_len);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CommandData, FaultData};
    use serde_json::json;

    #[test]
    fn test_valid_reasoning_event_encodes() {
        let codec = EventCodec::default();
        let event = StreamEvent::ai_reasoning("sess-1", "analyze form", 0.8, "planning");
        let outcome = codec.encode(&event).unwrap();
        assert!(outcome.canonical.contains("\"AI_REASONING\""));
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_confidence_out_of_range_rejected() {
        let codec = EventCodec::default();
        let event = StreamEvent::ai_reasoning("sess-1", "hm", 1.5, "planning");
        let err = codec.encode(&event).unwrap_err();
        assert!(matches!(err, BrokerError::Validation { .. }));
        assert!(err.reasons().unwrap()[0].contains("confidence"));
    }

    #[test]
    fn test_empty_thought_and_session_collects_all_reasons() {
        let mut event = StreamEvent::ai_reasoning("", "", 0.5, "planning");
        event.id = String::new();
        let reasons = validate(&event);
        assert_eq!(reasons.len(), 3);
    }

    #[test]
    fn test_command_status_must_match_type() {
        let event = StreamEvent::command(
            EventType::CommandCompleted,
            "sess-1",
            CommandData {
                command_id: "cmd-1".into(),
                action: "type".into(),
                parameters: json!({}),
                status: "started".into(),
                duration: None,
                result: None,
            },
        );
        let reasons = validate(&event);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("inconsistent"));
    }

    #[test]
    fn test_payload_shape_mismatch_rejected() {
        let event = StreamEvent::new(
            EventType::ErrorOccurred,
            "sess-1",
            EventData::Generic(json!({"oops": true})),
        );
        let reasons = validate(&event);
        assert!(reasons[0].contains("payload shape"));
    }

    #[test]
    fn test_error_payload_requires_identity() {
        let event = StreamEvent::error_occurred(
            "sess-1",
            FaultData {
                id: String::new(),
                code: String::new(),
                message: "boom".into(),
                module_id: "executor".into(),
                recoverable: true,
                retryable: false,
                timestamp: Utc::now(),
            },
        );
        let reasons = validate(&event);
        assert_eq!(reasons.len(), 2);
    }

    #[test]
    fn test_stale_timestamp_warns_but_encodes() {
        let codec = EventCodec::default();
        let mut event = StreamEvent::ai_reasoning("sess-1", "late", 0.5, "recap");
        event.timestamp = Utc::now() - Duration::hours(25);
        let outcome = codec.encode(&event).unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("24h"));
    }

    #[test]
    fn test_sanitize_strips_control_chars() {
        let out = sanitize_str("a\u{0}b\u{7}c\td\ne\r", 1024);
        assert_eq!(out, "abc\td\ne\r");
    }

    #[test]
    fn test_sanitize_truncates_with_marker() {
        let long = "x".repeat(100);
        let out = sanitize_str(&long, 10);
        assert!(out.starts_with("xxxxxxxxxx"));
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_sanitize_idempotent() {
        let noisy = format!("ab\u{1}{}", "y".repeat(64));
        let once = sanitize_str(&noisy, 16);
        let twice = sanitize_str(&once, 16);
        assert_eq!(once, twice);

        // Multi-byte boundary safety
        let emoji = "é".repeat(40);
        let once = sanitize_str(&emoji, 9);
        let twice = sanitize_str(&once, 9);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_sanitize_value_recurses() {
        let mut value = json!({
            "a": "ok\u{0}",
            "b": [{"c": "bad\u{2}"}],
        });
        sanitize_value(&mut value, 1024);
        assert_eq!(value, json!({"a": "ok", "b": [{"c": "bad"}]}));
    }

    #[test]
    fn test_encode_sanitizes_payload_strings() {
        let codec = EventCodec::new(32);
        let event = StreamEvent::ai_reasoning(
            "sess-1",
            format!("thought\u{0} {}", "z".repeat(64)),
            0.7,
            "planning",
        );
        let outcome = codec.encode(&event).unwrap();
        assert!(!outcome.canonical.contains('\u{0}'));
        assert!(outcome.canonical.contains("[truncated]"));
    }
}
