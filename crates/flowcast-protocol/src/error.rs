//! Broker error taxonomy
//!
//! One error kind per failure class, with the surface mapping (HTTP status,
//! WebSocket close code, retryability) carried on the kind itself so the
//! transports never re-derive it.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Unified error type for broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("validation failed: {}", reasons.join("; "))]
    Validation { reasons: Vec<String> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("session not active: {0}")]
    SessionNotActive(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::SessionNotActive(_) => "SESSION_NOT_ACTIVE",
            Self::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the REST surface responds with
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::NotFound(_) => 404,
            Self::AlreadyExists(_) | Self::SessionNotActive(_) => 409,
            Self::CapacityExceeded(_) => 429,
            Self::Timeout(_) => 408,
            Self::Storage(_) | Self::Serialization(_) | Self::Transport(_) | Self::Internal(_) => {
                500
            }
        }
    }

    /// WebSocket close code for fatal errors (4xxx application range)
    pub fn ws_close_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 4400,
            Self::NotFound(_) => 4404,
            Self::AlreadyExists(_) | Self::SessionNotActive(_) => 4409,
            Self::CapacityExceeded(_) => 4429,
            Self::Timeout(_) => 4408,
            Self::Storage(_) | Self::Serialization(_) | Self::Transport(_) | Self::Internal(_) => {
                4500
            }
        }
    }

    /// Whether the caller may retry the same request later
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded(_) | Self::Storage(_) | Self::Transport(_) | Self::Timeout(_)
        )
    }

    /// Validation details, when present
    pub fn reasons(&self) -> Option<&[String]> {
        match self {
            Self::Validation { reasons } => Some(reasons),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// HTTP error body shape: `{success:false, error:{...}, metadata:{...}}`
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: Value,
    pub metadata: Value,
}

impl ErrorBody {
    pub fn from_error(err: &BrokerError, request_id: &str) -> Self {
        let now = Utc::now().to_rfc3339();
        let mut error = json!({
            "code": err.code(),
            "message": err.to_string(),
            "retryable": err.retryable(),
            "timestamp": now,
        });
        if let Some(reasons) = err.reasons() {
            error["details"] = json!({ "reasons": reasons });
        }
        Self {
            success: false,
            error,
            metadata: json!({
                "requestId": request_id,
                "version": crate::PROTOCOL_VERSION,
                "timestamp": now,
            }),
        }
    }
}
