//! Event Store Trait
//!
//! The single abstraction in front of every persistence backend. A store is
//! an ordered, bounded FIFO keyed by stream id: within one stream, append
//! order equals read order, retention is capped with FIFO eviction, and the
//! per-stream metadata counter always equals the number of stored rows
//! (append + counter update + eviction commit as one transaction).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use flowcast_protocol::EventType;

/// A serialized event handed to the store for appending
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Producer-visible event id (`evt_<ms>_<rand>`)
    pub event_id: String,
    pub event_type: EventType,
    /// Event timestamp, unix millis
    pub timestamp_ms: i64,
    /// Canonical wire JSON
    pub payload: String,
}

/// One stored row, in store order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Store-assigned monotonic sequence (per store instance)
    pub sequence: u64,
    pub event_id: String,
    pub event_type: EventType,
    /// Append timestamp carried from the record, unix millis
    pub created_at: i64,
    /// Canonical wire JSON
    pub event_data: String,
}

/// Per-stream bookkeeping row
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMetadata {
    pub stream_id: String,
    pub created_at: i64,
    pub last_accessed_at: i64,
    /// Always equals the number of stored rows for the stream
    pub event_count: u64,
}

/// Range/filter query over one stream's events.
/// Results come back ascending by `(created_at, sequence)`.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Inclusive lower bound, unix millis
    pub from_timestamp: Option<i64>,
    /// Inclusive upper bound, unix millis
    pub until_timestamp: Option<i64>,
    pub event_types: Option<Vec<EventType>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl EventQuery {
    pub(crate) fn matches_type(&self, event_type: EventType) -> bool {
        match &self.event_types {
            Some(types) => types.contains(&event_type),
            None => true,
        }
    }

    pub(crate) fn matches_time(&self, created_at: i64) -> bool {
        if let Some(from) = self.from_timestamp
            && created_at < from
        {
            return false;
        }
        if let Some(until) = self.until_timestamp
            && created_at > until
        {
            return false;
        }
        true
    }
}

/// Unified error type for all event store backends
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("stream already exists: {0}")]
    AlreadyExists(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

impl From<serde_json::Error> for EventStoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for EventStoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Core trait for event store backends
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Error type for storage operations
    type Error: std::error::Error + Send + Sync + 'static;

    /// Backend name for logging and health reports
    fn backend_name(&self) -> &'static str;

    /// Register a new stream. Fails with `AlreadyExists` when present.
    async fn create_stream(&self, stream_id: &str) -> Result<(), Self::Error>;

    /// Remove a stream's events and metadata atomically.
    /// Returns whether the stream existed.
    async fn delete_stream(&self, stream_id: &str) -> Result<bool, Self::Error>;

    /// Append one event. Assigns the sequence, evicts the oldest rows past
    /// the retention cap, and updates the metadata counter, all in one
    /// transaction.
    async fn append(
        &self,
        stream_id: &str,
        record: EventRecord,
    ) -> Result<StoredEvent, Self::Error>;

    /// All events in insertion order, without removal
    async fn peek_all(&self, stream_id: &str) -> Result<Vec<StoredEvent>, Self::Error>;

    /// Remove and return the newest event
    async fn pop_newest(&self, stream_id: &str) -> Result<Option<StoredEvent>, Self::Error>;

    /// Remove and return all events in insertion order
    async fn drain_all(&self, stream_id: &str) -> Result<Vec<StoredEvent>, Self::Error>;

    async fn has_events(&self, stream_id: &str) -> Result<bool, Self::Error>;

    /// Range/filter query, ascending `(created_at, sequence)`
    async fn query(
        &self,
        stream_id: &str,
        query: &EventQuery,
    ) -> Result<Vec<StoredEvent>, Self::Error>;

    async fn stream_metadata(
        &self,
        stream_id: &str,
    ) -> Result<Option<StreamMetadata>, Self::Error>;

    /// Bump `last_accessed_at` without touching events
    async fn touch_stream(&self, stream_id: &str) -> Result<(), Self::Error>;

    /// Drop streams idle for longer than `ttl`; returns removed stream ids
    async fn cleanup_expired(&self, ttl: Duration) -> Result<Vec<String>, Self::Error>;

    async fn stream_count(&self) -> Result<usize, Self::Error>;

    async fn total_event_count(&self) -> Result<usize, Self::Error>;

    /// Backend-specific compaction/cleanup hook
    async fn maintenance(&self) -> Result<(), Self::Error>;
}

/// Type alias for boxed event store trait objects with the unified error type
pub type BoxedEventStore = dyn EventStore<Error = EventStoreError>;

/// Current wall clock as unix millis
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
