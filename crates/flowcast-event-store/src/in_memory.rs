//! In-Memory Event Store Implementation
//!
//! Per-stream ordered buffers behind an `Arc<RwLock<HashMap>>`. Suitable for
//! development, tests, and deployments that accept losing history on restart.
//! The write lock serializes appends, which gives the single-writer-per-stream
//! guarantee for free.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::traits::{
    EventQuery, EventRecord, EventStore, EventStoreError, StoredEvent, StreamMetadata, now_millis,
};

/// Configuration for the in-memory event store
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Retention cap per stream; the oldest rows are evicted past it
    pub max_events_per_stream: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_events_per_stream: 1_000,
        }
    }
}

#[derive(Debug)]
struct StreamSlot {
    created_at: i64,
    last_accessed_at: i64,
    events: VecDeque<StoredEvent>,
}

/// In-memory store for stream event queues
#[derive(Debug, Clone)]
pub struct InMemoryEventStore {
    streams: Arc<RwLock<HashMap<String, StreamSlot>>>,
    /// Store-wide sequence counter; starts at 1 so 0 can mean "from the start"
    sequence: Arc<AtomicU64>,
    config: InMemoryConfig,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    pub fn with_config(config: InMemoryConfig) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            sequence: Arc::new(AtomicU64::new(1)),
            config,
        }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    type Error = EventStoreError;

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }

    async fn create_stream(&self, stream_id: &str) -> Result<(), Self::Error> {
        let mut streams = self.streams.write().await;
        if streams.contains_key(stream_id) {
            return Err(EventStoreError::AlreadyExists(stream_id.to_string()));
        }
        let now = now_millis();
        streams.insert(
            stream_id.to_string(),
            StreamSlot {
                created_at: now,
                last_accessed_at: now,
                events: VecDeque::new(),
            },
        );
        debug!("Created stream: {}", stream_id);
        Ok(())
    }

    async fn delete_stream(&self, stream_id: &str) -> Result<bool, Self::Error> {
        let mut streams = self.streams.write().await;
        let removed = streams.remove(stream_id).is_some();
        if removed {
            debug!("Deleted stream and all events: {}", stream_id);
        }
        Ok(removed)
    }

    async fn append(
        &self,
        stream_id: &str,
        record: EventRecord,
    ) -> Result<StoredEvent, Self::Error> {
        let mut streams = self.streams.write().await;
        let slot = streams
            .get_mut(stream_id)
            .ok_or_else(|| EventStoreError::StreamNotFound(stream_id.to_string()))?;

        let stored = StoredEvent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            event_id: record.event_id,
            event_type: record.event_type,
            created_at: record.timestamp_ms,
            event_data: record.payload,
        };

        slot.events.push_back(stored.clone());
        while slot.events.len() > self.config.max_events_per_stream {
            slot.events.pop_front();
        }
        slot.last_accessed_at = now_millis();

        Ok(stored)
    }

    async fn peek_all(&self, stream_id: &str) -> Result<Vec<StoredEvent>, Self::Error> {
        let streams = self.streams.read().await;
        let slot = streams
            .get(stream_id)
            .ok_or_else(|| EventStoreError::StreamNotFound(stream_id.to_string()))?;
        Ok(slot.events.iter().cloned().collect())
    }

    async fn pop_newest(&self, stream_id: &str) -> Result<Option<StoredEvent>, Self::Error> {
        let mut streams = self.streams.write().await;
        let slot = streams
            .get_mut(stream_id)
            .ok_or_else(|| EventStoreError::StreamNotFound(stream_id.to_string()))?;
        slot.last_accessed_at = now_millis();
        Ok(slot.events.pop_back())
    }

    async fn drain_all(&self, stream_id: &str) -> Result<Vec<StoredEvent>, Self::Error> {
        let mut streams = self.streams.write().await;
        let slot = streams
            .get_mut(stream_id)
            .ok_or_else(|| EventStoreError::StreamNotFound(stream_id.to_string()))?;
        slot.last_accessed_at = now_millis();
        Ok(slot.events.drain(..).collect())
    }

    async fn has_events(&self, stream_id: &str) -> Result<bool, Self::Error> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(stream_id)
            .map(|slot| !slot.events.is_empty())
            .unwrap_or(false))
    }

    async fn query(
        &self,
        stream_id: &str,
        query: &EventQuery,
    ) -> Result<Vec<StoredEvent>, Self::Error> {
        let streams = self.streams.read().await;
        let slot = streams
            .get(stream_id)
            .ok_or_else(|| EventStoreError::StreamNotFound(stream_id.to_string()))?;

        let mut matched: Vec<StoredEvent> = slot
            .events
            .iter()
            .filter(|e| query.matches_type(e.event_type) && query.matches_time(e.created_at))
            .cloned()
            .collect();
        matched.sort_by_key(|e| (e.created_at, e.sequence));

        let offset = query.offset.unwrap_or(0);
        let limited: Vec<StoredEvent> = match query.limit {
            Some(limit) => matched.into_iter().skip(offset).take(limit).collect(),
            None => matched.into_iter().skip(offset).collect(),
        };
        Ok(limited)
    }

    async fn stream_metadata(
        &self,
        stream_id: &str,
    ) -> Result<Option<StreamMetadata>, Self::Error> {
        let streams = self.streams.read().await;
        Ok(streams.get(stream_id).map(|slot| StreamMetadata {
            stream_id: stream_id.to_string(),
            created_at: slot.created_at,
            last_accessed_at: slot.last_accessed_at,
            event_count: slot.events.len() as u64,
        }))
    }

    async fn touch_stream(&self, stream_id: &str) -> Result<(), Self::Error> {
        let mut streams = self.streams.write().await;
        let slot = streams
            .get_mut(stream_id)
            .ok_or_else(|| EventStoreError::StreamNotFound(stream_id.to_string()))?;
        slot.last_accessed_at = now_millis();
        Ok(())
    }

    async fn cleanup_expired(&self, ttl: Duration) -> Result<Vec<String>, Self::Error> {
        let cutoff = now_millis() - ttl.as_millis() as i64;
        let mut streams = self.streams.write().await;

        let mut expired = Vec::new();
        streams.retain(|stream_id, slot| {
            if slot.last_accessed_at < cutoff {
                expired.push(stream_id.clone());
                false
            } else {
                true
            }
        });

        if !expired.is_empty() {
            info!("Expired {} idle streams", expired.len());
        }
        Ok(expired)
    }

    async fn stream_count(&self) -> Result<usize, Self::Error> {
        let streams = self.streams.read().await;
        Ok(streams.len())
    }

    async fn total_event_count(&self) -> Result<usize, Self::Error> {
        let streams = self.streams.read().await;
        Ok(streams.values().map(|slot| slot.events.len()).sum())
    }

    async fn maintenance(&self) -> Result<(), Self::Error> {
        // Retention is enforced on every append; nothing to compact.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcast_protocol::EventType;

    fn record(n: u32) -> EventRecord {
        EventRecord {
            event_id: format!("evt_{n}"),
            event_type: EventType::AiReasoning,
            timestamp_ms: 1_000 + i64::from(n),
            payload: format!("{{\"n\":{n}}}"),
        }
    }

    #[tokio::test]
    async fn test_create_is_unique() {
        let store = InMemoryEventStore::new();
        store.create_stream("s1").await.unwrap();
        let err = store.create_stream("s1").await.unwrap_err();
        assert!(matches!(err, EventStoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_append_to_missing_stream_fails() {
        let store = InMemoryEventStore::new();
        let err = store.append("nope", record(1)).await.unwrap_err();
        assert!(matches!(err, EventStoreError::StreamNotFound(_)));
    }

    #[tokio::test]
    async fn test_pop_newest_removes_from_tail() {
        let store = InMemoryEventStore::new();
        store.create_stream("s1").await.unwrap();
        store.append("s1", record(1)).await.unwrap();
        store.append("s1", record(2)).await.unwrap();

        let popped = store.pop_newest("s1").await.unwrap().unwrap();
        assert_eq!(popped.event_id, "evt_2");

        let remaining = store.peek_all("s1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].event_id, "evt_1");
    }

    #[tokio::test]
    async fn test_cleanup_expired_drops_idle_streams() {
        let store = InMemoryEventStore::new();
        store.create_stream("old").await.unwrap();
        store.create_stream("fresh").await.unwrap();

        {
            let mut streams = store.streams.write().await;
            streams.get_mut("old").unwrap().last_accessed_at = now_millis() - 60_000;
        }

        let expired = store.cleanup_expired(Duration::from_secs(30)).await.unwrap();
        assert_eq!(expired, vec!["old".to_string()]);
        assert_eq!(store.stream_count().await.unwrap(), 1);
    }
}
