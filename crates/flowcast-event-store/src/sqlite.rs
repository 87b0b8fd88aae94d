//! SQLite Event Store Implementation
//!
//! Durable backend for single-instance deployments. Two tables:
//! `stream_metadata` (one row per stream, counter always equal to the number
//! of stored rows) and `event_queues` (the FIFO itself, AUTOINCREMENT id as
//! the store sequence). Append, eviction and the counter update run in one
//! transaction; WAL keeps concurrent readers off the writer's back.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

use flowcast_protocol::EventType;

use crate::traits::{
    EventQuery, EventRecord, EventStore, EventStoreError, StoredEvent, StreamMetadata, now_millis,
};

/// SQLite-specific error types
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("migration error: {0}")]
    Migration(String),
}

impl From<SqliteStoreError> for EventStoreError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::Database(e) => EventStoreError::Database(e.to_string()),
            SqliteStoreError::StreamNotFound(id) => EventStoreError::StreamNotFound(id),
            SqliteStoreError::Connection(e) => EventStoreError::Connection(e),
            SqliteStoreError::Migration(e) => EventStoreError::Migration(e),
        }
    }
}

/// Configuration for the SQLite event store
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database file path (`:memory:` supported for tests)
    pub database_path: PathBuf,
    /// Connection pool size
    pub max_connections: u32,
    /// Writer busy-timeout
    pub busy_timeout: Duration,
    /// Retention cap per stream
    pub max_events_per_stream: u32,
    /// Create the database file when missing
    pub create_if_missing: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("flowcast_events.db"),
            max_connections: 10,
            busy_timeout: Duration::from_secs(5),
            max_events_per_stream: 1_000,
            create_if_missing: true,
        }
    }
}

/// SQLite-backed event store
pub struct SqliteEventStore {
    pool: SqlitePool,
    config: SqliteConfig,
}

impl SqliteEventStore {
    /// Open (or create) the database and run migrations
    pub async fn with_config(config: SqliteConfig) -> Result<Self, SqliteStoreError> {
        info!("Initializing SQLite event store at {:?}", config.database_path);

        if let Some(parent) = config.database_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                SqliteStoreError::Connection(format!("failed to create database directory: {e}"))
            })?;
        }

        let connect_options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(config.create_if_missing)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(connect_options)
            .await?;

        let store = Self { pool, config };
        store.migrate().await?;

        info!("SQLite event store initialized");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), SqliteStoreError> {
        debug!("Running event store migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stream_metadata (
                stream_id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL,
                event_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_queues (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stream_id TEXT NOT NULL,
                event_data TEXT NOT NULL,
                event_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_event_queues_stream_id ON event_queues (stream_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_event_queues_stream_created \
             ON event_queues (stream_id, created_at, id)",
        )
        .execute(&self.pool)
        .await?;

        debug!("Event store migrations completed");
        Ok(())
    }

    fn row_to_event(row: &SqliteRow) -> Result<StoredEvent, EventStoreError> {
        let type_str: String = row.get("event_type");
        let event_type = EventType::parse(&type_str)
            .ok_or_else(|| EventStoreError::InvalidData(format!("unknown event type {type_str}")))?;

        Ok(StoredEvent {
            sequence: row.get::<i64, _>("id") as u64,
            event_id: row.get("event_id"),
            event_type,
            created_at: row.get("created_at"),
            event_data: row.get("event_data"),
        })
    }

    async fn stream_exists(&self, stream_id: &str) -> Result<bool, EventStoreError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM stream_metadata WHERE stream_id = ?)",
        )
        .bind(stream_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    type Error = EventStoreError;

    fn backend_name(&self) -> &'static str {
        "SQLite"
    }

    async fn create_stream(&self, stream_id: &str) -> Result<(), Self::Error> {
        let now = now_millis();
        let result = sqlx::query(
            "INSERT INTO stream_metadata (stream_id, created_at, last_accessed_at, event_count) \
             VALUES (?, ?, ?, 0)",
        )
        .bind(stream_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("Created stream: {}", stream_id);
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(EventStoreError::AlreadyExists(stream_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_stream(&self, stream_id: &str) -> Result<bool, Self::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM event_queues WHERE stream_id = ?")
            .bind(stream_id)
            .execute(&mut *tx)
            .await?;

        let removed = sqlx::query("DELETE FROM stream_metadata WHERE stream_id = ?")
            .bind(stream_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        debug!("Deleted stream: {} (existed: {})", stream_id, removed > 0);
        Ok(removed > 0)
    }

    async fn append(
        &self,
        stream_id: &str,
        record: EventRecord,
    ) -> Result<StoredEvent, Self::Error> {
        let mut tx = self.pool.begin().await?;

        // Write-first so the transaction takes the write lock on its opening
        // statement; a read-then-write upgrade under WAL can fail with a
        // busy-snapshot error the busy timeout never retries
        let row_id: i64 = sqlx::query_scalar(
            "INSERT INTO event_queues (stream_id, event_data, event_id, event_type, created_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(stream_id)
        .bind(&record.payload)
        .bind(&record.event_id)
        .bind(record.event_type.as_str())
        .bind(record.timestamp_ms)
        .fetch_one(&mut *tx)
        .await?;

        // FIFO eviction down to the retention cap, inside the same transaction
        sqlx::query(
            "DELETE FROM event_queues WHERE stream_id = ? AND id NOT IN ( \
                 SELECT id FROM event_queues WHERE stream_id = ? ORDER BY id DESC LIMIT ?)",
        )
        .bind(stream_id)
        .bind(stream_id)
        .bind(i64::from(self.config.max_events_per_stream))
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            "UPDATE stream_metadata SET \
                 event_count = (SELECT COUNT(*) FROM event_queues WHERE stream_id = ?), \
                 last_accessed_at = ? \
             WHERE stream_id = ?",
        )
        .bind(stream_id)
        .bind(now_millis())
        .bind(stream_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            // Unregistered stream: dropping the transaction rolls the insert back
            return Err(EventStoreError::StreamNotFound(stream_id.to_string()));
        }

        tx.commit().await?;

        Ok(StoredEvent {
            sequence: row_id as u64,
            event_id: record.event_id,
            event_type: record.event_type,
            created_at: record.timestamp_ms,
            event_data: record.payload,
        })
    }

    async fn peek_all(&self, stream_id: &str) -> Result<Vec<StoredEvent>, Self::Error> {
        if !self.stream_exists(stream_id).await? {
            return Err(EventStoreError::StreamNotFound(stream_id.to_string()));
        }

        let rows = sqlx::query(
            "SELECT id, event_id, event_type, event_data, created_at \
             FROM event_queues WHERE stream_id = ? ORDER BY id ASC",
        )
        .bind(stream_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }

    async fn pop_newest(&self, stream_id: &str) -> Result<Option<StoredEvent>, Self::Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, event_id, event_type, event_data, created_at \
             FROM event_queues WHERE stream_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(stream_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let event = Self::row_to_event(&row)?;

        sqlx::query("DELETE FROM event_queues WHERE id = ?")
            .bind(event.sequence as i64)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE stream_metadata SET \
                 event_count = (SELECT COUNT(*) FROM event_queues WHERE stream_id = ?), \
                 last_accessed_at = ? \
             WHERE stream_id = ?",
        )
        .bind(stream_id)
        .bind(now_millis())
        .bind(stream_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(event))
    }

    async fn drain_all(&self, stream_id: &str) -> Result<Vec<StoredEvent>, Self::Error> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT id, event_id, event_type, event_data, created_at \
             FROM event_queues WHERE stream_id = ? ORDER BY id ASC",
        )
        .bind(stream_id)
        .fetch_all(&mut *tx)
        .await?;
        let events: Vec<StoredEvent> = rows
            .iter()
            .map(Self::row_to_event)
            .collect::<Result<_, _>>()?;

        sqlx::query("DELETE FROM event_queues WHERE stream_id = ?")
            .bind(stream_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE stream_metadata SET event_count = 0, last_accessed_at = ? WHERE stream_id = ?",
        )
        .bind(now_millis())
        .bind(stream_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(events)
    }

    async fn has_events(&self, stream_id: &str) -> Result<bool, Self::Error> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM event_queues WHERE stream_id = ?)",
        )
        .bind(stream_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn query(
        &self,
        stream_id: &str,
        query: &EventQuery,
    ) -> Result<Vec<StoredEvent>, Self::Error> {
        if !self.stream_exists(stream_id).await? {
            return Err(EventStoreError::StreamNotFound(stream_id.to_string()));
        }

        let mut sql = String::from(
            "SELECT id, event_id, event_type, event_data, created_at \
             FROM event_queues WHERE stream_id = ?",
        );
        if query.from_timestamp.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if query.until_timestamp.is_some() {
            sql.push_str(" AND created_at <= ?");
        }
        if let Some(types) = &query.event_types {
            let placeholders = vec!["?"; types.len()].join(", ");
            sql.push_str(&format!(" AND event_type IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");
        match (query.limit, query.offset.unwrap_or(0)) {
            (Some(_), _) => sql.push_str(" LIMIT ? OFFSET ?"),
            (None, offset) if offset > 0 => sql.push_str(" LIMIT -1 OFFSET ?"),
            _ => {}
        }

        let mut q = sqlx::query(&sql).bind(stream_id);
        if let Some(from) = query.from_timestamp {
            q = q.bind(from);
        }
        if let Some(until) = query.until_timestamp {
            q = q.bind(until);
        }
        if let Some(types) = &query.event_types {
            for event_type in types {
                q = q.bind(event_type.as_str());
            }
        }
        match (query.limit, query.offset.unwrap_or(0)) {
            (Some(limit), offset) => {
                q = q.bind(limit as i64).bind(offset as i64);
            }
            (None, offset) if offset > 0 => {
                q = q.bind(offset as i64);
            }
            _ => {}
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn stream_metadata(
        &self,
        stream_id: &str,
    ) -> Result<Option<StreamMetadata>, Self::Error> {
        let row = sqlx::query(
            "SELECT stream_id, created_at, last_accessed_at, event_count \
             FROM stream_metadata WHERE stream_id = ?",
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| StreamMetadata {
            stream_id: row.get("stream_id"),
            created_at: row.get("created_at"),
            last_accessed_at: row.get("last_accessed_at"),
            event_count: row.get::<i64, _>("event_count") as u64,
        }))
    }

    async fn touch_stream(&self, stream_id: &str) -> Result<(), Self::Error> {
        let updated = sqlx::query(
            "UPDATE stream_metadata SET last_accessed_at = ? WHERE stream_id = ?",
        )
        .bind(now_millis())
        .bind(stream_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(EventStoreError::StreamNotFound(stream_id.to_string()));
        }
        Ok(())
    }

    async fn cleanup_expired(&self, ttl: Duration) -> Result<Vec<String>, Self::Error> {
        let cutoff = now_millis() - ttl.as_millis() as i64;

        let expired: Vec<String> = sqlx::query_scalar(
            "SELECT stream_id FROM stream_metadata WHERE last_accessed_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        if expired.is_empty() {
            return Ok(expired);
        }

        let mut tx = self.pool.begin().await?;
        for stream_id in &expired {
            sqlx::query("DELETE FROM event_queues WHERE stream_id = ?")
                .bind(stream_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM stream_metadata WHERE stream_id = ?")
                .bind(stream_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!("Expired {} idle streams", expired.len());
        Ok(expired)
    }

    async fn stream_count(&self) -> Result<usize, Self::Error> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stream_metadata")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn total_event_count(&self) -> Result<usize, Self::Error> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM event_queues")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn maintenance(&self) -> Result<(), Self::Error> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        debug!("Event store maintenance completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteEventStore {
        let config = SqliteConfig {
            database_path: ":memory:".into(),
            // A pool of in-memory connections would open distinct databases
            max_connections: 1,
            ..SqliteConfig::default()
        };
        SqliteEventStore::with_config(config).await.unwrap()
    }

    fn record(n: u32) -> EventRecord {
        EventRecord {
            event_id: format!("evt_{n}"),
            event_type: EventType::AiReasoning,
            timestamp_ms: 1_000 + i64::from(n),
            payload: format!("{{\"n\":{n}}}"),
        }
    }

    #[tokio::test]
    async fn test_stream_lifecycle() {
        let store = memory_store().await;

        store.create_stream("s1").await.unwrap();
        let err = store.create_stream("s1").await.unwrap_err();
        assert!(matches!(err, EventStoreError::AlreadyExists(_)));

        let meta = store.stream_metadata("s1").await.unwrap().unwrap();
        assert_eq!(meta.event_count, 0);

        assert!(store.delete_stream("s1").await.unwrap());
        assert!(!store.delete_stream("s1").await.unwrap());
        assert!(store.stream_metadata("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_to_missing_stream_rolls_back() {
        let store = memory_store().await;
        let err = store.append("ghost", record(1)).await.unwrap_err();
        assert!(matches!(err, EventStoreError::StreamNotFound(_)));
        assert_eq!(store.total_event_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_append_updates_counter_transactionally() {
        let store = memory_store().await;
        store.create_stream("s1").await.unwrap();

        for n in 1..=4 {
            store.append("s1", record(n)).await.unwrap();
        }

        let meta = store.stream_metadata("s1").await.unwrap().unwrap();
        let events = store.peek_all("s1").await.unwrap();
        assert_eq!(meta.event_count as usize, events.len());
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn test_fifo_eviction_at_cap() {
        let config = SqliteConfig {
            database_path: ":memory:".into(),
            max_connections: 1,
            max_events_per_stream: 3,
            ..SqliteConfig::default()
        };
        let store = SqliteEventStore::with_config(config).await.unwrap();
        store.create_stream("s1").await.unwrap();

        for n in 1..=5 {
            store.append("s1", record(n)).await.unwrap();
        }

        let kept: Vec<String> = store
            .peek_all("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(kept, vec!["evt_3", "evt_4", "evt_5"]);

        let meta = store.stream_metadata("s1").await.unwrap().unwrap();
        assert_eq!(meta.event_count, 3);
    }

    #[tokio::test]
    async fn test_query_filters_and_pagination() {
        let store = memory_store().await;
        store.create_stream("s1").await.unwrap();

        for n in 1..=6 {
            let mut rec = record(n);
            if n % 2 == 0 {
                rec.event_type = EventType::CommandStarted;
            }
            store.append("s1", rec).await.unwrap();
        }

        let commands = store
            .query(
                "s1",
                &EventQuery {
                    event_types: Some(vec![EventType::CommandStarted]),
                    ..EventQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(commands.len(), 3);

        let page = store
            .query(
                "s1",
                &EventQuery {
                    limit: Some(2),
                    offset: Some(1),
                    ..EventQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].event_id, "evt_2");

        let late = store
            .query(
                "s1",
                &EventQuery {
                    from_timestamp: Some(1_005),
                    ..EventQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(late.len(), 2);
    }

    #[tokio::test]
    async fn test_events_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");

        {
            let store = SqliteEventStore::with_config(SqliteConfig {
                database_path: path.clone(),
                ..SqliteConfig::default()
            })
            .await
            .unwrap();
            store.create_stream("s1").await.unwrap();
            store.append("s1", record(1)).await.unwrap();
            store.append("s1", record(2)).await.unwrap();
        }

        let reopened = SqliteEventStore::with_config(SqliteConfig {
            database_path: path,
            ..SqliteConfig::default()
        })
        .await
        .unwrap();

        let events = reopened.peek_all("s1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, "evt_1");
        let meta = reopened.stream_metadata("s1").await.unwrap().unwrap();
        assert_eq!(meta.event_count, 2);
    }
}
