//! # Flowcast Event Store
//!
//! **Pluggable per-stream event storage for the Flowcast broker.**
//!
//! Provides the core `EventStore` trait, an ordered, bounded, durable FIFO
//! keyed by stream id, with an in-memory backend for development/tests and a
//! SQLite backend for single-instance production. One interface, swappable
//! backends; the conformance suite below runs against both.

mod traits;
pub use traits::*;

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::{InMemoryConfig, InMemoryEventStore};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteConfig, SqliteEventStore, SqliteStoreError};

/// Create a default in-memory event store
pub fn create_memory_store() -> InMemoryEventStore {
    InMemoryEventStore::new()
}

/// Create an in-memory event store with a custom retention cap
pub fn create_memory_store_with_config(config: InMemoryConfig) -> InMemoryEventStore {
    InMemoryEventStore::with_config(config)
}

/// Open a SQLite event store with custom configuration
#[cfg(feature = "sqlite")]
pub async fn create_sqlite_store(
    config: SqliteConfig,
) -> Result<SqliteEventStore, SqliteStoreError> {
    SqliteEventStore::with_config(config).await
}
