//! # Flowcast HTTP Server
//!
//! **Transport layer for the Flowcast streaming broker.**
//!
//! Serves hyper http1 directly: the REST history/health surface, the SSE
//! adapter, and the WebSocket adapter (HTTP/1.1 upgrade into
//! tokio-tungstenite). Both transports speak the wire contract from
//! `flowcast-protocol` and drive subscribers owned by `flowcast-broker`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowcast_broker::{BrokerConfig, EventBroker};
//! use flowcast_event_store::{BoxedEventStore, InMemoryEventStore};
//! use flowcast_http_server::FlowcastServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store: Arc<BoxedEventStore> = Arc::new(InMemoryEventStore::new());
//!     let broker = EventBroker::new(store, BrokerConfig::default());
//!     let server = FlowcastServer::builder(Arc::clone(&broker))
//!         .bind_address("127.0.0.1:8787".parse()?)
//!         .build();
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod handler;
pub mod response;
pub mod server;
pub mod sse;
pub mod ws;

#[cfg(test)]
mod tests;

pub use handler::{ConnectionQuery, FlowcastHandler};
pub use response::BoxedBody;
pub use server::{FlowcastServer, FlowcastServerBuilder, ServerConfig};

/// Result type for HTTP server operations
pub type Result<T> = std::result::Result<T, HttpServerError>;

/// HTTP server errors
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
