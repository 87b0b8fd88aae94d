//! # Flowcast Broker
//!
//! **The core of the Flowcast event streaming broker.**
//!
//! Owns the session registry and its lifecycle state machine, the
//! per-session subscriber tables with compiled filters, the fan-out
//! dispatcher (validate → transactional append → filtered delivery with
//! slow-subscriber isolation), the replay service, and analytics/health.
//!
//! Transports live one crate up (`flowcast-http-server`); persistence one
//! crate down (`flowcast-event-store`). This crate is transport-agnostic:
//! a subscriber is a bounded frame queue plus a cancellation token, and the
//! HTTP layer decides how frames become WebSocket messages or SSE lines.

pub mod analytics;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod filter;
pub mod registry;
pub mod replay;
pub mod session;
pub mod subscriber;

pub use analytics::{AnalyticsSnapshot, BrokerAnalytics, HealthLevel, HealthReport};
pub use broker::{DetailedHealth, EventBroker, MAX_HISTORY_LIMIT, StreamDetails};
pub use config::{BrokerConfig, SessionConfig};
pub use dispatcher::Dispatcher;
pub use filter::{EventFilter, EventPredicate, FilterSet};
pub use registry::{RegistryHealth, SessionObserver, SessionRegistry, StaleSubscriber};
pub use replay::{DEFAULT_BATCH_SIZE, ReplayOptions, ReplayService};
pub use session::{SessionStatus, StreamSession};
pub use subscriber::{
    CloseReason, ConnectionGauge, EnqueueError, Frame, Subscriber, SubscriberState,
    SubscriberTable, TransportKind,
};

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, flowcast_protocol::BrokerError>;
