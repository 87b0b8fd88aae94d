//! Broker facade
//!
//! One handle owning the registry, store, dispatcher, replay service and
//! analytics. There is no global: construct an `EventBroker`, pass the `Arc`
//! through the construction graph, and drive the `init → serve → shutdown`
//! lifecycle from the binary.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use flowcast_event_store::{BoxedEventStore, EventQuery, StoredEvent};
use flowcast_protocol::{BrokerError, EventCodec, FilterSpec, ReplaySummary, StreamEvent};

use crate::analytics::{BrokerAnalytics, HealthReport};
use crate::config::{BrokerConfig, SessionConfig};
use crate::dispatcher::Dispatcher;
use crate::filter::FilterSet;
use crate::registry::{SessionObserver, SessionRegistry};
use crate::replay::{ReplayOptions, ReplayService};
use crate::session::{SessionStatus, StreamSession};
use crate::subscriber::{CloseReason, ConnectionGauge, Frame, Subscriber, TransportKind};

/// History page size cap for the REST surface
pub const MAX_HISTORY_LIMIT: usize = 1_000;

/// Stream details exposed by `GET /api/streams/{streamId}`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDetails {
    pub stream_id: String,
    pub session_key: String,
    pub status: SessionStatus,
    pub client_count: usize,
    pub event_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity_ms: i64,
    pub config: StreamConfigView,
}

/// Client-visible slice of the session config
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfigView {
    pub max_events: u32,
    pub heartbeat_interval_secs: u64,
    pub max_subscribers: usize,
    pub replay_enabled: bool,
}

/// Store dependency status for detailed health
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    pub backend: &'static str,
    pub reachable: bool,
    pub stream_count: usize,
    pub event_count: usize,
}

/// Detailed health: broker verdict plus dependency status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedHealth {
    #[serde(flatten)]
    pub report: HealthReport,
    pub store: StoreHealth,
}

/// The broker: registry + store + dispatcher + replay + analytics
pub struct EventBroker {
    config: BrokerConfig,
    store: Arc<BoxedEventStore>,
    registry: Arc<SessionRegistry>,
    dispatcher: Dispatcher,
    replay: ReplayService,
    analytics: Arc<BrokerAnalytics>,
    connections: Arc<ConnectionGauge>,
    shutdown: CancellationToken,
}

impl EventBroker {
    /// Build the broker and start its background cleanup task
    pub fn new(store: Arc<BoxedEventStore>, config: BrokerConfig) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let analytics = Arc::new(BrokerAnalytics::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&store),
            config.clone(),
            Arc::clone(&analytics),
        ));
        let codec = EventCodec::new(config.max_string_len);

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            codec,
            Arc::clone(&analytics),
            shutdown.clone(),
        );
        let replay = ReplayService::new(Arc::clone(&store), shutdown.clone());

        registry.spawn_cleanup_task(shutdown.clone());

        Arc::new(Self {
            connections: Arc::new(ConnectionGauge::new(config.max_connections_global)),
            config,
            store,
            registry,
            dispatcher,
            replay,
            analytics,
            shutdown,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn analytics(&self) -> &Arc<BrokerAnalytics> {
        &self.analytics
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend_name()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.registry.add_observer(observer);
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    pub async fn create_session(
        &self,
        session_key: &str,
        config: Option<SessionConfig>,
    ) -> Result<String, BrokerError> {
        self.registry.create(session_key, config).await
    }

    pub async fn destroy_session(&self, session_key: &str) -> Result<bool, BrokerError> {
        self.registry.destroy(session_key).await
    }

    pub async fn session(&self, session_key: &str) -> Option<Arc<StreamSession>> {
        self.registry.get(session_key).await
    }

    pub async fn session_by_stream_id(&self, stream_id: &str) -> Option<Arc<StreamSession>> {
        self.registry.find_by_stream_id(stream_id).await
    }

    pub async fn update_status(
        &self,
        session_key: &str,
        status: SessionStatus,
    ) -> Result<(), BrokerError> {
        self.registry.update_status(session_key, status).await
    }

    pub async fn record_activity(&self, session_key: &str) -> Result<(), BrokerError> {
        self.registry.record_activity(session_key).await
    }

    pub async fn list_active_sessions(&self) -> Vec<String> {
        self.registry.list_active().await
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    pub async fn publish(
        &self,
        session_key: &str,
        event: StreamEvent,
    ) -> Result<StoredEvent, BrokerError> {
        self.dispatcher.publish(session_key, event).await
    }

    pub async fn publish_to_all(&self, event: StreamEvent) -> Result<usize, BrokerError> {
        self.dispatcher.publish_to_all(event).await
    }

    // ------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------

    /// Attach a new subscriber to a session, enforcing the per-session and
    /// global caps. The returned receiver is the transport's frame source.
    pub async fn attach_subscriber(
        &self,
        session: &Arc<StreamSession>,
        transport: TransportKind,
        specs: Vec<FilterSpec>,
    ) -> Result<(Arc<Subscriber>, mpsc::Receiver<Frame>), BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::SessionNotActive(
                "broker is shutting down".to_string(),
            ));
        }
        let status = session.status().await;
        if status.is_terminal() {
            return Err(BrokerError::SessionNotActive(format!(
                "session {} is {status}",
                session.session_key()
            )));
        }

        if !self.connections.try_acquire() {
            return Err(BrokerError::CapacityExceeded(format!(
                "global connection limit {} reached",
                self.config.max_connections_global
            )));
        }

        let (subscriber, rx) = Subscriber::new(
            transport,
            FilterSet::from_specs(specs),
            session.config().buffer_size,
            Arc::clone(&self.connections),
        );

        if let Err(rejected) = session
            .subscribers
            .attach(Arc::clone(&subscriber), session.config().max_subscribers)
        {
            rejected.release_slot();
            return Err(BrokerError::CapacityExceeded(format!(
                "session {} subscriber limit {} reached",
                session.session_key(),
                session.config().max_subscribers
            )));
        }

        self.analytics.subscriber_attached(transport);
        Ok((subscriber, rx))
    }

    /// Idempotent detach; releases the global slot and updates counters
    pub fn detach_subscriber(&self, session: &StreamSession, subscriber_id: &str) {
        if let Some(subscriber) = session.subscribers.detach(subscriber_id) {
            subscriber.release_slot();
            subscriber.mark_closed();
            self.analytics.subscriber_detached(subscriber.transport);
        }
    }

    // ------------------------------------------------------------------
    // Replay and history
    // ------------------------------------------------------------------

    pub async fn replay(
        &self,
        session: &StreamSession,
        subscriber: &Arc<Subscriber>,
        options: ReplayOptions,
    ) -> Result<ReplaySummary, BrokerError> {
        self.replay.replay(session, subscriber, options).await
    }

    /// History page for the REST surface; `limit` is clamped to
    /// `MAX_HISTORY_LIMIT`
    pub async fn history(
        &self,
        stream_id: &str,
        mut query: EventQuery,
    ) -> Result<Vec<StoredEvent>, BrokerError> {
        query.limit = Some(
            query
                .limit
                .map(|l| l.min(MAX_HISTORY_LIMIT))
                .unwrap_or(MAX_HISTORY_LIMIT),
        );
        self.store.query(stream_id, &query).await.map_err(|e| match e {
            flowcast_event_store::EventStoreError::StreamNotFound(id) => {
                BrokerError::NotFound(format!("stream {id}"))
            }
            other => BrokerError::Storage(other.to_string()),
        })
    }

    pub async fn stream_details(&self, stream_id: &str) -> Result<StreamDetails, BrokerError> {
        let session = self
            .session_by_stream_id(stream_id)
            .await
            .ok_or_else(|| BrokerError::NotFound(format!("stream {stream_id}")))?;

        Ok(StreamDetails {
            stream_id: session.stream_id().to_string(),
            session_key: session.session_key().to_string(),
            status: session.status().await,
            client_count: session.subscriber_count(),
            event_count: session.event_count(),
            created_at: session.created_at(),
            last_activity_ms: session.last_activity_ms(),
            config: StreamConfigView {
                max_events: session.config().max_events,
                heartbeat_interval_secs: session.config().heartbeat_interval.as_secs(),
                max_subscribers: session.config().max_subscribers,
                replay_enabled: session.config().replay_enabled,
            },
        })
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    /// Liveness: true unless shutdown has begun
    pub fn is_live(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Full health report with store dependency status
    pub async fn detailed_health(&self) -> DetailedHealth {
        let registry_health = self.registry.health_check().await;

        let (reachable, stream_count, event_count) = match self.store.stream_count().await {
            Ok(streams) => {
                let events = self.store.total_event_count().await.unwrap_or(0);
                (true, streams, events)
            }
            Err(_) => (false, 0, 0),
        };

        let snapshot = self.analytics.snapshot();
        let estimated_retained =
            (snapshot.average_event_size * event_count as f64) as u64;

        let report = self.analytics.health_report(
            &registry_health,
            estimated_retained,
            self.config.memory_budget_bytes,
        );

        DetailedHealth {
            report,
            store: StoreHealth {
                backend: self.store.backend_name(),
                reachable,
                stream_count,
                event_count,
            },
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Graceful shutdown: stop accepting publishes and attaches, drain
    /// subscriber queues up to the grace deadline, close every transport,
    /// then give the store a final maintenance pass.
    pub async fn shutdown(&self) {
        info!("broker shutdown initiated");
        self.shutdown.cancel();

        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            let sessions = self.registry.all_sessions().await;
            let drained = sessions.iter().all(|session| {
                session
                    .subscribers
                    .snapshot()
                    .iter()
                    .all(|s| s.queue_is_drained())
            });
            if drained || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        for session in self.registry.all_sessions().await {
            for subscriber in session.subscribers.close_all(CloseReason::Shutdown) {
                subscriber.release_slot();
                self.analytics.subscriber_detached(subscriber.transport);
            }
        }

        if let Err(e) = self.store.maintenance().await {
            tracing::warn!(error = %e, "store maintenance during shutdown failed");
        }
        info!("broker shutdown complete");
    }
}

impl std::fmt::Debug for EventBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroker")
            .field("store", &self.store.backend_name())
            .field("connections", &self.connections.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcast_event_store::InMemoryEventStore;
    use flowcast_protocol::EventType;

    fn broker() -> Arc<EventBroker> {
        broker_with(BrokerConfig::default())
    }

    fn broker_with(config: BrokerConfig) -> Arc<EventBroker> {
        let store: Arc<BoxedEventStore> = Arc::new(InMemoryEventStore::new());
        EventBroker::new(store, config)
    }

    fn reasoning(session_key: &str, thought: &str) -> StreamEvent {
        StreamEvent::ai_reasoning(session_key, thought, 0.9, "planning")
    }

    fn command(session_key: &str) -> StreamEvent {
        StreamEvent::new(
            EventType::CommandStarted,
            session_key,
            flowcast_protocol::EventData::Command {
                command: flowcast_protocol::CommandData {
                    command_id: "cmd-1".into(),
                    action: "click".into(),
                    parameters: serde_json::json!({}),
                    status: "started".into(),
                    duration: None,
                    result: None,
                },
            },
        )
    }

    fn frame_event_ids(frames: &[Frame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Event { event_id, .. } => Some(event_id.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_publish_requires_session() {
        let broker = broker();
        let err = broker.publish("ghost", reasoning("ghost", "hi")).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_publish_rejects_terminal_session() {
        let broker = broker();
        broker.create_session("s1", None).await.unwrap();
        broker.update_status("s1", SessionStatus::Active).await.unwrap();
        broker.update_status("s1", SessionStatus::Completed).await.unwrap();

        let err = broker.publish("s1", reasoning("s1", "late")).await.unwrap_err();
        assert!(matches!(err, BrokerError::SessionNotActive(_)));
    }

    #[tokio::test]
    async fn test_publish_appends_and_counts() {
        let broker = broker();
        broker.create_session("s1", None).await.unwrap();

        for n in 0..3 {
            broker
                .publish("s1", reasoning("s1", &format!("t{n}")))
                .await
                .unwrap();
        }

        let session = broker.session("s1").await.unwrap();
        assert_eq!(session.event_count(), 3);

        let details = broker
            .stream_details(session.stream_id())
            .await
            .unwrap();
        assert_eq!(details.event_count, 3);

        let history = broker
            .history(session.stream_id(), EventQuery::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 3);
    }

    /// Fan-out correctness: filtered subscriber sees the matching
    /// subsequence, unfiltered sees everything, both in publish order
    #[tokio::test]
    async fn test_filtered_fan_out() {
        let broker = broker();
        broker.create_session("s1", None).await.unwrap();
        let session = broker.session("s1").await.unwrap();

        let (sub_a, mut rx_a) = broker
            .attach_subscriber(
                &session,
                TransportKind::WebSocket,
                vec![FilterSpec::for_types([EventType::AiReasoning])],
            )
            .await
            .unwrap();
        let (sub_b, mut rx_b) = broker
            .attach_subscriber(&session, TransportKind::Sse, vec![])
            .await
            .unwrap();

        let first = broker.publish("s1", reasoning("s1", "think")).await.unwrap();
        let second = broker.publish("s1", command("s1")).await.unwrap();

        let a_frames: Vec<Frame> = std::iter::from_fn(|| rx_a.try_recv().ok()).collect();
        let b_frames: Vec<Frame> = std::iter::from_fn(|| rx_b.try_recv().ok()).collect();

        assert_eq!(frame_event_ids(&a_frames), vec![first.event_id.clone()]);
        assert_eq!(
            frame_event_ids(&b_frames),
            vec![first.event_id, second.event_id]
        );

        drop((sub_a, sub_b));
    }

    /// Slow-subscriber isolation: the overflowing subscriber is detached
    /// with a slow close, the fast one receives everything in order
    #[tokio::test]
    async fn test_slow_subscriber_isolation() {
        let mut config = BrokerConfig::default();
        config.default_session.buffer_size = 16;
        let broker = broker_with(config);

        broker.create_session("s1", None).await.unwrap();
        let session = broker.session("s1").await.unwrap();

        let (slow, _rx_slow_kept_full) = broker
            .attach_subscriber(&session, TransportKind::WebSocket, vec![])
            .await
            .unwrap();
        let (_fast, mut rx_fast) = broker
            .attach_subscriber(&session, TransportKind::WebSocket, vec![])
            .await
            .unwrap();

        // The slow transport never drains: fill its queue to the brim so the
        // next fan-out overflows
        for n in 0..16 {
            slow.enqueue_direct(Frame::Pong).unwrap_or_else(|_| panic!("prefill {n}"));
        }

        let mut published = Vec::new();
        for n in 0..10 {
            let stored = broker
                .publish("s1", reasoning("s1", &format!("t{n}")))
                .await
                .unwrap();
            published.push(stored.event_id);
        }

        let mut received = Vec::new();
        while let Ok(frame) = rx_fast.try_recv() {
            if let Frame::Event { event_id, .. } = frame {
                received.push(event_id);
            }
        }
        assert_eq!(received, published);

        // Slow one got isolated: detached, draining, with the slow reason
        assert_eq!(session.subscriber_count(), 1);
        assert_eq!(slow.close_reason(), Some(CloseReason::SlowSubscriber));
        assert!(slow.cancel.is_cancelled());
        // The store kept all ten regardless
        let history = broker
            .history(session.stream_id(), EventQuery::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 10);
    }

    /// Capacity: the (max+1)-th attach fails and leaves the count unchanged
    #[tokio::test]
    async fn test_subscriber_capacity() {
        let mut config = BrokerConfig::default();
        config.default_session.max_subscribers = 2;
        let broker = broker_with(config);

        broker.create_session("s1", None).await.unwrap();
        let session = broker.session("s1").await.unwrap();

        let (_a, _rx_a) = broker
            .attach_subscriber(&session, TransportKind::Sse, vec![])
            .await
            .unwrap();
        let (_b, _rx_b) = broker
            .attach_subscriber(&session, TransportKind::Sse, vec![])
            .await
            .unwrap();

        let err = broker
            .attach_subscriber(&session, TransportKind::Sse, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::CapacityExceeded(_)));
        assert_eq!(session.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_global_connection_cap() {
        let broker = broker_with(BrokerConfig {
            max_connections_global: 1,
            ..BrokerConfig::default()
        });
        broker.create_session("s1", None).await.unwrap();
        let session = broker.session("s1").await.unwrap();

        let (_a, _rx_a) = broker
            .attach_subscriber(&session, TransportKind::Sse, vec![])
            .await
            .unwrap();
        let err = broker
            .attach_subscriber(&session, TransportKind::Sse, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::CapacityExceeded(_)));

        // Detach frees the slot
        broker.detach_subscriber(&session, &_a.subscriber_id);
        let (_c, _rx_c) = broker
            .attach_subscriber(&session, TransportKind::Sse, vec![])
            .await
            .unwrap();
    }

    /// Replay-then-live: history in order, then the marker, then strictly
    /// newer live events: never interleaved
    #[tokio::test]
    async fn test_replay_then_live_ordering() {
        let broker = broker();
        broker.create_session("s1", None).await.unwrap();
        let session = broker.session("s1").await.unwrap();

        let mut history_ids = Vec::new();
        for n in 0..7 {
            let stored = broker
                .publish("s1", reasoning("s1", &format!("h{n}")))
                .await
                .unwrap();
            history_ids.push(stored.event_id);
        }

        let (subscriber, mut rx) = broker
            .attach_subscriber(&session, TransportKind::WebSocket, vec![])
            .await
            .unwrap();

        // Close the gate as the replay request would, then let live events
        // arrive mid-replay
        subscriber.begin_replay();
        let mut live_ids = Vec::new();
        for n in 0..3 {
            let stored = broker
                .publish("s1", reasoning("s1", &format!("l{n}")))
                .await
                .unwrap();
            live_ids.push(stored.event_id);
        }

        let summary = broker
            .replay(&session, &subscriber, ReplayOptions::default())
            .await
            .unwrap();
        // The snapshot saw every row committed before the query, including
        // the three published after the gate closed; their gated copies are
        // deduplicated at the flush so nothing arrives twice
        assert_eq!(summary.total_events_considered, 10);
        assert_eq!(summary.events_replayed, 10);

        // Strictly newer events, published after the replay completed
        let mut post_ids = Vec::new();
        for n in 0..2 {
            let stored = broker
                .publish("s1", reasoning("s1", &format!("p{n}")))
                .await
                .unwrap();
            post_ids.push(stored.event_id);
        }

        let mut seen = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            match frame {
                Frame::Event { event_id, .. } => seen.push(event_id),
                Frame::ReplayComplete(_) => seen.push("MARKER".into()),
                _ => {}
            }
        }

        let marker_pos = seen.iter().position(|s| s == "MARKER").unwrap();
        let expected_before: Vec<String> = history_ids
            .iter()
            .chain(live_ids.iter())
            .cloned()
            .collect();
        assert_eq!(&seen[..marker_pos], &expected_before[..]);
        assert_eq!(&seen[marker_pos + 1..], &post_ids[..]);
    }

    #[tokio::test]
    async fn test_broadcast_does_not_append() {
        let broker = broker();
        broker.create_session("s1", None).await.unwrap();
        broker.update_status("s1", SessionStatus::Active).await.unwrap();
        let session = broker.session("s1").await.unwrap();

        let (_sub, mut rx) = broker
            .attach_subscriber(&session, TransportKind::Sse, vec![])
            .await
            .unwrap();

        let delivered = broker
            .publish_to_all(StreamEvent::heartbeat("s1"))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(matches!(rx.try_recv(), Ok(Frame::Event { .. })));

        // Ephemeral: nothing in the log, count untouched
        let history = broker
            .history(session.stream_id(), EventQuery::default())
            .await
            .unwrap();
        assert!(history.is_empty());
        assert_eq!(session.event_count(), 0);
    }

    #[tokio::test]
    async fn test_detailed_health_reports_store() {
        let broker = broker();
        broker.create_session("s1", None).await.unwrap();
        broker.publish("s1", reasoning("s1", "x")).await.unwrap();

        let health = broker.detailed_health().await;
        assert!(health.store.reachable);
        assert_eq!(health.store.backend, "InMemory");
        assert_eq!(health.store.event_count, 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let broker = broker();
        broker.create_session("s1", None).await.unwrap();
        let session = broker.session("s1").await.unwrap();

        broker.shutdown().await;

        let err = broker.publish("s1", reasoning("s1", "x")).await.unwrap_err();
        assert!(matches!(err, BrokerError::SessionNotActive(_)));
        let err = broker
            .attach_subscriber(&session, TransportKind::Sse, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::SessionNotActive(_)));
        assert!(!broker.is_live());
    }
}
