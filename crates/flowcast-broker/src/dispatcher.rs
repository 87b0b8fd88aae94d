//! Fan-out dispatcher
//!
//! `publish` is the only way an event enters the system: validate and
//! sanitize, append under the session's single-writer domain, then fan the
//! canonical bytes out to every matching subscriber. The append is the commit
//! point: a publish returns once the store transaction succeeds, and nothing
//! is ever presented to a subscriber before that. Fan-out is best-effort:
//! a slow subscriber is isolated, never the publish rolled back.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use flowcast_event_store::{BoxedEventStore, EventRecord, StoredEvent};
use flowcast_protocol::{BrokerError, EventCodec, StreamEvent};

use crate::analytics::BrokerAnalytics;
use crate::registry::SessionRegistry;
use crate::session::StreamSession;
use crate::subscriber::{CloseReason, EnqueueError, Frame, Subscriber};

/// Publishes events into session logs and fans them out
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    store: Arc<BoxedEventStore>,
    codec: EventCodec,
    analytics: Arc<BrokerAnalytics>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<BoxedEventStore>,
        codec: EventCodec,
        analytics: Arc<BrokerAnalytics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            store,
            codec,
            analytics,
            shutdown,
        }
    }

    /// Publish one event to its session's log and subscribers.
    /// Returns once the store commit succeeds.
    pub async fn publish(
        &self,
        session_key: &str,
        event: StreamEvent,
    ) -> Result<StoredEvent, BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::SessionNotActive(
                "broker is shutting down".to_string(),
            ));
        }

        let session = self
            .registry
            .get(session_key)
            .await
            .ok_or_else(|| BrokerError::NotFound(format!("session {session_key}")))?;

        let status = session.status().await;
        if status.is_terminal() {
            self.analytics.record_error();
            return Err(BrokerError::SessionNotActive(format!(
                "session {session_key} is {status}"
            )));
        }

        let outcome = self.codec.encode(&event).inspect_err(|_| {
            self.analytics.record_error();
        })?;
        for warning in &outcome.warnings {
            warn!(session_key, event_id = %event.id, "{warning}");
        }

        let record = EventRecord {
            event_id: event.id.clone(),
            event_type: event.event_type,
            timestamp_ms: event.timestamp.timestamp_millis(),
            payload: outcome.canonical,
        };

        // Single-writer domain: the append and the fan-out enqueue happen
        // under this guard so every subscriber observes commit order. The
        // enqueues are non-blocking, so the guard is held only across the
        // store commit plus a few try_sends.
        let guard = session.append_lock.lock().await;

        let stored = self
            .store
            .append(session.stream_id(), record)
            .await
            .map_err(|e| {
                self.analytics.record_error();
                BrokerError::Storage(e.to_string())
            })?;

        session.record_event_accepted();
        self.analytics
            .record_event(stored.event_type, stored.event_data.len());

        self.fan_out(&session, &event, &stored);
        drop(guard);

        Ok(stored)
    }

    fn fan_out(&self, session: &StreamSession, event: &StreamEvent, stored: &StoredEvent) {
        let subscribers = session.subscribers.snapshot();
        if subscribers.is_empty() {
            return;
        }

        let json: Arc<str> = Arc::from(stored.event_data.as_str());
        for subscriber in subscribers {
            if !subscriber.matches(event) {
                continue;
            }
            let frame = Frame::Event {
                json: Arc::clone(&json),
                event_id: stored.event_id.clone(),
                event_type: stored.event_type,
            };
            match subscriber.enqueue(frame) {
                Ok(()) => {}
                Err(EnqueueError::Full) => self.isolate_slow(session, &subscriber),
                Err(EnqueueError::Closed) => {
                    // Transport already went away; detach quietly
                    session.subscribers.detach(&subscriber.subscriber_id);
                    subscriber.release_slot();
                    self.analytics.subscriber_detached(subscriber.transport);
                }
            }
        }
    }

    /// Slow-subscriber isolation: mark draining, close the transport with a
    /// "too slow" reason, detach. The rest of the fan-out is unaffected and
    /// the committed append stands.
    fn isolate_slow(&self, session: &StreamSession, subscriber: &Arc<Subscriber>) {
        warn!(
            session_key = session.session_key(),
            subscriber_id = %subscriber.subscriber_id,
            "send queue overflow; isolating slow subscriber"
        );
        subscriber.close(CloseReason::SlowSubscriber);
        session.subscribers.detach(&subscriber.subscriber_id);
        subscriber.release_slot();
        self.analytics.subscriber_detached(subscriber.transport);
    }

    /// Ephemeral broadcast to every active session's matching subscribers.
    /// Never appends to any log. Returns the number of deliveries.
    pub async fn publish_to_all(&self, event: StreamEvent) -> Result<usize, BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::SessionNotActive(
                "broker is shutting down".to_string(),
            ));
        }

        let outcome = self.codec.encode(&event)?;
        let json: Arc<str> = Arc::from(outcome.canonical.as_str());

        let mut delivered = 0usize;
        for key in self.registry.list_active().await {
            let Some(session) = self.registry.get(&key).await else {
                continue;
            };
            for subscriber in session.subscribers.snapshot() {
                if !subscriber.matches(&event) {
                    continue;
                }
                let frame = Frame::Event {
                    json: Arc::clone(&json),
                    event_id: event.id.clone(),
                    event_type: event.event_type,
                };
                match subscriber.enqueue(frame) {
                    Ok(()) => delivered += 1,
                    Err(EnqueueError::Full) => self.isolate_slow(&session, &subscriber),
                    Err(EnqueueError::Closed) => {
                        session.subscribers.detach(&subscriber.subscriber_id);
                        subscriber.release_slot();
                        self.analytics.subscriber_detached(subscriber.transport);
                    }
                }
            }
        }

        debug!(event_id = %event.id, delivered, "broadcast fan-out complete");
        Ok(delivered)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
