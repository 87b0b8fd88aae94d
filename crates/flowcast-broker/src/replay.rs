//! Replay service
//!
//! Delivers a historical range to one subscriber without disturbing live
//! fan-out. The subscriber's replay gate closes first, so live events that
//! commit during the replay queue up behind the batches; the subscriber sees
//! history, then the `replay_complete` marker, then strictly newer live
//! events: never an interleaving.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use flowcast_event_store::{BoxedEventStore, EventQuery};
use flowcast_protocol::{BrokerError, EventType, ReplayRequest, ReplaySummary, StreamEvent};

use crate::session::StreamSession;
use crate::subscriber::{EnqueueError, Frame, Subscriber};

/// Default batch size between yield pauses
pub const DEFAULT_BATCH_SIZE: usize = 50;
/// Pause between batches so replay never starves live fan-out
const BATCH_PAUSE: Duration = Duration::from_millis(5);

/// Replay parameters
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub from_timestamp: Option<DateTime<Utc>>,
    pub max_events: Option<usize>,
    pub event_types: Option<Vec<EventType>>,
    pub batch_size: usize,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            from_timestamp: None,
            max_events: None,
            event_types: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl From<ReplayRequest> for ReplayOptions {
    fn from(request: ReplayRequest) -> Self {
        Self {
            from_timestamp: request.from_timestamp,
            max_events: request.max_events,
            event_types: request.event_types,
            batch_size: request.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
        }
    }
}

/// Replays stored history to individual subscribers
pub struct ReplayService {
    store: Arc<BoxedEventStore>,
    shutdown: CancellationToken,
}

impl ReplayService {
    pub fn new(store: Arc<BoxedEventStore>, shutdown: CancellationToken) -> Self {
        Self { store, shutdown }
    }

    /// Replay matching history to one subscriber, then release buffered live
    /// events behind a `replay_complete` marker.
    pub async fn replay(
        &self,
        session: &StreamSession,
        subscriber: &Arc<Subscriber>,
        options: ReplayOptions,
    ) -> Result<ReplaySummary, BrokerError> {
        if !session.config().replay_enabled {
            return Err(BrokerError::Validation {
                reasons: vec![format!(
                    "replay is disabled for session {}",
                    session.session_key()
                )],
            });
        }

        let started = Instant::now();
        subscriber.begin_replay();

        let result = self
            .run(session, subscriber, &options, started)
            .await;

        match result {
            Ok((summary, replayed_ids)) => {
                subscriber
                    .finish_replay(summary, &replayed_ids)
                    .map_err(|e| enqueue_to_broker_error(subscriber, e))?;
                debug!(
                    session_key = session.session_key(),
                    subscriber_id = %subscriber.subscriber_id,
                    replayed = summary.events_replayed,
                    considered = summary.total_events_considered,
                    "replay complete"
                );
                Ok(summary)
            }
            Err(err) => {
                // Reopen the gate so live delivery resumes even though the
                // replay itself failed
                subscriber.abort_replay();
                warn!(
                    session_key = session.session_key(),
                    subscriber_id = %subscriber.subscriber_id,
                    error = %err,
                    "replay aborted"
                );
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        session: &StreamSession,
        subscriber: &Arc<Subscriber>,
        options: &ReplayOptions,
        started: Instant,
    ) -> Result<(ReplaySummary, HashSet<String>), BrokerError> {
        // Snapshot the store position: everything committed before this
        // query is history, everything after buffers on the gate
        let query = EventQuery {
            from_timestamp: options.from_timestamp.map(|t| t.timestamp_millis()),
            until_timestamp: None,
            event_types: options.event_types.clone(),
            limit: options.max_events,
            offset: None,
        };
        let history = self
            .store
            .query(session.stream_id(), &query)
            .await
            .map_err(|e| BrokerError::Storage(e.to_string()))?;

        let total_events_considered = history.len();
        let mut events_replayed = 0usize;
        let mut replayed_ids = HashSet::new();

        for batch in history.chunks(options.batch_size.max(1)) {
            if self.shutdown.is_cancelled() || subscriber.cancel.is_cancelled() {
                debug!(
                    subscriber_id = %subscriber.subscriber_id,
                    "replay cancelled at batch boundary"
                );
                break;
            }

            for stored in batch {
                // The subscriber's own filters apply to replayed history too;
                // custom predicates need the typed event back
                let event: StreamEvent =
                    serde_json::from_str(&stored.event_data).map_err(|e| {
                        BrokerError::Serialization(format!(
                            "stored event {} unreadable: {e}",
                            stored.event_id
                        ))
                    })?;
                if !subscriber.matches(&event) {
                    continue;
                }

                subscriber
                    .enqueue_direct(Frame::Event {
                        json: Arc::from(stored.event_data.as_str()),
                        event_id: stored.event_id.clone(),
                        event_type: stored.event_type,
                    })
                    .map_err(|e| enqueue_to_broker_error(subscriber, e))?;
                events_replayed += 1;
                replayed_ids.insert(stored.event_id.clone());
            }

            tokio::time::sleep(BATCH_PAUSE).await;
        }

        Ok((
            ReplaySummary {
                events_replayed,
                total_events_considered,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            replayed_ids,
        ))
    }
}

fn enqueue_to_broker_error(subscriber: &Subscriber, err: EnqueueError) -> BrokerError {
    match err {
        EnqueueError::Full => BrokerError::CapacityExceeded(format!(
            "subscriber {} cannot keep up with replay",
            subscriber.subscriber_id
        )),
        EnqueueError::Closed => BrokerError::Transport(format!(
            "subscriber {} disconnected during replay",
            subscriber.subscriber_id
        )),
    }
}

impl std::fmt::Debug for ReplayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayService").finish_non_exhaustive()
    }
}
