//! Session registry
//!
//! Authoritative map from session key to `StreamSession`. Many readers, rare
//! writers: lookups take the read lock, create/destroy/status changes take
//! the write lock briefly. Lifecycle observers are invoked synchronously
//! after a state change commits and must return quickly.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowcast_event_store::BoxedEventStore;
use flowcast_protocol::BrokerError;

use crate::analytics::BrokerAnalytics;
use crate::config::{BrokerConfig, SessionConfig};
use crate::session::{SessionStatus, StreamSession};
use crate::subscriber::CloseReason;

/// Lifecycle observer, invoked synchronously after state changes commit.
/// Implementations needing slow work should forward to a channel or task.
pub trait SessionObserver: Send + Sync {
    fn on_created(&self, _session: &StreamSession) {}
    fn on_destroyed(&self, _session_key: &str) {}
    fn on_status_changed(&self, _session_key: &str, _old: SessionStatus, _new: SessionStatus) {}
    fn on_error(&self, _session_key: &str, _error: &BrokerError) {}
}

/// A subscriber flagged as stale by a health check
#[derive(Debug, Clone)]
pub struct StaleSubscriber {
    pub session_key: String,
    pub subscriber_id: String,
    pub transport: &'static str,
    pub silent_for_ms: i64,
}

/// Registry health summary
#[derive(Debug, Clone, Default)]
pub struct RegistryHealth {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub total_subscribers: usize,
    pub stale_sessions: Vec<String>,
    pub stale_subscribers: Vec<StaleSubscriber>,
}

/// Authoritative session map plus lifecycle machinery
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<StreamSession>>>,
    store: Arc<BoxedEventStore>,
    config: BrokerConfig,
    observers: parking_lot::RwLock<Vec<Arc<dyn SessionObserver>>>,
    analytics: Arc<BrokerAnalytics>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<BoxedEventStore>,
        config: BrokerConfig,
        analytics: Arc<BrokerAnalytics>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            config,
            observers: parking_lot::RwLock::new(Vec::new()),
            analytics,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.write().push(observer);
    }

    fn notify(&self, f: impl Fn(&dyn SessionObserver)) {
        for observer in self.observers.read().iter() {
            f(observer.as_ref());
        }
    }

    /// Create a session and its backing stream; returns the stream id
    pub async fn create(
        &self,
        session_key: &str,
        config: Option<SessionConfig>,
    ) -> Result<String, BrokerError> {
        if session_key.is_empty() {
            return Err(BrokerError::Validation {
                reasons: vec!["session key must be non-empty".to_string()],
            });
        }

        let session = {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(session_key) {
                return Err(BrokerError::AlreadyExists(session_key.to_string()));
            }
            if sessions.len() >= self.config.max_streams {
                return Err(BrokerError::CapacityExceeded(format!(
                    "stream limit {} reached",
                    self.config.max_streams
                )));
            }
            let session = Arc::new(StreamSession::new(
                session_key,
                config.unwrap_or_else(|| self.config.default_session.clone()),
            ));
            sessions.insert(session_key.to_string(), Arc::clone(&session));
            session
        };

        if let Err(e) = self.store.create_stream(session.stream_id()).await {
            // Roll the reservation back so the key stays available
            self.sessions.write().await.remove(session_key);
            let err = BrokerError::Storage(e.to_string());
            self.notify(|o| o.on_error(session_key, &err));
            return Err(err);
        }

        info!(
            session_key,
            stream_id = session.stream_id(),
            "session created"
        );
        self.notify(|o| o.on_created(&session));
        Ok(session.stream_id().to_string())
    }

    /// Destroy a session: disconnect subscribers, optionally drop stored
    /// history, remove from the registry. Idempotent.
    pub async fn destroy(&self, session_key: &str) -> Result<bool, BrokerError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            match sessions.remove(session_key) {
                Some(session) => session,
                None => return Ok(false),
            }
        };

        session.force_status(SessionStatus::Cleanup).await;

        for subscriber in session.subscribers.close_all(CloseReason::SessionDestroyed) {
            subscriber.release_slot();
            self.analytics.subscriber_detached(subscriber.transport);
        }

        if !session.config().persist_history_on_destroy {
            if let Err(e) = self.store.delete_stream(session.stream_id()).await {
                // The session is already gone from the map; report, don't resurrect
                let err = BrokerError::Storage(e.to_string());
                error!(session_key, error = %err, "failed to drop stored history");
                self.notify(|o| o.on_error(session_key, &err));
            }
        }

        info!(session_key, stream_id = session.stream_id(), "session destroyed");
        self.notify(|o| o.on_destroyed(session_key));
        Ok(true)
    }

    pub async fn get(&self, session_key: &str) -> Option<Arc<StreamSession>> {
        self.sessions.read().await.get(session_key).cloned()
    }

    /// Transports address sessions by stream id
    pub async fn find_by_stream_id(&self, stream_id: &str) -> Option<Arc<StreamSession>> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.stream_id() == stream_id)
            .cloned()
    }

    /// Keys of sessions currently Active or Busy
    pub async fn list_active(&self) -> Vec<String> {
        let sessions: Vec<Arc<StreamSession>> =
            self.sessions.read().await.values().cloned().collect();

        let mut active = Vec::new();
        for session in sessions {
            if matches!(
                session.status().await,
                SessionStatus::Active | SessionStatus::Busy
            ) {
                active.push(session.session_key().to_string());
            }
        }
        active
    }

    /// Every registered session (any status)
    pub async fn all_sessions(&self) -> Vec<Arc<StreamSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Validated status transition
    pub async fn update_status(
        &self,
        session_key: &str,
        new_status: SessionStatus,
    ) -> Result<(), BrokerError> {
        let session = self
            .get(session_key)
            .await
            .ok_or_else(|| BrokerError::NotFound(format!("session {session_key}")))?;

        match session.transition_to(new_status).await {
            Ok(old) => {
                session.touch();
                debug!(session_key, %old, %new_status, "session status changed");
                self.notify(|o| o.on_status_changed(session_key, old, new_status));
                Ok(())
            }
            Err(current) if current.is_terminal() => Err(BrokerError::SessionNotActive(format!(
                "session {session_key} is {current}"
            ))),
            Err(current) => Err(BrokerError::Validation {
                reasons: vec![format!("illegal status transition {current} -> {new_status}")],
            }),
        }
    }

    pub async fn record_activity(&self, session_key: &str) -> Result<(), BrokerError> {
        let session = self
            .get(session_key)
            .await
            .ok_or_else(|| BrokerError::NotFound(format!("session {session_key}")))?;
        session.touch();
        Ok(())
    }

    /// Count sessions and subscribers, flagging stale ones
    pub async fn health_check(&self) -> RegistryHealth {
        let now = Utc::now().timestamp_millis();
        let stale_session_cutoff = self.config.stale_threshold.as_millis() as i64;

        let sessions = self.all_sessions().await;
        let mut health = RegistryHealth {
            total_sessions: sessions.len(),
            ..RegistryHealth::default()
        };

        for session in sessions {
            let status = session.status().await;
            if matches!(status, SessionStatus::Active | SessionStatus::Busy) {
                health.active_sessions += 1;
            }
            if now - session.last_activity_ms() > stale_session_cutoff {
                health.stale_sessions.push(session.session_key().to_string());
            }

            let stale_sub_cutoff =
                2 * session.config().heartbeat_interval.as_millis() as i64;
            for subscriber in session.subscribers.snapshot() {
                health.total_subscribers += 1;
                let silent_for = now - subscriber.last_seen_ms();
                if silent_for > stale_sub_cutoff {
                    health.stale_subscribers.push(StaleSubscriber {
                        session_key: session.session_key().to_string(),
                        subscriber_id: subscriber.subscriber_id.clone(),
                        transport: subscriber.transport.as_str(),
                        silent_for_ms: silent_for,
                    });
                }
            }
        }

        health
    }

    /// Periodic TTL sweep: destroys idle sessions, then lets the store reap
    /// orphaned streams (history kept past destroy). Runs every
    /// `stream_ttl / 10` until cancelled.
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = std::cmp::max(
            registry.config.stream_ttl / 10,
            std::time::Duration::from_secs(1),
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("cleanup task stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        registry.sweep_expired().await;
                    }
                }
            }
        })
    }

    async fn sweep_expired(&self) {
        let ttl_ms = self.config.stream_ttl.as_millis() as i64;
        let cutoff = Utc::now().timestamp_millis() - ttl_ms;

        let idle_keys: Vec<String> = self
            .all_sessions()
            .await
            .into_iter()
            .filter(|s| s.last_activity_ms() < cutoff)
            .map(|s| s.session_key().to_string())
            .collect();

        for key in &idle_keys {
            match self.destroy(key).await {
                Ok(true) => warn!(session_key = %key, "destroyed idle session past TTL"),
                Ok(false) => {}
                Err(e) => error!(session_key = %key, error = %e, "TTL destroy failed"),
            }
        }

        match self.store.cleanup_expired(self.config.stream_ttl).await {
            Ok(expired) if !expired.is_empty() => {
                debug!(count = expired.len(), "store reaped expired streams");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "store cleanup failed"),
        }
    }
}
