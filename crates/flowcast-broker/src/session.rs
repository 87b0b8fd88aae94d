//! Stream session lifecycle
//!
//! A session is the lifecycle/state side of a stream: the status state
//! machine, activity bookkeeping, the per-session append serialization
//! domain, and ownership of the subscriber table. Terminal states absorb:
//! nothing publishes to or attaches to a Completed/Failed/Cancelled/Cleanup
//! session.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::subscriber::SubscriberTable;

/// Session lifecycle status.
///
/// Transitions form a DAG with two reversible detours:
/// `Initializing → Active → (Busy ↔ Active) → (Paused ↔ Active) →
/// {Completed | Failed | Cancelled} → Cleanup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Active,
    Busy,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Cleanup,
}

impl SessionStatus {
    /// Terminal states accept no new events and no new subscribers
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Cleanup
        )
    }

    /// Whether the lifecycle DAG permits `self → next`
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match self {
            Initializing => matches!(next, Active | Failed | Cancelled),
            Active => matches!(next, Busy | Paused | Completed | Failed | Cancelled),
            Busy => matches!(next, Active | Completed | Failed | Cancelled),
            Paused => matches!(next, Active | Completed | Failed | Cancelled),
            Completed | Failed | Cancelled => matches!(next, Cleanup),
            Cleanup => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Busy => "busy",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stream session: lifecycle state plus the fan-out surface
pub struct StreamSession {
    /// Externally supplied, unique across the registry
    session_key: String,
    /// Internally generated, stable, never reused
    stream_id: String,
    status: RwLock<SessionStatus>,
    created_at: DateTime<Utc>,
    /// Unix millis of the last accepted event or explicit activity
    last_activity: AtomicI64,
    config: SessionConfig,
    /// Count of accepted (committed) events
    event_count: AtomicU64,
    /// Attached subscribers; owned exclusively by this session
    pub(crate) subscribers: SubscriberTable,
    /// Per-session single-writer domain: appends (and the fan-out enqueue
    /// that must observe append order) serialize through this lock
    pub(crate) append_lock: Mutex<()>,
}

impl StreamSession {
    pub fn new(session_key: impl Into<String>, config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            session_key: session_key.into(),
            stream_id: Uuid::now_v7().to_string(),
            status: RwLock::new(SessionStatus::Initializing),
            created_at: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            config,
            event_count: AtomicU64::new(0),
            subscribers: SubscriberTable::new(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.read().await
    }

    pub async fn is_terminal(&self) -> bool {
        self.status.read().await.is_terminal()
    }

    /// Force a status without DAG validation (destroy path only)
    pub(crate) async fn force_status(&self, status: SessionStatus) -> SessionStatus {
        let mut current = self.status.write().await;
        std::mem::replace(&mut *current, status)
    }

    /// Validated transition; returns the previous status
    pub(crate) async fn transition_to(
        &self,
        next: SessionStatus,
    ) -> Result<SessionStatus, SessionStatus> {
        let mut current = self.status.write().await;
        if current.can_transition_to(next) {
            Ok(std::mem::replace(&mut *current, next))
        } else {
            Err(*current)
        }
    }

    /// Bump the activity clock
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub(crate) fn record_event_accepted(&self) {
        self.event_count.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("session_key", &self.session_key)
            .field("stream_id", &self.stream_id)
            .field("event_count", &self.event_count())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
