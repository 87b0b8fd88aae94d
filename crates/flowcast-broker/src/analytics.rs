//! Broker analytics and health
//!
//! Counters recorded on the publish path must never block it: everything here
//! is an atomic bump or a short parking_lot critical section. Rates are
//! derived from a rolling window of 10-second buckets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};

use flowcast_protocol::EventType;

use crate::registry::RegistryHealth;
use crate::subscriber::TransportKind;

/// Width of one rate bucket
const BUCKET_SECS: u64 = 10;
/// Rolling window length (6 × 10 s = one minute)
const BUCKET_COUNT: usize = 6;

#[derive(Debug)]
struct EpsWindow {
    buckets: [u64; BUCKET_COUNT],
    /// Bucket-epoch (unix seconds / BUCKET_SECS) of the current slot
    epoch: u64,
    peak_eps: f64,
}

impl EpsWindow {
    fn new(now_secs: u64) -> Self {
        Self {
            buckets: [0; BUCKET_COUNT],
            epoch: now_secs / BUCKET_SECS,
            peak_eps: 0.0,
        }
    }

    fn advance(&mut self, now_secs: u64) {
        let epoch = now_secs / BUCKET_SECS;
        if epoch == self.epoch {
            return;
        }
        let retired = self.buckets[(self.epoch % BUCKET_COUNT as u64) as usize];
        let retired_eps = retired as f64 / BUCKET_SECS as f64;
        if retired_eps > self.peak_eps {
            self.peak_eps = retired_eps;
        }

        let steps = (epoch - self.epoch).min(BUCKET_COUNT as u64);
        for i in 1..=steps {
            let idx = ((self.epoch + i) % BUCKET_COUNT as u64) as usize;
            self.buckets[idx] = 0;
        }
        self.epoch = epoch;
    }

    fn record(&mut self, now_secs: u64) {
        self.advance(now_secs);
        self.buckets[(self.epoch % BUCKET_COUNT as u64) as usize] += 1;
    }

    fn current_eps(&mut self, now_secs: u64) -> f64 {
        self.advance(now_secs);
        self.buckets[(self.epoch % BUCKET_COUNT as u64) as usize] as f64 / BUCKET_SECS as f64
    }
}

/// Overall health verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

/// One flagged issue with a suggested action
#[derive(Debug, Clone, Serialize)]
pub struct HealthIssue {
    pub code: String,
    pub message: String,
    pub suggestion: String,
}

/// Point-in-time counters snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSnapshot {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub bytes_transferred: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub current_eps: f64,
    pub average_eps: f64,
    pub peak_eps: f64,
    pub average_event_size: f64,
    pub websocket_subscribers: usize,
    pub sse_subscribers: usize,
    pub uptime_secs: u64,
}

/// Full health report for `/api/health/detailed`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub overall: HealthLevel,
    pub issues: Vec<HealthIssue>,
    pub analytics: AnalyticsSnapshot,
    pub sessions: Value,
}

/// Lock-light counters for the publish hot path
pub struct BrokerAnalytics {
    started_at: Instant,
    events_by_type: RwLock<HashMap<EventType, u64>>,
    total_events: AtomicU64,
    bytes_transferred: AtomicU64,
    error_count: AtomicU64,
    ws_subscribers: AtomicUsize,
    sse_subscribers: AtomicUsize,
    eps: Mutex<EpsWindow>,
}

impl Default for BrokerAnalytics {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerAnalytics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            events_by_type: RwLock::new(HashMap::new()),
            total_events: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            ws_subscribers: AtomicUsize::new(0),
            sse_subscribers: AtomicUsize::new(0),
            eps: Mutex::new(EpsWindow::new(Utc::now().timestamp() as u64)),
        }
    }

    /// Record one committed event
    pub fn record_event(&self, event_type: EventType, bytes: usize) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred
            .fetch_add(bytes as u64, Ordering::Relaxed);
        *self.events_by_type.write().entry(event_type).or_insert(0) += 1;
        self.eps.lock().record(Utc::now().timestamp() as u64);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_attached(&self, transport: TransportKind) {
        match transport {
            TransportKind::WebSocket => self.ws_subscribers.fetch_add(1, Ordering::Relaxed),
            TransportKind::Sse => self.sse_subscribers.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn subscriber_detached(&self, transport: TransportKind) {
        match transport {
            TransportKind::WebSocket => self.ws_subscribers.fetch_sub(1, Ordering::Relaxed),
            TransportKind::Sse => self.sse_subscribers.fetch_sub(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> AnalyticsSnapshot {
        let total_events = self.total_events.load(Ordering::Relaxed);
        let bytes = self.bytes_transferred.load(Ordering::Relaxed);
        let errors = self.error_count.load(Ordering::Relaxed);
        let uptime_secs = self.started_at.elapsed().as_secs();

        let (current_eps, peak_eps) = {
            let mut eps = self.eps.lock();
            let current = eps.current_eps(Utc::now().timestamp() as u64);
            (current, eps.peak_eps.max(current))
        };

        let events_by_type = self
            .events_by_type
            .read()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), *v))
            .collect();

        let attempts = total_events + errors;
        AnalyticsSnapshot {
            total_events,
            events_by_type,
            bytes_transferred: bytes,
            error_count: errors,
            error_rate: if attempts > 0 {
                errors as f64 / attempts as f64
            } else {
                0.0
            },
            current_eps,
            average_eps: if uptime_secs > 0 {
                total_events as f64 / uptime_secs as f64
            } else {
                total_events as f64
            },
            peak_eps,
            average_event_size: if total_events > 0 {
                bytes as f64 / total_events as f64
            } else {
                0.0
            },
            websocket_subscribers: self.ws_subscribers.load(Ordering::Relaxed),
            sse_subscribers: self.sse_subscribers.load(Ordering::Relaxed),
            uptime_secs,
        }
    }

    /// Fold the counters and a registry health check into a verdict
    pub fn health_report(
        &self,
        registry: &RegistryHealth,
        estimated_retained_bytes: u64,
        memory_budget_bytes: u64,
    ) -> HealthReport {
        let analytics = self.snapshot();
        let mut issues = Vec::new();
        let mut overall = HealthLevel::Healthy;

        if analytics.error_rate > 0.05 {
            overall = HealthLevel::Warning;
            issues.push(HealthIssue {
                code: "HIGH_ERROR_RATE".into(),
                message: format!("error rate {:.1}% over 5% threshold", analytics.error_rate * 100.0),
                suggestion: "inspect recent publish failures in the logs".into(),
            });
        }

        if !registry.stale_subscribers.is_empty() {
            overall = HealthLevel::Warning;
            issues.push(HealthIssue {
                code: "STALE_SUBSCRIBERS".into(),
                message: format!(
                    "{} subscriber(s) silent past twice their heartbeat interval",
                    registry.stale_subscribers.len()
                ),
                suggestion: "stale connections will be closed by the heartbeat loop; \
                             check client networks if this persists"
                    .into(),
            });
        }

        if estimated_retained_bytes > memory_budget_bytes {
            overall = HealthLevel::Critical;
            issues.push(HealthIssue {
                code: "MEMORY_OVER_BUDGET".into(),
                message: format!(
                    "estimated retained bytes {estimated_retained_bytes} over budget {memory_budget_bytes}"
                ),
                suggestion: "lower per-stream retention or destroy idle sessions".into(),
            });
        }

        HealthReport {
            overall,
            issues,
            analytics,
            sessions: json!({
                "total": registry.total_sessions,
                "active": registry.active_sessions,
                "subscribers": registry.total_subscribers,
                "stale": registry.stale_sessions,
            }),
        }
    }
}

impl std::fmt::Debug for BrokerAnalytics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerAnalytics")
            .field("total_events", &self.total_events.load(Ordering::Relaxed))
            .field("error_count", &self.error_count.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let analytics = BrokerAnalytics::new();
        analytics.record_event(EventType::AiReasoning, 100);
        analytics.record_event(EventType::AiReasoning, 200);
        analytics.record_event(EventType::CommandStarted, 60);

        let snapshot = analytics.snapshot();
        assert_eq!(snapshot.total_events, 3);
        assert_eq!(snapshot.bytes_transferred, 360);
        assert_eq!(snapshot.events_by_type["AI_REASONING"], 2);
        assert_eq!(snapshot.average_event_size, 120.0);
    }

    #[test]
    fn test_subscriber_counts_by_transport() {
        let analytics = BrokerAnalytics::new();
        analytics.subscriber_attached(TransportKind::WebSocket);
        analytics.subscriber_attached(TransportKind::Sse);
        analytics.subscriber_attached(TransportKind::Sse);
        analytics.subscriber_detached(TransportKind::Sse);

        let snapshot = analytics.snapshot();
        assert_eq!(snapshot.websocket_subscribers, 1);
        assert_eq!(snapshot.sse_subscribers, 1);
    }

    #[test]
    fn test_error_rate_threshold_flips_health() {
        let analytics = BrokerAnalytics::new();
        for _ in 0..9 {
            analytics.record_event(EventType::AiReasoning, 10);
        }
        analytics.record_error();

        let report =
            analytics.health_report(&RegistryHealth::default(), 0, u64::MAX);
        assert_eq!(report.overall, HealthLevel::Warning);
        assert_eq!(report.issues[0].code, "HIGH_ERROR_RATE");
    }

    #[test]
    fn test_memory_budget_is_critical() {
        let analytics = BrokerAnalytics::new();
        let report = analytics.health_report(&RegistryHealth::default(), 10, 5);
        assert_eq!(report.overall, HealthLevel::Critical);
    }

    #[test]
    fn test_healthy_report_has_no_issues() {
        let analytics = BrokerAnalytics::new();
        analytics.record_event(EventType::AiReasoning, 10);
        let report = analytics.health_report(&RegistryHealth::default(), 0, u64::MAX);
        assert_eq!(report.overall, HealthLevel::Healthy);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_eps_window_rolls_over() {
        let mut window = EpsWindow::new(0);
        for _ in 0..20 {
            window.record(5);
        }
        assert_eq!(window.current_eps(5), 2.0);

        // A minute later the window has fully rolled; peak retains the burst
        assert_eq!(window.current_eps(65), 0.0);
        assert_eq!(window.peak_eps, 2.0);
    }
}
