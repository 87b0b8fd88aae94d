//! Broker and session configuration

use std::time::Duration;

/// Per-session configuration, defaulted from `BrokerConfig::default_session`
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Retention cap for the session's event log
    pub max_events: u32,
    /// Transport heartbeat cadence; a subscriber silent for twice this long
    /// counts as stale
    pub heartbeat_interval: Duration,
    /// Attach cap for this session
    pub max_subscribers: usize,
    /// Leave stored history in place when the session is destroyed
    /// (TTL cleanup reaps it later)
    pub persist_history_on_destroy: bool,
    pub replay_enabled: bool,
    /// Per-subscriber outbound queue capacity (the backpressure boundary)
    pub buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_events: 1_000,
            heartbeat_interval: Duration::from_secs(30),
            max_subscribers: 32,
            persist_history_on_destroy: false,
            replay_enabled: true,
            buffer_size: 256,
        }
    }
}

/// Broker-wide resource caps and timing knobs
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub max_streams: usize,
    pub max_connections_global: usize,
    /// SSE outbound event cap; oversize events are dropped for that
    /// subscriber with a warning frame
    pub max_event_size_bytes: usize,
    /// WebSocket outbound message cap
    pub max_message_size_bytes: usize,
    /// Per-string sanitizer limit
    pub max_string_len: usize,
    /// Idle sessions older than this are destroyed by the cleanup task,
    /// which runs every `stream_ttl / 10`
    pub stream_ttl: Duration,
    /// Sessions quiet for longer than this are flagged by health checks
    pub stale_threshold: Duration,
    /// Per transport write; exceeding it closes the subscriber
    pub write_timeout: Duration,
    /// Drain budget during graceful shutdown
    pub shutdown_grace: Duration,
    /// Estimated retained bytes beyond this flips health to critical
    pub memory_budget_bytes: u64,
    pub default_session: SessionConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_streams: 1_000,
            max_connections_global: 4_096,
            max_event_size_bytes: 64 * 1024,
            max_message_size_bytes: 1024 * 1024,
            max_string_len: 8 * 1024,
            stream_ttl: Duration::from_secs(3_600),
            stale_threshold: Duration::from_secs(300),
            write_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            memory_budget_bytes: 256 * 1024 * 1024,
            default_session: SessionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = BrokerConfig::default();
        assert!(config.max_event_size_bytes <= config.max_message_size_bytes);
        assert!(config.stale_threshold < config.stream_ttl);
        assert!(config.default_session.buffer_size > 0);
    }
}
