//! Subscriber filter specifications
//!
//! The wire-transportable half of filtering. Constraints inside one spec
//! combine with AND; a subscriber's specs combine with OR (see the broker's
//! filter set). Server-side custom predicates are layered on top by the
//! broker and never cross the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{EventType, StreamEvent};

/// Inclusive timestamp range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// One filter predicate: all present constraints must hold
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<EventType>>,
    /// Only meaningful for global broadcast clients
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_keys: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
}

impl FilterSpec {
    /// Convenience spec constraining only the event type set
    pub fn for_types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            event_types: Some(types.into_iter().collect()),
            ..Self::default()
        }
    }

    /// True when this spec constrains nothing
    pub fn is_empty(&self) -> bool {
        self.event_types.is_none() && self.session_keys.is_none() && self.time_range.is_none()
    }

    /// AND of every present constraint
    pub fn matches(&self, event: &StreamEvent) -> bool {
        if let Some(types) = &self.event_types
            && !types.contains(&event.event_type)
        {
            return false;
        }
        if let Some(keys) = &self.session_keys
            && !keys.iter().any(|k| *k == event.session_key)
        {
            return false;
        }
        if let Some(range) = &self.time_range
            && !range.contains(event.timestamp)
        {
            return false;
        }
        true
    }
}
