//! Compiled subscriber filters
//!
//! Wire `FilterSpec`s compiled into executable filters, optionally layered
//! with a server-side custom predicate. Within one filter every constraint
//! must hold (AND); across a subscriber's filters one match suffices (OR);
//! an empty set passes everything. A panicking predicate rejects the event
//! for that subscriber and never reaches the dispatcher.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::warn;

use flowcast_protocol::{EventType, FilterSpec, StreamEvent};

/// Server-side predicate over a full event
pub type EventPredicate = Arc<dyn Fn(&StreamEvent) -> bool + Send + Sync>;

/// One compiled filter: a wire spec plus an optional custom predicate
#[derive(Clone)]
pub struct EventFilter {
    pub spec: FilterSpec,
    pub predicate: Option<EventPredicate>,
}

impl EventFilter {
    pub fn from_spec(spec: FilterSpec) -> Self {
        Self {
            spec,
            predicate: None,
        }
    }

    pub fn with_predicate(spec: FilterSpec, predicate: EventPredicate) -> Self {
        Self {
            spec,
            predicate: Some(predicate),
        }
    }

    /// AND of the spec constraints and the predicate. A predicate panic is
    /// caught and counts as reject.
    pub fn matches(&self, event: &StreamEvent) -> bool {
        if !self.spec.matches(event) {
            return false;
        }
        match &self.predicate {
            None => true,
            Some(predicate) => {
                match catch_unwind(AssertUnwindSafe(|| predicate(event))) {
                    Ok(verdict) => verdict,
                    Err(_) => {
                        warn!(
                            event_id = %event.id,
                            "custom filter predicate panicked; rejecting event for this subscriber"
                        );
                        false
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFilter")
            .field("spec", &self.spec)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// A subscriber's filter set: OR across filters, empty means pass-all
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filters: Vec<EventFilter>,
}

impl FilterSet {
    pub fn new(filters: Vec<EventFilter>) -> Self {
        Self { filters }
    }

    pub fn from_specs(specs: Vec<FilterSpec>) -> Self {
        Self {
            filters: specs.into_iter().map(EventFilter::from_spec).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn matches(&self, event: &StreamEvent) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(event))
    }

    /// `subscribe` control message: add one more filter
    pub fn push(&mut self, filter: EventFilter) {
        self.filters.push(filter);
    }

    /// `filter_update` control message: replace the whole set
    pub fn replace(&mut self, filters: Vec<EventFilter>) {
        self.filters = filters;
    }

    /// `unsubscribe` control message: drop the named types from type-only
    /// filters; with no types, clear back to pass-all
    pub fn unsubscribe(&mut self, event_types: Option<&[EventType]>) {
        match event_types {
            None => self.filters.clear(),
            Some(types) => {
                for filter in &mut self.filters {
                    if filter.predicate.is_none()
                        && filter.spec.session_keys.is_none()
                        && filter.spec.time_range.is_none()
                        && let Some(own) = &mut filter.spec.event_types
                    {
                        own.retain(|t| !types.contains(t));
                    }
                }
                // A type filter emptied by removal would otherwise match nothing
                self.filters.retain(|f| {
                    f.spec
                        .event_types
                        .as_ref()
                        .map(|types| !types.is_empty())
                        .unwrap_or(true)
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reasoning_event() -> StreamEvent {
        StreamEvent::ai_reasoning("sess-1", "t", 0.5, "planning")
    }

    fn command_event() -> StreamEvent {
        StreamEvent::new(
            EventType::CommandStarted,
            "sess-1",
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

    #[test]
    fn test_empty_set_passes_all() {
        let set = FilterSet::default();
        assert!(set.matches(&reasoning_event()));
        assert!(set.matches(&command_event()));
    }

    #[test]
    fn test_or_across_filters() {
        let set = FilterSet::from_specs(vec![
            FilterSpec::for_types([EventType::AiReasoning]),
            FilterSpec::for_types([EventType::CommandStarted]),
        ]);
        assert!(set.matches(&reasoning_event()));
        assert!(set.matches(&command_event()));

        let narrow = FilterSet::from_specs(vec![FilterSpec::for_types([EventType::Heartbeat])]);
        assert!(!narrow.matches(&reasoning_event()));
    }

    #[test]
    fn test_predicate_and_spec_combine_with_and() {
        let filter = EventFilter::with_predicate(
            FilterSpec::for_types([EventType::AiReasoning]),
            Arc::new(|e| e.session_key == "sess-2"),
        );
        // Type matches, predicate does not
        assert!(!filter.matches(&reasoning_event()));
    }

    #[test]
    fn test_panicking_predicate_rejects_without_crashing() {
        let set = FilterSet::new(vec![EventFilter::with_predicate(
            FilterSpec::default(),
            Arc::new(|_| panic!("boom")),
        )]);
        assert!(!set.matches(&reasoning_event()));
        // Still usable afterwards
        assert!(!set.matches(&command_event()));
    }

    #[test]
    fn test_unsubscribe_removes_types_then_clears() {
        let mut set = FilterSet::from_specs(vec![FilterSpec::for_types([
            EventType::AiReasoning,
            EventType::CommandStarted,
        ])]);

        set.unsubscribe(Some(&[EventType::AiReasoning]));
        assert!(!set.matches(&reasoning_event()));
        assert!(set.matches(&command_event()));

        set.unsubscribe(Some(&[EventType::CommandStarted]));
        // Emptied type filter is dropped entirely; set is pass-all again
        assert!(set.is_empty());

        let mut set = FilterSet::from_specs(vec![FilterSpec::for_types([EventType::Heartbeat])]);
        set.unsubscribe(None);
        assert!(set.is_empty());
    }
}
