//! Subscribers and the per-session subscriber table
//!
//! A subscriber exclusively owns its transport handle and its bounded send
//! queue. The queue is the backpressure boundary: the dispatcher never waits
//! on a slow transport; overflow detaches the subscriber instead. The replay
//! gate sits in front of the queue so live events published during a replay
//! queue up behind the historical batches.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use flowcast_protocol::{EventType, ReplaySummary, StreamEvent};

use crate::filter::FilterSet;

/// Transport flavor of a subscriber connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Sse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Sse => "sse",
        }
    }
}

/// Subscriber connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Live,
    Draining,
    Closed,
}

/// Why a subscriber's transport is being closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    SlowSubscriber,
    StaleSubscriber,
    WriteTimeout,
    SessionDestroyed,
    Shutdown,
    Fatal { code: u16, message: String },
}

impl CloseReason {
    /// WebSocket close code for this reason
    pub fn ws_code(&self) -> u16 {
        match self {
            Self::SlowSubscriber => 4429,
            Self::StaleSubscriber | Self::WriteTimeout => 4408,
            Self::SessionDestroyed | Self::Shutdown => 1001,
            Self::Fatal { code, .. } => *code,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::SlowSubscriber => "slow_subscriber",
            Self::StaleSubscriber => "stale_subscriber",
            Self::WriteTimeout => "write_timeout",
            Self::SessionDestroyed => "session_destroyed",
            Self::Shutdown => "shutdown",
            Self::Fatal { message, .. } => message,
        }
    }
}

/// Unit of delivery on a subscriber's send queue
#[derive(Debug, Clone)]
pub enum Frame {
    /// A fanned-out event; `json` is the canonical wire JSON, shared across
    /// all subscribers of the fan-out
    Event {
        json: Arc<str>,
        event_id: String,
        event_type: EventType,
    },
    ReplayComplete(ReplaySummary),
    Warning { code: String, message: String },
    Pong,
}

/// Enqueue failure modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Queue (or replay gate) at capacity (slow-subscriber territory)
    Full,
    /// Receiver side is gone
    Closed,
}

/// Global connection budget shared by every session's table
#[derive(Debug)]
pub struct ConnectionGauge {
    current: AtomicUsize,
    max: usize,
}

impl ConnectionGauge {
    pub fn new(max: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            max,
        }
    }

    /// Reserve one slot; false when the global cap is reached
    pub fn try_acquire(&self) -> bool {
        let mut current = self.current.load(Ordering::Relaxed);
        loop {
            if current >= self.max {
                return false;
            }
            match self.current.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release(&self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }
}

/// One attached client connection
pub struct Subscriber {
    pub subscriber_id: String,
    pub transport: TransportKind,
    pub connected_at: DateTime<Utc>,
    last_seen: AtomicI64,
    state: RwLock<SubscriberState>,
    filters: RwLock<FilterSet>,
    tx: mpsc::Sender<Frame>,
    capacity: usize,
    /// Replay gate: while `Some`, live frames buffer here instead of the
    /// queue, bounded by the same capacity
    gate: Mutex<Option<VecDeque<Frame>>>,
    close_reason: Mutex<Option<CloseReason>>,
    /// Cancels the transport tasks serving this subscriber
    pub cancel: CancellationToken,
    gauge: Arc<ConnectionGauge>,
    slot_released: AtomicBool,
}

impl Subscriber {
    /// Build a subscriber plus the receiving end of its send queue
    pub fn new(
        transport: TransportKind,
        filters: FilterSet,
        buffer_size: usize,
        gauge: Arc<ConnectionGauge>,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        let subscriber = Arc::new(Self {
            subscriber_id: Uuid::now_v7().to_string(),
            transport,
            connected_at: Utc::now(),
            last_seen: AtomicI64::new(Utc::now().timestamp_millis()),
            state: RwLock::new(SubscriberState::Connecting),
            filters: RwLock::new(filters),
            tx,
            capacity: buffer_size,
            gate: Mutex::new(None),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
            gauge,
            slot_released: AtomicBool::new(false),
        });
        (subscriber, rx)
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.read()
    }

    pub fn mark_live(&self) {
        *self.state.write() = SubscriberState::Live;
    }

    /// Refresh the liveness clock (pong received, SSE write succeeded)
    pub fn touch_seen(&self) {
        self.last_seen
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    pub fn matches(&self, event: &StreamEvent) -> bool {
        self.filters.read().matches(event)
    }

    /// Run a mutation against the filter set (control messages)
    pub fn update_filters(&self, mutate: impl FnOnce(&mut FilterSet)) {
        mutate(&mut self.filters.write());
    }

    pub fn filter_count(&self) -> usize {
        self.filters.read().len()
    }

    /// Gate-aware enqueue used by live fan-out. While a replay is running
    /// the frame lands in the gate buffer; otherwise straight on the queue.
    pub fn enqueue(&self, frame: Frame) -> Result<(), EnqueueError> {
        let mut gate = self.gate.lock();
        match gate.as_mut() {
            Some(buffer) => {
                if buffer.len() >= self.capacity {
                    return Err(EnqueueError::Full);
                }
                buffer.push_back(frame);
                Ok(())
            }
            None => self.enqueue_to_queue(frame),
        }
    }

    /// Bypass the gate; replay batches and the completion marker use this
    pub fn enqueue_direct(&self, frame: Frame) -> Result<(), EnqueueError> {
        self.enqueue_to_queue(frame)
    }

    fn enqueue_to_queue(&self, frame: Frame) -> Result<(), EnqueueError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(EnqueueError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Close the replay gate: subsequent live frames buffer behind the replay
    pub fn begin_replay(&self) {
        let mut gate = self.gate.lock();
        if gate.is_none() {
            *gate = Some(VecDeque::new());
        }
    }

    /// Deliver the completion marker, flush buffered live frames in arrival
    /// order, and reopen the gate. Held under the gate lock so no live frame
    /// can slip in between the marker and the flush. Frames whose event id is
    /// in `already_replayed` are dropped; they committed between the gate
    /// closing and the store snapshot and were delivered in the batch.
    pub fn finish_replay(
        &self,
        summary: ReplaySummary,
        already_replayed: &std::collections::HashSet<String>,
    ) -> Result<(), EnqueueError> {
        let mut gate = self.gate.lock();
        let buffered = gate.take().unwrap_or_default();

        self.enqueue_to_queue(Frame::ReplayComplete(summary))?;
        for frame in buffered {
            if let Frame::Event { event_id, .. } = &frame
                && already_replayed.contains(event_id)
            {
                continue;
            }
            self.enqueue_to_queue(frame)?;
        }
        Ok(())
    }

    /// Drop the gate without a marker (failed replay); buffered frames still
    /// flow so the subscriber does not silently lose live events
    pub fn abort_replay(&self) {
        let mut gate = self.gate.lock();
        if let Some(buffered) = gate.take() {
            for frame in buffered {
                if self.enqueue_to_queue(frame).is_err() {
                    break;
                }
            }
        }
    }

    /// Transition to Draining, record the close reason, and cancel the
    /// transport tasks. Idempotent; the first reason wins.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut state = self.state.write();
            if matches!(*state, SubscriberState::Closed) {
                return;
            }
            *state = SubscriberState::Draining;
        }
        {
            let mut stored = self.close_reason.lock();
            if stored.is_none() {
                *stored = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Final state once the transport has shut the connection
    pub fn mark_closed(&self) {
        *self.state.write() = SubscriberState::Closed;
    }

    /// Give the global connection slot back exactly once
    pub fn release_slot(&self) {
        if !self.slot_released.swap(true, Ordering::AcqRel) {
            self.gauge.release();
        }
    }

    /// Remaining queue headroom; used by shutdown draining
    pub fn queue_is_drained(&self) -> bool {
        self.tx.capacity() == self.tx.max_capacity()
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("subscriber_id", &self.subscriber_id)
            .field("transport", &self.transport)
            .field("state", &self.state())
            .finish()
    }
}

/// Per-session set of attached subscribers
#[derive(Debug, Default)]
pub struct SubscriberTable {
    inner: RwLock<HashMap<String, Arc<Subscriber>>>,
}

impl SubscriberTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach, enforcing the per-session cap. The global cap is enforced by
    /// the caller through the gauge before the subscriber is built.
    pub fn attach(
        &self,
        subscriber: Arc<Subscriber>,
        max_subscribers: usize,
    ) -> Result<(), Arc<Subscriber>> {
        let mut inner = self.inner.write();
        if inner.len() >= max_subscribers {
            return Err(subscriber);
        }
        debug!(
            subscriber_id = %subscriber.subscriber_id,
            transport = subscriber.transport.as_str(),
            "subscriber attached"
        );
        inner.insert(subscriber.subscriber_id.clone(), subscriber);
        Ok(())
    }

    /// Idempotent removal
    pub fn detach(&self, subscriber_id: &str) -> Option<Arc<Subscriber>> {
        let removed = self.inner.write().remove(subscriber_id);
        if let Some(subscriber) = &removed {
            debug!(subscriber_id = %subscriber.subscriber_id, "subscriber detached");
        }
        removed
    }

    pub fn get(&self, subscriber_id: &str) -> Option<Arc<Subscriber>> {
        self.inner.read().get(subscriber_id).cloned()
    }

    /// Snapshot for fan-out: the lock is released before any send happens,
    /// so slow sends never block attach/detach
    pub fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Detach everyone, closing with the given reason. Returns the detached
    /// subscribers so the caller can release their connection slots.
    pub fn close_all(&self, reason: CloseReason) -> Vec<Arc<Subscriber>> {
        let drained: Vec<Arc<Subscriber>> = self.inner.write().drain().map(|(_, s)| s).collect();
        for subscriber in &drained {
            subscriber.close(reason.clone());
        }
        if !drained.is_empty() {
            warn!(count = drained.len(), reason = reason.as_str(), "closed all subscribers");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_subscriber(buffer: usize) -> (Arc<Subscriber>, mpsc::Receiver<Frame>) {
        Subscriber::new(
            TransportKind::WebSocket,
            FilterSet::default(),
            buffer,
            Arc::new(ConnectionGauge::new(16)),
        )
    }

    fn event_frame(n: u32) -> Frame {
        Frame::Event {
            json: Arc::from(format!("{{\"n\":{n}}}").as_str()),
            event_id: format!("evt_{n}"),
            event_type: EventType::AiReasoning,
        }
    }

    #[tokio::test]
    async fn test_enqueue_overflow_reports_full() {
        let (subscriber, _rx) = test_subscriber(2);
        subscriber.enqueue(event_frame(1)).unwrap();
        subscriber.enqueue(event_frame(2)).unwrap();
        assert_eq!(subscriber.enqueue(event_frame(3)), Err(EnqueueError::Full));
    }

    #[tokio::test]
    async fn test_enqueue_after_receiver_drop_reports_closed() {
        let (subscriber, rx) = test_subscriber(2);
        drop(rx);
        assert_eq!(subscriber.enqueue(event_frame(1)), Err(EnqueueError::Closed));
    }

    #[tokio::test]
    async fn test_replay_gate_defers_live_frames() {
        let (subscriber, mut rx) = test_subscriber(8);

        subscriber.begin_replay();
        // Live fan-out during replay is gated
        subscriber.enqueue(event_frame(10)).unwrap();
        // Replay history goes straight through
        subscriber.enqueue_direct(event_frame(1)).unwrap();
        subscriber.enqueue_direct(event_frame(2)).unwrap();
        subscriber
            .finish_replay(ReplaySummary::default(), &Default::default())
            .unwrap();

        let order: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|frame| match frame {
                Frame::Event { event_id, .. } => event_id,
                Frame::ReplayComplete(_) => "complete".into(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(order, vec!["evt_1", "evt_2", "complete", "evt_10"]);
    }

    #[tokio::test]
    async fn test_gate_respects_capacity() {
        let (subscriber, _rx) = test_subscriber(1);
        subscriber.begin_replay();
        subscriber.enqueue(event_frame(1)).unwrap();
        assert_eq!(subscriber.enqueue(event_frame(2)), Err(EnqueueError::Full));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_first_reason_wins() {
        let (subscriber, _rx) = test_subscriber(2);
        subscriber.close(CloseReason::SlowSubscriber);
        subscriber.close(CloseReason::Shutdown);
        assert_eq!(subscriber.close_reason(), Some(CloseReason::SlowSubscriber));
        assert!(subscriber.cancel.is_cancelled());
        assert_eq!(subscriber.state(), SubscriberState::Draining);
    }

    #[tokio::test]
    async fn test_table_capacity_and_idempotent_detach() {
        let table = SubscriberTable::new();
        let (a, _rx_a) = test_subscriber(2);
        let (b, _rx_b) = test_subscriber(2);

        table.attach(Arc::clone(&a), 1).unwrap();
        assert!(table.attach(Arc::clone(&b), 1).is_err());
        assert_eq!(table.len(), 1);

        assert!(table.detach(&a.subscriber_id).is_some());
        assert!(table.detach(&a.subscriber_id).is_none());
    }

    #[test]
    fn test_gauge_caps_and_releases() {
        let gauge = ConnectionGauge::new(2);
        assert!(gauge.try_acquire());
        assert!(gauge.try_acquire());
        assert!(!gauge.try_acquire());
        gauge.release();
        assert!(gauge.try_acquire());
    }

    #[tokio::test]
    async fn test_release_slot_only_once() {
        let gauge = Arc::new(ConnectionGauge::new(4));
        assert!(gauge.try_acquire());
        let (subscriber, _rx) = Subscriber::new(
            TransportKind::Sse,
            FilterSet::default(),
            2,
            Arc::clone(&gauge),
        );
        subscriber.release_slot();
        subscriber.release_slot();
        assert_eq!(gauge.current(), 0);
    }
}
