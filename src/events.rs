//! Fan-out of lifecycle events to an arbitrary number of subscribers with
//! bounded, lossy per-subscriber queues.
//!
//! Grounded in the teacher's `stream_response`: a bounded `mpsc` channel fed
//! by a background task, non-blocking sends, fail-open on a full channel.
//! Here the same shape is used twice — once for the inbound publisher
//! channel, once per subscriber — because the goal is identical: never let
//! a slow consumer stall the producer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

/// Lifecycle event types, one per terminal/progress condition the spec
/// names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RequestStart,
    FirstByte,
    Progress,
    Done,
    Canceled,
    TimeoutTtfb,
    TimeoutStall,
    TimeoutHard,
    UpstreamError,
    LoopDetected,
    OutputLimitExceeded,
}

/// A single lifecycle event, JSON-serializable for both the `/events` SSE
/// stream and the metrics/telemetry bridge.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub request_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub bytes_out: u64,
    pub estimated_output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_age_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Render an event as one Server-Sent-Events datum. Pure function, no I/O.
pub fn format_sse(event: &Event) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("data: {}\n\n", json)
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_sub_id: AtomicU64,
    subscriber_buffer: usize,
}

/// Single in-memory publish/subscribe bus. Cloning an `EventBus` clones the
/// `Arc` handle to the same forwarder/subscriber set.
#[derive(Clone)]
pub struct EventBus {
    inbound: mpsc::Sender<Event>,
    inner: std::sync::Arc<BusInner>,
    shutdown: std::sync::Arc<AtomicBool>,
}

impl EventBus {
    /// `inbound_buffer` bounds the publisher-facing channel (teacher default
    /// shape: 100-deep); `subscriber_buffer` bounds each subscriber's queue
    /// (10-deep).
    pub fn new(inbound_buffer: usize, subscriber_buffer: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(inbound_buffer.max(1));
        let inner = std::sync::Arc::new(BusInner {
            subscribers: Mutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(1),
            subscriber_buffer: subscriber_buffer.max(1),
        });

        let forwarder_inner = inner.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let subs = forwarder_inner.subscribers.lock();
                for sub in subs.iter() {
                    if sub.tx.try_send(event.clone()).is_err() {
                        trace!(subscriber = sub.id, "dropping event for full/closed subscriber");
                    }
                }
            }
        });

        Self {
            inbound: tx,
            inner,
            shutdown: std::sync::Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish an event. Never blocks: drops silently when the inbound
    /// channel is full or the bus has been shut down.
    pub fn publish(&self, event: Event) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        if self.inbound.try_send(event).is_err() {
            trace!("event bus inbound channel full or closed, dropping event");
        }
    }

    /// Register a new subscriber and return its receiver plus an id usable
    /// with [`EventBus::unsubscribe`].
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(self.inner.subscriber_buffer);
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.subscribers.lock().retain(|s| s.id != id);
    }

    /// Idempotent shutdown: stops accepting new publishes and drops all
    /// subscriber senders, closing their receivers.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.subscribers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_event(id: u64) -> Event {
        Event {
            event_type: EventType::Progress,
            request_id: id,
            timestamp: Utc::now(),
            endpoint: Some("chat".into()),
            model: Some("m1".into()),
            bytes_out: 10,
            estimated_output_tokens: 0,
            ttfb_ms: None,
            last_activity_age_ms: None,
            status: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn subscriber_drained_fast_enough_loses_nothing() {
        let bus = EventBus::new(100, 10);
        let (_id, mut rx) = bus.subscribe();

        for i in 0..5 {
            bus.publish(sample_event(i));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event.request_id);
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn full_subscriber_queue_drops_without_blocking_publisher() {
        let bus = EventBus::new(100, 2);
        let (_id, mut rx) = bus.subscribe();

        // Publish more than the subscriber buffer holds, without ever
        // draining `rx` — publish() must never block.
        for i in 0..20 {
            bus.publish(sample_event(i));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        // At most `subscriber_buffer` events survive; publisher wasn't stalled.
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert!(count <= 2);
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_receiver() {
        let bus = EventBus::new(100, 10);
        let (id, mut rx) = bus.subscribe();
        bus.unsubscribe(id);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_stops_publishing() {
        let bus = EventBus::new(100, 10);
        let (_id, mut rx) = bus.subscribe();
        bus.shutdown();
        bus.shutdown();
        bus.publish(sample_event(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn format_sse_matches_expected_shape() {
        let event = sample_event(42);
        let formatted = format_sse(&event);
        assert!(formatted.starts_with("data: "));
        assert!(formatted.ends_with("\n\n"));
        assert!(formatted.contains("\"request_id\":42"));
    }
}
