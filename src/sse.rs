//! `GET /events`: streams the Event Bus to a subscriber as Server-Sent
//! Events.
//!
//! Structurally this is the teacher's SSE-response shape from the old
//! `sse.rs` (bounded channel, `Body::from_stream`), repurposed to carry
//! lifecycle events from the Event Bus to the client rather than upstream
//! bytes.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::Response;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::events::format_sse;
use crate::router::AppState;

pub async fn events_handler(State(state): State<AppState>) -> Response {
    let (sub_id, rx) = state.events.subscribe();
    let events = state.events.clone();

    let stream = ReceiverStream::new(rx).map(move |event| {
        Ok::<_, std::io::Error>(bytes::Bytes::from(format_sse(&event)))
    });

    // Unsubscribe when the stream is dropped (client disconnect).
    let guarded = UnsubscribeOnDrop {
        events,
        sub_id,
        inner: Some(stream),
    };

    let body = Body::from_stream(guarded);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap()
}

/// Wraps the subscriber's stream so `unsubscribe` runs when the axum body
/// stream is dropped, whether that's a normal finish or an early client
/// disconnect.
struct UnsubscribeOnDrop<S> {
    events: crate::events::EventBus,
    sub_id: u64,
    inner: Option<S>,
}

impl<S: futures::Stream + Unpin> futures::Stream for UnsubscribeOnDrop<S> {
    type Item = S::Item;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        match self.inner.as_mut() {
            Some(inner) => std::pin::Pin::new(inner).poll_next(cx),
            None => std::task::Poll::Ready(None),
        }
    }
}

impl<S> Drop for UnsubscribeOnDrop<S> {
    fn drop(&mut self) {
        self.events.unsubscribe(self.sub_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventBus, EventType};
    use futures::StreamExt as _;

    #[tokio::test]
    async fn subscriber_receives_formatted_events() {
        let bus = EventBus::new(100, 10);
        let (_id, rx) = bus.subscribe();
        let mut stream = ReceiverStream::new(rx).map(|e| format_sse(&e));

        bus.publish(Event {
            event_type: EventType::Done,
            request_id: 7,
            timestamp: chrono::Utc::now(),
            endpoint: None,
            model: None,
            bytes_out: 0,
            estimated_output_tokens: 0,
            ttfb_ms: None,
            last_activity_age_ms: None,
            status: Some("success".into()),
            error: None,
        });

        let formatted = tokio::time::timeout(std::time::Duration::from_millis(100), stream.next())
            .await
            .expect("event arrived")
            .expect("stream not closed");
        assert!(formatted.starts_with("data: "));
        assert!(formatted.contains("\"request_id\":7"));
    }
}
