//! In-flight request map plus a fixed-size ring of recently finished
//! requests.
//!
//! Structured like the teacher's shared trackers: a single `parking_lot`
//! lock guards the maps, and event publication happens strictly after the
//! lock is released so publishing to a slow subscriber never lengthens the
//! critical section (the same discipline the teacher calls out for its own
//! tracker-shaped structures).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;

use crate::events::{Event, EventBus, EventType};

/// The two Ollama-compatible endpoints the proxy rewrite-tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Chat,
    Generate,
}

impl Endpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Chat => "chat",
            Endpoint::Generate => "generate",
        }
    }
}

/// Terminal status recorded when a request finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Success,
    Canceled,
    TimeoutTtfb,
    TimeoutStall,
    TimeoutHard,
    UpstreamError,
    LoopDetected,
    OutputLimitExceeded,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Canceled => "canceled",
            RequestStatus::TimeoutTtfb => "timeout_ttfb",
            RequestStatus::TimeoutStall => "timeout_stall",
            RequestStatus::TimeoutHard => "timeout_hard",
            RequestStatus::UpstreamError => "upstream_error",
            RequestStatus::LoopDetected => "loop_detected",
            RequestStatus::OutputLimitExceeded => "output_limit_exceeded",
        }
    }

    pub fn event_type(self) -> EventType {
        match self {
            RequestStatus::Success => EventType::Done,
            RequestStatus::Canceled => EventType::Canceled,
            RequestStatus::TimeoutTtfb => EventType::TimeoutTtfb,
            RequestStatus::TimeoutStall => EventType::TimeoutStall,
            RequestStatus::TimeoutHard => EventType::TimeoutHard,
            RequestStatus::UpstreamError => EventType::UpstreamError,
            RequestStatus::LoopDetected => EventType::LoopDetected,
            RequestStatus::OutputLimitExceeded => EventType::OutputLimitExceeded,
        }
    }

    /// Parses the `as_str()` wire form back into a status, for the telemetry
    /// API's `status` filter.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "success" => RequestStatus::Success,
            "canceled" => RequestStatus::Canceled,
            "timeout_ttfb" => RequestStatus::TimeoutTtfb,
            "timeout_stall" => RequestStatus::TimeoutStall,
            "timeout_hard" => RequestStatus::TimeoutHard,
            "upstream_error" => RequestStatus::UpstreamError,
            "loop_detected" => RequestStatus::LoopDetected,
            "output_limit_exceeded" => RequestStatus::OutputLimitExceeded,
            _ => return None,
        })
    }
}

/// A live or recently-finished request record.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub id: u64,
    pub endpoint: Endpoint,
    pub model: String,
    pub stream_requested: bool,

    pub start: Instant,
    pub start_wall: chrono::DateTime<Utc>,
    pub first_byte: Option<Instant>,
    pub last_activity: Option<Instant>,

    pub bytes_out: u64,
    pub estimated_prompt_tokens: u32,
    pub chosen_ctx: u32,
    pub output_budget: u32,
    pub upstream_prompt_eval_count: Option<i64>,
    pub upstream_eval_count: Option<i64>,

    pub status: Option<RequestStatus>,
    pub error: Option<String>,

    last_progress_event: Option<Instant>,
    pub output_limit_warned: bool,
}

impl RequestInfo {
    fn new(id: u64, endpoint: Endpoint, model: String, stream_requested: bool) -> Self {
        let now = Instant::now();
        Self {
            id,
            endpoint,
            model,
            stream_requested,
            start: now,
            start_wall: Utc::now(),
            first_byte: None,
            last_activity: None,
            bytes_out: 0,
            estimated_prompt_tokens: 0,
            chosen_ctx: 0,
            output_budget: 0,
            upstream_prompt_eval_count: None,
            upstream_eval_count: None,
            status: None,
            error: None,
            last_progress_event: None,
            output_limit_warned: false,
        }
    }

    pub fn ttfb(&self) -> Option<Duration> {
        self.first_byte.map(|fb| fb.saturating_duration_since(self.start))
    }
}

/// Value-copied snapshot of the tracker's state.
pub struct TrackerSnapshot {
    pub in_flight: Vec<RequestInfo>,
    pub recent: Vec<RequestInfo>,
}

struct Ring {
    buf: Vec<Option<RequestInfo>>,
    head: usize,
    len: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            buf: (0..capacity.max(1)).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, info: RequestInfo) {
        let cap = self.buf.len();
        let idx = (self.head + self.len) % cap;
        if self.len < cap {
            self.buf[idx] = Some(info);
            self.len += 1;
        } else {
            // Evict the oldest (at `head`), insert, advance head.
            self.buf[self.head] = Some(info);
            self.head = (self.head + 1) % cap;
        }
    }

    fn to_vec_oldest_first(&self) -> Vec<RequestInfo> {
        let cap = self.buf.len();
        (0..self.len)
            .filter_map(|i| self.buf[(self.head + i) % cap].clone())
            .collect()
    }
}

struct TrackerState {
    in_flight: HashMap<u64, RequestInfo>,
    recent: Ring,
}

/// Lifecycle tracker. All mutation happens under one lock; the lock is
/// released before anything is published to the event bus.
pub struct Tracker {
    state: Mutex<TrackerState>,
    next_id: AtomicU64,
    events: EventBus,
    progress_interval: Duration,
}

impl Tracker {
    pub fn new(recent_capacity: usize, events: EventBus, progress_interval: Duration) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                in_flight: HashMap::new(),
                recent: Ring::new(recent_capacity),
            }),
            next_id: AtomicU64::new(1),
            events,
            progress_interval,
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a `RequestInfo`, insert it in-flight, and publish
    /// `request_start`.
    pub fn start(&self, id: u64, endpoint: Endpoint, model: String, stream_requested: bool) {
        let info = RequestInfo::new(id, endpoint, model.clone(), stream_requested);
        {
            let mut state = self.state.lock();
            state.in_flight.insert(id, info);
        }
        self.events.publish(Event {
            event_type: EventType::RequestStart,
            request_id: id,
            timestamp: Utc::now(),
            endpoint: Some(endpoint.as_str().to_string()),
            model: Some(model),
            bytes_out: 0,
            estimated_output_tokens: 0,
            ttfb_ms: None,
            last_activity_age_ms: None,
            status: None,
            error: None,
        });
    }

    pub fn update_model(&self, id: u64, model: String) {
        let mut state = self.state.lock();
        if let Some(info) = state.in_flight.get_mut(&id) {
            info.model = model;
        }
    }

    pub fn update_context_data(&self, id: u64, estimated_prompt_tokens: u32, chosen_ctx: u32, output_budget: u32) {
        let mut state = self.state.lock();
        if let Some(info) = state.in_flight.get_mut(&id) {
            info.estimated_prompt_tokens = estimated_prompt_tokens;
            info.chosen_ctx = chosen_ctx;
            info.output_budget = output_budget;
        }
    }

    /// Mark the first non-empty byte received from upstream. Idempotent —
    /// only the first call has an effect.
    pub fn mark_first_byte(&self, id: u64) {
        let publish = {
            let mut state = self.state.lock();
            match state.in_flight.get_mut(&id) {
                Some(info) if info.first_byte.is_none() => {
                    let now = Instant::now();
                    info.first_byte = Some(now);
                    info.last_activity = Some(now);
                    Some((info.endpoint, info.model.clone(), info.ttfb_ms_unlocked()))
                }
                _ => None,
            }
        };
        if let Some((endpoint, model, ttfb_ms)) = publish {
            self.events.publish(Event {
                event_type: EventType::FirstByte,
                request_id: id,
                timestamp: Utc::now(),
                endpoint: Some(endpoint.as_str().to_string()),
                model: Some(model),
                bytes_out: 0,
                estimated_output_tokens: 0,
                ttfb_ms,
                last_activity_age_ms: Some(0),
                status: None,
                error: None,
            });
        }
    }

    /// Record newly-forwarded bytes and throttle-publish a `progress` event.
    pub fn mark_progress(&self, id: u64, bytes: u64) {
        let publish = {
            let mut state = self.state.lock();
            match state.in_flight.get_mut(&id) {
                Some(info) => {
                    let now = Instant::now();
                    info.bytes_out += bytes;
                    info.last_activity = Some(now);

                    let should_publish = match info.last_progress_event {
                        None => true,
                        Some(last) => now.saturating_duration_since(last) >= self.progress_interval,
                    };
                    if should_publish {
                        info.last_progress_event = Some(now);
                        Some((
                            info.endpoint,
                            info.model.clone(),
                            info.bytes_out,
                            info.ttfb_ms_unlocked(),
                        ))
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some((endpoint, model, bytes_out, ttfb_ms)) = publish {
            self.events.publish(Event {
                event_type: EventType::Progress,
                request_id: id,
                timestamp: Utc::now(),
                endpoint: Some(endpoint.as_str().to_string()),
                model: Some(model),
                bytes_out,
                estimated_output_tokens: 0,
                ttfb_ms,
                last_activity_age_ms: Some(0),
                status: None,
                error: None,
            });
        }
    }

    pub fn update_token_counts(&self, id: u64, prompt_eval_count: Option<i64>, eval_count: Option<i64>) {
        let mut state = self.state.lock();
        if let Some(info) = state.in_flight.get_mut(&id) {
            if prompt_eval_count.is_some() {
                info.upstream_prompt_eval_count = prompt_eval_count;
            }
            if eval_count.is_some() {
                info.upstream_eval_count = eval_count;
            }
        }
    }

    pub fn mark_output_limit_warned(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(info) = state.in_flight.get_mut(&id) {
            info.output_limit_warned = true;
        }
    }

    /// Remove `id` from `in_flight`, stamp its terminal status, copy it into
    /// the recent ring, and publish exactly one terminal event.
    pub fn finish(&self, id: u64, status: RequestStatus, error: Option<String>) {
        let finished = {
            let mut state = self.state.lock();
            match state.in_flight.remove(&id) {
                Some(mut info) => {
                    info.status = Some(status);
                    info.error = error;
                    state.recent.push(info.clone());
                    Some(info)
                }
                None => None,
            }
        };

        if let Some(info) = finished {
            self.events.publish(Event {
                event_type: status.event_type(),
                request_id: id,
                timestamp: Utc::now(),
                endpoint: Some(info.endpoint.as_str().to_string()),
                model: Some(info.model.clone()),
                bytes_out: info.bytes_out,
                estimated_output_tokens: info.upstream_eval_count.unwrap_or(0).max(0) as u64,
                ttfb_ms: info.ttfb_ms_unlocked(),
                last_activity_age_ms: info
                    .last_activity
                    .map(|la| la.elapsed().as_millis() as u64),
                status: Some(status.as_str().to_string()),
                error: info.error.clone(),
            });
        }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let state = self.state.lock();
        TrackerSnapshot {
            in_flight: state.in_flight.values().cloned().collect(),
            recent: state.recent.to_vec_oldest_first(),
        }
    }

    pub fn get(&self, id: u64) -> Option<RequestInfo> {
        self.state.lock().in_flight.get(&id).cloned()
    }

    /// Look up `id` in either `in_flight` or the finished ring. Used by
    /// callers that race against an external finisher (the Watchdog) and
    /// still need the final snapshot to record telemetry.
    pub fn find(&self, id: u64) -> Option<RequestInfo> {
        let state = self.state.lock();
        if let Some(info) = state.in_flight.get(&id) {
            return Some(info.clone());
        }
        state.recent.to_vec_oldest_first().into_iter().find(|r| r.id == id)
    }
}

impl RequestInfo {
    fn ttfb_ms_unlocked(&self) -> Option<u64> {
        self.ttfb().map(|d| d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn tracker() -> Tracker {
        Tracker::new(4, EventBus::new(100, 10), StdDuration::from_millis(50))
    }

    #[test]
    fn start_then_finish_moves_id_from_in_flight_to_recent() {
        let t = tracker();
        let id = t.next_id();
        t.start(id, Endpoint::Chat, "m1".into(), false);
        assert!(t.get(id).is_some());

        t.finish(id, RequestStatus::Success, None);
        assert!(t.get(id).is_none());

        let snap = t.snapshot();
        assert!(snap.in_flight.iter().all(|r| r.id != id));
        assert_eq!(snap.recent.iter().filter(|r| r.id == id).count(), 1);
    }

    #[test]
    fn recent_ring_evicts_oldest_first_beyond_capacity() {
        let t = tracker(); // capacity 4
        for i in 0..6 {
            let id = t.next_id();
            t.start(id, Endpoint::Generate, "m".into(), false);
            t.finish(id, RequestStatus::Success, None);
            let _ = i;
        }
        let snap = t.snapshot();
        assert_eq!(snap.recent.len(), 4);
        // ids 1,2 should have been evicted; 3..=6 remain, oldest first.
        let ids: Vec<u64> = snap.recent.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 4, 5, 6]);
    }

    #[test]
    fn ttfb_is_at_least_start_time() {
        let t = tracker();
        let id = t.next_id();
        t.start(id, Endpoint::Chat, "m1".into(), false);
        t.mark_first_byte(id);
        let info = t.get(id).unwrap();
        assert!(info.first_byte.unwrap() >= info.start);
    }

    #[test]
    fn mark_first_byte_is_idempotent() {
        let t = tracker();
        let id = t.next_id();
        t.start(id, Endpoint::Chat, "m1".into(), false);
        t.mark_first_byte(id);
        let first = t.get(id).unwrap().first_byte.unwrap();
        std::thread::sleep(StdDuration::from_millis(5));
        t.mark_first_byte(id);
        let second = t.get(id).unwrap().first_byte.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn progress_events_are_throttled() {
        let t = Tracker::new(4, EventBus::new(100, 10), StdDuration::from_secs(60));
        let id = t.next_id();
        t.start(id, Endpoint::Chat, "m1".into(), false);
        t.mark_progress(id, 10);
        let info_before = t.get(id).unwrap();
        t.mark_progress(id, 10);
        let info_after = t.get(id).unwrap();
        // Both calls accumulate bytes regardless of throttling.
        assert_eq!(info_before.bytes_out, 10);
        assert_eq!(info_after.bytes_out, 20);
    }

    #[test]
    fn finish_on_unknown_id_does_not_panic() {
        let t = tracker();
        t.finish(999, RequestStatus::Success, None);
    }

    #[test]
    fn find_locates_finished_requests_in_the_recent_ring() {
        let t = tracker();
        let id = t.next_id();
        t.start(id, Endpoint::Chat, "m1".into(), false);
        t.finish(id, RequestStatus::TimeoutStall, None);
        let found = t.find(id).expect("finished request still findable");
        assert_eq!(found.status, Some(RequestStatus::TimeoutStall));
    }

    #[test]
    fn status_never_reverts_terminal_to_in_flight() {
        let t = tracker();
        let id = t.next_id();
        t.start(id, Endpoint::Chat, "m1".into(), false);
        t.finish(id, RequestStatus::TimeoutHard, Some("hard timeout".into()));
        let snap = t.snapshot();
        let info = snap.recent.iter().find(|r| r.id == id).unwrap();
        assert_eq!(info.status, Some(RequestStatus::TimeoutHard));
    }
}
