//! Read-through wrapper around the upstream response body.
//!
//! Shaped exactly like the teacher's `sse::stream_response`: a dedicated
//! `tokio::spawn`ed task consumes `resp.bytes_stream()` and republishes
//! chunks unmodified over an `mpsc` channel into `axum::body::Body`. Unlike
//! the teacher's SSE usage scan, this tap parses Ollama's NDJSON/JSON
//! framing, feeds the loop detector and calibration store, and enforces an
//! output-token ceiling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::calibration::{CalibrationSample, CalibrationStore, Observation};
use crate::loopdetect::LoopDetector;
use crate::tracker::{RequestStatus, Tracker};

/// Why a request's cancellation token was tripped. Set before `cancel()` so
/// the tap (and the handler finishing the tracker entry) know which terminal
/// status to record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    TimeoutTtfb,
    TimeoutStall,
    TimeoutHard,
    LoopDetected,
    OutputLimitExceeded,
}

impl CancelReason {
    pub fn status(self) -> RequestStatus {
        match self {
            CancelReason::TimeoutTtfb => RequestStatus::TimeoutTtfb,
            CancelReason::TimeoutStall => RequestStatus::TimeoutStall,
            CancelReason::TimeoutHard => RequestStatus::TimeoutHard,
            CancelReason::LoopDetected => RequestStatus::LoopDetected,
            CancelReason::OutputLimitExceeded => RequestStatus::OutputLimitExceeded,
        }
    }
}

/// Per-request cancellation context: a `CancellationToken` plus the reason
/// the first canceller recorded. Shared between the Proxy Handler, Watchdog,
/// and this tap.
pub struct RequestCancelToken {
    token: CancellationToken,
    reason: parking_lot::Mutex<Option<CancelReason>>,
}

impl RequestCancelToken {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: parking_lot::Mutex::new(None),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Record `reason` (first writer wins) and cancel the token. Idempotent.
    pub fn cancel(&self, reason: CancelReason) {
        let mut guard = self.reason.lock();
        if guard.is_none() {
            *guard = Some(reason);
        }
        drop(guard);
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for RequestCancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Ndjson,
    Json,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLimitAction {
    Cancel,
    Warn,
}

impl Default for OutputLimitAction {
    fn default() -> Self {
        OutputLimitAction::Warn
    }
}

#[derive(Debug, Clone)]
pub struct TapConfig {
    pub content_type: ContentType,
    pub max_buffer: usize,
    pub output_token_limit: Option<u32>,
    pub output_limit_action: OutputLimitAction,
    pub min_output_bytes: u64,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            content_type: ContentType::Ndjson,
            max_buffer: 1 << 20,
            output_token_limit: None,
            output_limit_action: OutputLimitAction::Warn,
            min_output_bytes: 1024,
        }
    }
}

/// Fields extracted from upstream's final JSON object, used by the
/// Telemetry Bridge to finalize a request's record.
#[derive(Debug, Clone)]
pub struct TapOutcome {
    pub prompt_eval_count: Option<i64>,
    pub eval_count: Option<i64>,
    pub total_duration_ms: Option<u64>,
    pub load_duration_ms: Option<u64>,
    pub prompt_eval_duration_ms: Option<u64>,
    pub eval_duration_ms: Option<u64>,
    pub status: RequestStatus,
    pub error: Option<String>,
}

impl Default for TapOutcome {
    fn default() -> Self {
        Self {
            prompt_eval_count: None,
            eval_count: None,
            total_duration_ms: None,
            load_duration_ms: None,
            prompt_eval_duration_ms: None,
            eval_duration_ms: None,
            status: RequestStatus::Success,
            error: None,
        }
    }
}

struct LineBuffer {
    buf: Vec<u8>,
    max: usize,
    truncated: bool,
}

impl LineBuffer {
    fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max,
            truncated: false,
        }
    }

    /// Append `chunk`, then drain and return every complete line (without
    /// its terminator, trailing `\r` stripped).
    fn push_and_drain_lines(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.append(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // trailing \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    fn append(&mut self, chunk: &[u8]) {
        if self.buf.len() + chunk.len() > self.max {
            let room = self.max.saturating_sub(self.buf.len());
            self.buf.extend_from_slice(&chunk[..room.min(chunk.len())]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(chunk);
        }
    }

    fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

fn duration_ms(nanos: Option<u64>) -> Option<u64> {
    nanos.map(|n| n / 1_000_000)
}

/// Extract the text delta (`message.content` for chat, `response` for
/// generate) and the telemetry fields from one parsed JSON object.
fn extract_from_object(value: &Value, outcome: &mut TapOutcome) -> String {
    let mut text = String::new();
    if let Some(s) = value.get("response").and_then(Value::as_str) {
        text.push_str(s);
    }
    if let Some(s) = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
    {
        text.push_str(s);
    }

    if let Some(n) = value.get("prompt_eval_count").and_then(Value::as_i64) {
        outcome.prompt_eval_count = Some(n);
    }
    if let Some(n) = value.get("eval_count").and_then(Value::as_i64) {
        outcome.eval_count = Some(n);
    }
    outcome.total_duration_ms = duration_ms(value.get("total_duration").and_then(Value::as_u64))
        .or(outcome.total_duration_ms);
    outcome.load_duration_ms = duration_ms(value.get("load_duration").and_then(Value::as_u64))
        .or(outcome.load_duration_ms);
    outcome.prompt_eval_duration_ms =
        duration_ms(value.get("prompt_eval_duration").and_then(Value::as_u64))
            .or(outcome.prompt_eval_duration_ms);
    outcome.eval_duration_ms = duration_ms(value.get("eval_duration").and_then(Value::as_u64))
        .or(outcome.eval_duration_ms);

    text
}

/// Spawn the tap task and return the axum `Response` wrapping the forwarded
/// body stream. `on_complete` runs once, after the stream is exhausted (or
/// an error/cancellation ends it), with the accumulated [`TapOutcome`].
#[allow(clippy::too_many_arguments)]
pub fn spawn_tap(
    resp: reqwest::Response,
    request_id: u64,
    tracker: Arc<Tracker>,
    calibration: Arc<CalibrationStore>,
    sample: CalibrationSample,
    loop_detector: Arc<LoopDetector>,
    cancel: Arc<RequestCancelToken>,
    config: TapConfig,
    on_complete: impl FnOnce(TapOutcome) + Send + 'static,
) -> Response {
    let status = resp.status();
    let headers = resp.headers().clone();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    let closed = Arc::new(AtomicBool::new(false));
    let total_bytes = Arc::new(AtomicU64::new(0));

    tokio::spawn(run_tap(
        resp,
        request_id,
        tracker,
        calibration,
        sample,
        loop_detector,
        cancel,
        config,
        tx,
        closed,
        total_bytes,
        on_complete,
    ));

    let body = Body::from_stream(ReceiverStream::new(rx));
    let mut builder = Response::builder().status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK));
    if let Some(ct) = headers.get(header::CONTENT_TYPE) {
        builder = builder.header(header::CONTENT_TYPE, ct.clone());
    }
    builder.body(body).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .unwrap()
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_tap(
    resp: reqwest::Response,
    request_id: u64,
    tracker: Arc<Tracker>,
    calibration: Arc<CalibrationStore>,
    sample: CalibrationSample,
    loop_detector: Arc<LoopDetector>,
    cancel: Arc<RequestCancelToken>,
    config: TapConfig,
    tx: tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
    closed: Arc<AtomicBool>,
    total_bytes: Arc<AtomicU64>,
    on_complete: impl FnOnce(TapOutcome) + Send + 'static,
) {
    let mut stream = resp.bytes_stream();
    let mut line_buffer = LineBuffer::new(config.max_buffer);
    let mut outcome = TapOutcome::default();
    let mut first_chunk_seen = false;
    let mut limit_exceeded = false;
    let cancel_token = cancel.token();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => None,
            next = stream.next() => next,
        };

        let Some(chunk) = chunk else {
            if cancel.is_cancelled() {
                if let Some(reason) = cancel.reason() {
                    outcome.status = reason.status();
                }
            }
            break;
        };

        match chunk {
            Ok(bytes) => {
                if !bytes.is_empty() {
                    if !first_chunk_seen {
                        first_chunk_seen = true;
                        tracker.mark_first_byte(request_id);
                    }
                    tracker.mark_progress(request_id, bytes.len() as u64);
                    total_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }

                if tx.send(Ok(bytes.clone())).await.is_err() {
                    break;
                }

                let text = match config.content_type {
                    ContentType::Ndjson => {
                        let lines = line_buffer.push_and_drain_lines(&bytes);
                        let mut combined = String::new();
                        for line in lines {
                            if let Ok(value) = serde_json::from_slice::<Value>(&line) {
                                combined.push_str(&extract_from_object(&value, &mut outcome));
                            } else {
                                debug!(request_id, "skipping malformed ndjson line");
                            }
                        }
                        combined
                    }
                    ContentType::Json => {
                        line_buffer.append(&bytes);
                        String::new()
                    }
                    ContentType::Other => String::new(),
                };

                if !text.is_empty() && loop_detector.feed(text.as_bytes()) {
                    cancel.cancel(CancelReason::LoopDetected);
                    tracker.finish(request_id, RequestStatus::LoopDetected, None);
                }

                if !limit_exceeded {
                    if let Some(limit) = config.output_token_limit {
                        let observed = total_bytes.load(Ordering::Relaxed);
                        if observed >= config.min_output_bytes {
                            let params = calibration.get(&sample.model);
                            let estimated =
                                (observed as f64 * params.tokens_per_byte).round() as u32;
                            if estimated >= limit {
                                limit_exceeded = true;
                                match config.output_limit_action {
                                    OutputLimitAction::Cancel => {
                                        cancel.cancel(CancelReason::OutputLimitExceeded);
                                        tracker.finish(
                                            request_id,
                                            RequestStatus::OutputLimitExceeded,
                                            None,
                                        );
                                    }
                                    OutputLimitAction::Warn => {
                                        tracker.mark_output_limit_warned(request_id);
                                        warn!(
                                            request_id,
                                            estimated, limit, "output token limit exceeded, continuing (warn mode)"
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                outcome.status = RequestStatus::UpstreamError;
                outcome.error = Some(e.to_string());
                let _ = tx
                    .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
                    .await;
                break;
            }
        }
    }

    if config.content_type == ContentType::Json {
        let remaining = line_buffer.take_remaining();
        if !remaining.is_empty() {
            if let Ok(value) = serde_json::from_slice::<Value>(&remaining) {
                let text = extract_from_object(&value, &mut outcome);
                if !text.is_empty() {
                    loop_detector.feed(text.as_bytes());
                }
            } else {
                debug!(request_id, "trailing json buffer failed to parse");
            }
        }
    } else {
        let remaining = line_buffer.take_remaining();
        if !remaining.is_empty() {
            if let Ok(value) = serde_json::from_slice::<Value>(&remaining) {
                extract_from_object(&value, &mut outcome);
            }
        }
    }

    if let Some(prompt_eval_count) = outcome.prompt_eval_count {
        calibration.update(&sample, Observation { prompt_eval_count });
        tracker.update_token_counts(request_id, Some(prompt_eval_count), outcome.eval_count);
    } else if outcome.eval_count.is_some() {
        tracker.update_token_counts(request_id, None, outcome.eval_count);
    }

    finish_once(&closed, on_complete, outcome);
}

fn finish_once(closed: &Arc<AtomicBool>, on_complete: impl FnOnce(TapOutcome), outcome: TapOutcome) {
    if closed
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        on_complete(outcome);
    }
}
