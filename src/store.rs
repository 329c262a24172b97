//! Telemetry storage: a trait over request/model history plus an in-memory
//! implementation.
//!
//! Shaped like the Tracker's own ring discipline: a bounded `VecDeque` under
//! a single `parking_lot::Mutex`. A `DiskStore` backend is named here as
//! the production counterpart but is not implemented — out of scope.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::tracker::RequestStatus;

#[derive(Debug, Clone, Serialize)]
pub struct StoredRequest {
    pub id: u64,
    pub endpoint: String,
    pub model: String,
    pub start_wall: DateTime<Utc>,
    pub ttfb_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub bytes_out: u64,
    pub estimated_prompt_tokens: u32,
    pub chosen_ctx: u32,
    pub output_budget: u32,
    pub upstream_prompt_eval_count: Option<i64>,
    pub upstream_eval_count: Option<i64>,
    pub status: RequestStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Overview {
    pub total_requests: u64,
    pub in_flight: u64,
    pub success: u64,
    pub canceled: u64,
    pub timeout: u64,
    pub upstream_error: u64,
    pub loop_detected: u64,
    pub output_limit_exceeded: u64,
    pub avg_ttfb_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ModelSummary {
    pub model: String,
    pub request_count: u64,
    pub avg_prompt_tokens: Option<f64>,
    pub avg_chosen_ctx: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub chosen_ctx: u32,
    pub estimated_prompt_tokens: u32,
    pub value: Option<f64>,
}

/// Which derived quantity `series()` reports in `SeriesPoint::value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeriesMetric {
    #[default]
    CtxUtilization,
    ReqCount,
    GenTokPerS,
    DurationP95,
}

impl SeriesMetric {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ctx_utilization" => SeriesMetric::CtxUtilization,
            "req_count" => SeriesMetric::ReqCount,
            "gen_tok_per_s" => SeriesMetric::GenTokPerS,
            "duration_p95" => SeriesMetric::DurationP95,
            _ => return None,
        })
    }

    fn value_for(self, req: &StoredRequest) -> Option<f64> {
        match self {
            SeriesMetric::CtxUtilization => {
                if req.chosen_ctx > 0 {
                    Some(req.estimated_prompt_tokens as f64 / req.chosen_ctx as f64)
                } else {
                    None
                }
            }
            SeriesMetric::ReqCount => Some(1.0),
            SeriesMetric::GenTokPerS => match (req.upstream_eval_count, req.duration_ms) {
                (Some(tokens), Some(ms)) if ms > 0 => Some(tokens as f64 / (ms as f64 / 1000.0)),
                _ => None,
            },
            // Per-point duration; a true p95 requires aggregating across the
            // whole series, which the caller can do over these raw values.
            SeriesMetric::DurationP95 => req.duration_ms.map(|ms| ms as f64),
        }
    }
}

/// Filter/paging parameters for `Store::list_requests`.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub limit: usize,
    pub offset: usize,
    pub status: Option<RequestStatus>,
    pub model: Option<String>,
    pub reason: Option<String>,
    pub window: Option<Duration>,
}

/// Storage backend for finished-request telemetry. `MemoryStore` is the
/// only implementation shipped; a disk-backed implementation is named but
/// out of scope.
pub trait Store: Send + Sync {
    fn record_start(&self, id: u64, endpoint: &str, model: &str, start_wall: DateTime<Utc>);
    fn update(&self, id: u64, chosen_ctx: u32, output_budget: u32, estimated_prompt_tokens: u32);
    fn finish(&self, request: StoredRequest);
    fn overview(&self, window: Option<Duration>) -> Overview;
    fn list_requests(&self, filter: &RequestFilter) -> Vec<StoredRequest>;
    fn get_request(&self, id: u64) -> Option<StoredRequest>;
    fn list_models(&self) -> Vec<ModelSummary>;
    fn series(&self, model: &str, window: Option<Duration>, metric: SeriesMetric) -> Vec<SeriesPoint>;
}

#[derive(Debug, Clone)]
struct PendingRecord {
    endpoint: String,
    model: String,
    start_wall: DateTime<Utc>,
    chosen_ctx: u32,
    output_budget: u32,
    estimated_prompt_tokens: u32,
}

struct MemoryState {
    pending: HashMap<u64, PendingRecord>,
    finished: VecDeque<StoredRequest>,
}

/// Bounded in-memory telemetry store.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                pending: HashMap::new(),
                finished: VecDeque::with_capacity(capacity.max(1)),
            }),
            capacity: capacity.max(1),
        }
    }
}

impl Store for MemoryStore {
    fn record_start(&self, id: u64, endpoint: &str, model: &str, start_wall: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.pending.insert(
            id,
            PendingRecord {
                endpoint: endpoint.to_string(),
                model: model.to_string(),
                start_wall,
                chosen_ctx: 0,
                output_budget: 0,
                estimated_prompt_tokens: 0,
            },
        );
    }

    fn update(&self, id: u64, chosen_ctx: u32, output_budget: u32, estimated_prompt_tokens: u32) {
        let mut state = self.state.lock();
        if let Some(record) = state.pending.get_mut(&id) {
            record.chosen_ctx = chosen_ctx;
            record.output_budget = output_budget;
            record.estimated_prompt_tokens = estimated_prompt_tokens;
        }
    }

    fn finish(&self, request: StoredRequest) {
        let mut state = self.state.lock();
        state.pending.remove(&request.id);
        if state.finished.len() >= self.capacity {
            state.finished.pop_front();
        }
        state.finished.push_back(request);
    }

    fn overview(&self, window: Option<Duration>) -> Overview {
        let state = self.state.lock();
        let now = Utc::now();
        let mut overview = Overview {
            in_flight: state.pending.len() as u64,
            ..Default::default()
        };
        let mut ttfb_sum = 0u64;
        let mut ttfb_count = 0u64;

        for req in in_window(&state.finished, window, now) {
            overview.total_requests += 1;
            match req.status {
                RequestStatus::Success => overview.success += 1,
                RequestStatus::Canceled => overview.canceled += 1,
                RequestStatus::TimeoutTtfb | RequestStatus::TimeoutStall | RequestStatus::TimeoutHard => {
                    overview.timeout += 1
                }
                RequestStatus::UpstreamError => overview.upstream_error += 1,
                RequestStatus::LoopDetected => overview.loop_detected += 1,
                RequestStatus::OutputLimitExceeded => overview.output_limit_exceeded += 1,
            }
            if let Some(ttfb) = req.ttfb_ms {
                ttfb_sum += ttfb;
                ttfb_count += 1;
            }
        }

        overview.avg_ttfb_ms = if ttfb_count > 0 {
            Some(ttfb_sum as f64 / ttfb_count as f64)
        } else {
            None
        };
        overview
    }

    fn list_requests(&self, filter: &RequestFilter) -> Vec<StoredRequest> {
        let state = self.state.lock();
        let now = Utc::now();
        in_window(&state.finished, filter.window, now)
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| filter.model.as_deref().map_or(true, |m| r.model == m))
            .filter(|r| {
                filter
                    .reason
                    .as_deref()
                    .map_or(true, |reason| r.error.as_deref().is_some_and(|e| e.contains(reason)))
            })
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .skip(filter.offset)
            .take(filter.limit)
            .collect()
    }

    fn get_request(&self, id: u64) -> Option<StoredRequest> {
        let state = self.state.lock();
        state.finished.iter().find(|r| r.id == id).cloned()
    }

    fn list_models(&self) -> Vec<ModelSummary> {
        let state = self.state.lock();
        let mut by_model: HashMap<String, (u64, u64, u64)> = HashMap::new();
        for req in state.finished.iter() {
            let entry = by_model.entry(req.model.clone()).or_insert((0, 0, 0));
            entry.0 += 1;
            entry.1 += req.estimated_prompt_tokens as u64;
            entry.2 += req.chosen_ctx as u64;
        }
        by_model
            .into_iter()
            .map(|(model, (count, tokens, ctx))| ModelSummary {
                model,
                request_count: count,
                avg_prompt_tokens: if count > 0 { Some(tokens as f64 / count as f64) } else { None },
                avg_chosen_ctx: if count > 0 { Some(ctx as f64 / count as f64) } else { None },
            })
            .collect()
    }

    fn series(&self, model: &str, window: Option<Duration>, metric: SeriesMetric) -> Vec<SeriesPoint> {
        let state = self.state.lock();
        let now = Utc::now();
        in_window(&state.finished, window, now)
            .filter(|r| r.model == model)
            .map(|r| SeriesPoint {
                timestamp: r.start_wall,
                chosen_ctx: r.chosen_ctx,
                estimated_prompt_tokens: r.estimated_prompt_tokens,
                value: metric.value_for(r),
            })
            .collect()
    }
}

fn in_window<'a>(
    finished: &'a VecDeque<StoredRequest>,
    window: Option<Duration>,
    now: DateTime<Utc>,
) -> impl Iterator<Item = &'a StoredRequest> {
    finished.iter().filter(move |r| match window {
        None => true,
        Some(w) => {
            let age = now.signed_duration_since(r.start_wall);
            age.to_std().map(|age| age <= w).unwrap_or(true)
        }
    })
}
