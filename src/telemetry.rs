//! Bridges `Tracker`/`Tap` observations into `Store` calls.
//!
//! The direct analogue of the teacher's free `record_*` functions in
//! `metrics.rs` that translate request outcomes into Prometheus series —
//! here the destination is the telemetry `Store` instead.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::store::{Store, StoredRequest};
use crate::tap::TapOutcome;
use crate::tracker::{Endpoint, RequestInfo, RequestStatus};

pub fn record_start(store: &Arc<dyn Store>, id: u64, endpoint: Endpoint, model: &str, start_wall: DateTime<Utc>) {
    store.record_start(id, endpoint.as_str(), model, start_wall);
}

pub fn record_rewrite_decision(
    store: &Arc<dyn Store>,
    id: u64,
    chosen_ctx: u32,
    output_budget: u32,
    estimated_prompt_tokens: u32,
) {
    store.update(id, chosen_ctx, output_budget, estimated_prompt_tokens);
}

/// Finalize a request's store record from its tracker snapshot plus
/// whatever the tap observed in the upstream's final JSON object.
pub fn record_finish(store: &Arc<dyn Store>, info: &RequestInfo, status: RequestStatus, error: Option<String>) {
    let duration_ms = Some(info.start.elapsed().as_millis() as u64);
    store.finish(StoredRequest {
        id: info.id,
        endpoint: info.endpoint.as_str().to_string(),
        model: info.model.clone(),
        start_wall: info.start_wall,
        ttfb_ms: info.ttfb().map(|d| d.as_millis() as u64),
        duration_ms,
        bytes_out: info.bytes_out,
        estimated_prompt_tokens: info.estimated_prompt_tokens,
        chosen_ctx: info.chosen_ctx,
        output_budget: info.output_budget,
        upstream_prompt_eval_count: info.upstream_prompt_eval_count,
        upstream_eval_count: info.upstream_eval_count,
        status,
        error,
    });
}

/// Merge a tap's final observations into a `RequestInfo` copy before
/// handing it to [`record_finish`]. The tracker already applied
/// `update_token_counts`; this exists for callers (the Proxy Handler) that
/// want to attribute upstream-reported duration breakdowns without
/// widening `RequestInfo` itself.
pub fn apply_tap_outcome(info: &mut RequestInfo, outcome: &TapOutcome) {
    if let Some(prompt_eval_count) = outcome.prompt_eval_count {
        info.upstream_prompt_eval_count = Some(prompt_eval_count);
    }
    if let Some(eval_count) = outcome.eval_count {
        info.upstream_eval_count = Some(eval_count);
    }
}
