//! Proxy Handler: the seven-step request path (identify, track, rewrite,
//! forward, tap, finalize) that fronts the upstream Ollama-compatible
//! server.
//!
//! Request building follows the teacher's `try_request_via_*_protocol`
//! shape in `router.rs` — a plain `reqwest::Client::request` built from a
//! freshly-serialized JSON body and a header map assembled per call, not
//! forwarded verbatim from the client.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use regex::Regex;
use serde_json::Value;
use tracing::{error, warn};

use crate::calibration::{CalibrationSample, Observation};
use crate::config::{OverridePolicy, ThinkDirective};
use crate::estimator::{
    apply_headroom, budget_output_tokens, bucketize, clamp_ctx, estimate_prompt_tokens, PromptFeatures,
};
use crate::loopdetect::LoopDetector;
use crate::metrics;
use crate::retry::{do_with_retry, is_retry_eligible};
use crate::router::AppState;
use crate::tap::{spawn_tap, CancelReason, ContentType, RequestCancelToken, TapConfig, TapOutcome};
use crate::telemetry;
use crate::tracker::{Endpoint, RequestInfo, RequestStatus};

const CLAMPED_HEADER: &str = "x-ollama-ctxproxy-clamped";

pub async fn handle_chat(State(state): State<AppState>, request: Request) -> Response {
    handle_request(state, Endpoint::Chat, request).await
}

pub async fn handle_generate(State(state): State<AppState>, request: Request) -> Response {
    handle_request(state, Endpoint::Generate, request).await
}

async fn handle_request(state: AppState, endpoint: Endpoint, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let raw_body = match axum::body::to_bytes(body, state.config.file().request_body_max_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body exceeds configured maximum").into_response();
        }
    };

    // Malformed or unidentifiable bodies skip rewriting entirely and are
    // forwarded unmodified so the upstream's own error surfaces to the
    // client, rather than the proxy rejecting a request it merely can't
    // optimize.
    let parsed: Option<Value> = serde_json::from_slice(&raw_body).ok();
    let model = parsed
        .as_ref()
        .and_then(|v| v.get("model"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let (mut body, model) = match (parsed, model) {
        (Some(b), Some(m)) => (b, m),
        _ => {
            warn!(endpoint = endpoint.as_str(), "unparseable or unidentifiable request body, forwarding unrewritten");
            return passthrough_inner(state, parts, raw_body).await;
        }
    };
    let stream_requested = body.get("stream").and_then(Value::as_bool).unwrap_or(true);

    let id = state.tracker.next_id();
    state.tracker.start(id, endpoint, model.clone(), stream_requested);
    telemetry::record_start(&state.store, id, endpoint, &model, chrono::Utc::now());

    let cancel = Arc::new(RequestCancelToken::new());
    state.watchdog.register(id, cancel.clone());

    let rewrite = rewrite_body(&state, endpoint, &mut body, &model).await;

    state
        .tracker
        .update_context_data(id, rewrite.estimated_prompt_tokens, rewrite.chosen_ctx, rewrite.output_budget);
    telemetry::record_rewrite_decision(
        &state.store,
        id,
        rewrite.chosen_ctx,
        rewrite.output_budget,
        rewrite.estimated_prompt_tokens,
    );
    metrics::record_context_bucket(&model, rewrite.chosen_ctx);

    let encoded = match serde_json::to_vec(&body) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            finalize(&state, id, RequestStatus::UpstreamError, Some(e.to_string()));
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode rewritten request").into_response();
        }
    };

    let sample = CalibrationSample {
        model: model.clone(),
        endpoint: endpoint.as_str(),
        features: rewrite.features,
        image_tokens: rewrite.features.image_count * rewrite.tokens_per_image,
        chosen_ctx: rewrite.chosen_ctx,
    };

    let url = format!(
        "{}/api/{}",
        state.config.file().upstream_base_url.trim_end_matches('/'),
        endpoint.as_str()
    );
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));

    let result = if stream_requested {
        forward_streaming(&state, id, &url, encoded, headers, cancel.clone(), sample).await
    } else {
        forward_buffered(&state, id, &url, encoded, headers, cancel.clone(), sample).await
    };

    match result {
        Ok(mut response) => {
            if rewrite.clamped {
                response
                    .headers_mut()
                    .insert(CLAMPED_HEADER, header::HeaderValue::from_static("true"));
            }
            response
        }
        Err(response) => response,
    }
}

struct RewriteResult {
    features: PromptFeatures,
    tokens_per_image: u32,
    estimated_prompt_tokens: u32,
    chosen_ctx: u32,
    output_budget: u32,
    clamped: bool,
}

async fn rewrite_body(state: &AppState, endpoint: Endpoint, body: &mut Value, model: &str) -> RewriteResult {
    if let Some(pattern) = &state.system_prompt_strip {
        strip_system_prompt(endpoint, body, pattern);
    }

    let features = extract_features(endpoint, body);

    let cfg = state.config.file();
    let metadata = state
        .metadata_cache
        .get(
            state.config.http_client(),
            &cfg.upstream_base_url,
            model,
            Duration::from_millis(cfg.api_timeout_ms),
        )
        .await;
    let tokens_per_image = metadata.tokens_per_image.unwrap_or(0);

    let params = state.calibration.get(model);
    let estimated_prompt_tokens = estimate_prompt_tokens(&features, &params, tokens_per_image);
    let with_headroom = apply_headroom(estimated_prompt_tokens, cfg.headroom);
    let bucketed = bucketize(with_headroom, &cfg.buckets.0);

    let mut effective_max = cfg.max_ctx;
    if let Some(model_max) = metadata.max_context_length {
        effective_max = effective_max.min(model_max);
    }
    if let Some(safe_max) = params.safe_max_ctx {
        effective_max = effective_max.min(safe_max);
    }
    let chosen_ctx = clamp_ctx(bucketed, cfg.min_ctx, effective_max);

    let options = body
        .as_object_mut()
        .and_then(|obj| obj.entry("options").or_insert_with(|| serde_json::json!({})).as_object_mut());

    let user_num_ctx = options.as_ref().and_then(|o| o.get("num_ctx")).and_then(Value::as_u64).map(|v| v as u32);
    let (mut final_ctx, mut clamped) = apply_override_policy(cfg.override_policy, chosen_ctx, user_num_ctx);
    if final_ctx > effective_max {
        final_ctx = effective_max;
        clamped = true;
    }

    // `output_budget` is a sizing input for `needed = prompt + output` and a
    // telemetry value; it is never written back into the forwarded body
    // (rewrite contract: only `options.num_ctx` and `think` are rewritten).
    let user_num_predict = options.as_ref().and_then(|o| o.get("num_predict")).and_then(Value::as_u64).map(|v| v as u32);
    let has_structured_format = body.get("format").is_some();
    let (output_budget, _source) = budget_output_tokens(
        user_num_predict,
        cfg.default_output_budget,
        cfg.max_output_budget,
        cfg.structured_format_overhead,
        cfg.dynamic_output_budget,
        has_structured_format,
        estimated_prompt_tokens,
    );

    if let Some(options) = body
        .as_object_mut()
        .and_then(|obj| obj.entry("options").or_insert_with(|| serde_json::json!({})).as_object_mut())
    {
        options.insert("num_ctx".to_string(), serde_json::json!(final_ctx));
    }

    if body.get("think").is_none() {
        if let Some(directive) = crate::config::think_directive_for_model(model) {
            if let Some(obj) = body.as_object_mut() {
                let value = match directive {
                    ThinkDirective::Bool(b) => serde_json::json!(b),
                    ThinkDirective::Level(level) => serde_json::json!(level),
                };
                obj.insert("think".to_string(), value);
            }
        }
    }

    RewriteResult {
        features,
        tokens_per_image,
        estimated_prompt_tokens,
        chosen_ctx: final_ctx,
        output_budget,
        clamped,
    }
}

/// Returns `(value, clamped)`. `clamped` here only ever reports `false` — a
/// policy overwriting the user's value is not a clamp. The caller's
/// subsequent `final_ctx > effective_max` check is the sole source of
/// `clamped = true` (§4.10: the header reflects effective-max clamping only,
/// not policy-driven overwrites).
fn apply_override_policy(policy: OverridePolicy, chosen: u32, user: Option<u32>) -> (u32, bool) {
    match (policy, user) {
        (OverridePolicy::Always, Some(_)) => (chosen, false),
        (OverridePolicy::Always, None) => (chosen, false),
        (OverridePolicy::IfMissing, Some(u)) => (u, false),
        (OverridePolicy::IfMissing, None) => (chosen, false),
        (OverridePolicy::IfTooSmall, Some(u)) if u >= chosen => (u, false),
        (OverridePolicy::IfTooSmall, _) => (chosen, false),
    }
}

fn strip_system_prompt(endpoint: Endpoint, body: &mut Value, pattern: &Regex) {
    match endpoint {
        Endpoint::Generate => {
            if let Some(system) = body.get_mut("system").and_then(Value::as_str).map(|s| pattern.replace_all(s, "").into_owned()) {
                body["system"] = serde_json::json!(system);
            }
        }
        Endpoint::Chat => {
            if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
                for message in messages.iter_mut() {
                    if message.get("role").and_then(Value::as_str) == Some("system") {
                        if let Some(content) = message.get("content").and_then(Value::as_str).map(|s| pattern.replace_all(s, "").into_owned()) {
                            message["content"] = serde_json::json!(content);
                        }
                    }
                }
            }
        }
    }
}

fn extract_features(endpoint: Endpoint, body: &Value) -> PromptFeatures {
    match endpoint {
        Endpoint::Generate => {
            let mut text_bytes = body.get("prompt").and_then(Value::as_str).map(str::len).unwrap_or(0) as u64;
            text_bytes += body.get("system").and_then(Value::as_str).map(str::len).unwrap_or(0) as u64;
            let image_count = body.get("images").and_then(Value::as_array).map(|a| a.len()).unwrap_or(0) as u32;
            PromptFeatures {
                message_count: 1,
                text_bytes,
                image_count,
            }
        }
        Endpoint::Chat => {
            let Some(messages) = body.get("messages").and_then(Value::as_array) else {
                return PromptFeatures::default();
            };
            let mut text_bytes = 0u64;
            let mut image_count = 0u32;
            for message in messages {
                image_count += message.get("images").and_then(Value::as_array).map(|a| a.len()).unwrap_or(0) as u32;
                match message.get("content") {
                    Some(Value::String(s)) => text_bytes += s.len() as u64,
                    Some(Value::Array(parts)) => {
                        for part in parts {
                            match part.get("type").and_then(Value::as_str) {
                                Some("text") => {
                                    text_bytes += part.get("text").and_then(Value::as_str).map(str::len).unwrap_or(0) as u64
                                }
                                Some(_) => image_count += 1,
                                None => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
            PromptFeatures {
                message_count: messages.len() as u32,
                text_bytes,
                image_count,
            }
        }
    }
}

async fn forward_streaming(
    state: &AppState,
    id: u64,
    url: &str,
    body: Bytes,
    headers: HeaderMap,
    cancel: Arc<RequestCancelToken>,
    sample: CalibrationSample,
) -> Result<Response, Response> {
    let client = state.config.http_client();
    let cancel_token = cancel.token();

    let send = client.post(url).headers(headers).body(body);
    let response = tokio::select! {
        biased;
        _ = cancel_token.cancelled() => None,
        result = send.send() => Some(result),
    };

    let response = match response {
        None => {
            finalize(state, id, RequestStatus::Canceled, Some("canceled before upstream responded".into()));
            return Err((StatusCode::GATEWAY_TIMEOUT, "request canceled").into_response());
        }
        Some(Ok(resp)) => resp,
        Some(Err(e)) => {
            finalize(state, id, RequestStatus::UpstreamError, Some(e.to_string()));
            return Err((StatusCode::BAD_GATEWAY, format!("upstream connection failed: {}", e)).into_response());
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body_text = response.text().await.unwrap_or_default();
        finalize(state, id, RequestStatus::UpstreamError, Some(format!("upstream status {}", status)));
        return Err((StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY), body_text).into_response());
    }

    let tracker = state.tracker.clone();
    let calibration = state.calibration.clone();
    let loop_detector = Arc::new(LoopDetector::new(state.config.file().loop_detector.normalized()));
    let tap_config = TapConfig {
        content_type: ContentType::Ndjson,
        max_buffer: state.config.file().response_tap_max_bytes,
        output_token_limit: state.config.file().output_token_limit,
        output_limit_action: state.config.file().output_limit_action,
        min_output_bytes: 1024,
    };

    let finish_state = state.clone();
    let response = spawn_tap(
        response,
        id,
        tracker,
        calibration,
        sample,
        loop_detector,
        cancel,
        tap_config,
        move |outcome: TapOutcome| {
            finish_from_tap(&finish_state, id, outcome);
        },
    );

    Ok(response)
}

fn finish_from_tap(state: &AppState, id: u64, outcome: TapOutcome) {
    state.watchdog.deregister(id);
    if let Some(mut info) = state.tracker.find(id) {
        telemetry::apply_tap_outcome(&mut info, &outcome);
        state.tracker.finish(id, outcome.status, outcome.error.clone());
        telemetry::record_finish(&state.store, &info, outcome.status, outcome.error);
        metrics::record_request(&info.model, outcome.status.as_str(), "tap");
        if let Some(ttfb) = info.ttfb() {
            metrics::observe_ttfb(&info.model, ttfb.as_secs_f64());
        }
        metrics::observe_request_duration(&info.model, info.start.elapsed().as_secs_f64());
        if outcome.status == RequestStatus::LoopDetected {
            metrics::record_loop_detection(&info.model);
        }
    }
}

async fn forward_buffered(
    state: &AppState,
    id: u64,
    url: &str,
    body: Bytes,
    headers: HeaderMap,
    cancel: Arc<RequestCancelToken>,
    sample: CalibrationSample,
) -> Result<Response, Response> {
    let cfg = state.config.file();
    let mut retry_config = cfg.retry.clone();
    if !is_retry_eligible(cfg.retry_enabled, false) {
        retry_config.max_retries = 0;
    }

    let cancel_token = cancel.token();
    let outcome = do_with_retry(
        state.config.http_client(),
        &cancel_token,
        url,
        Method::POST,
        body,
        headers,
        &retry_config,
    )
    .await;

    for _ in 1..outcome.attempts {
        metrics::record_retry(&sample.model);
    }

    let Some(bytes) = outcome.body_bytes else {
        if outcome.too_large {
            finalize(state, id, RequestStatus::UpstreamError, Some("upstream response too large".into()));
            return Err((StatusCode::BAD_GATEWAY, "upstream response exceeded configured size cap").into_response());
        }
        if cancel.is_cancelled() {
            let status = cancel.reason().map(CancelReason::status).unwrap_or(RequestStatus::Canceled);
            finalize(state, id, status, outcome.last_error);
            return Err((StatusCode::GATEWAY_TIMEOUT, "request canceled").into_response());
        }
        finalize(state, id, RequestStatus::UpstreamError, outcome.last_error.clone());
        return Err((
            StatusCode::BAD_GATEWAY,
            outcome.last_error.unwrap_or_else(|| "upstream request failed".into()),
        )
            .into_response());
    };

    state.watchdog.deregister(id);
    state.tracker.mark_first_byte(id);
    state.tracker.mark_progress(id, bytes.len() as u64);

    let mut tap_outcome = TapOutcome::default();
    if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
        extract_top_level_counts(&value, &mut tap_outcome);
        if let Some(prompt_eval_count) = tap_outcome.prompt_eval_count {
            state.calibration.update(&sample, Observation { prompt_eval_count });
        }
    }

    if let Some(info) = state.tracker.get(id) {
        let mut info = info;
        telemetry::apply_tap_outcome(&mut info, &tap_outcome);
        state.tracker.update_token_counts(id, tap_outcome.prompt_eval_count, tap_outcome.eval_count);
        state.tracker.finish(id, RequestStatus::Success, None);
        telemetry::record_finish(&state.store, &info, RequestStatus::Success, None);
        metrics::record_request(&info.model, "success", "none");
        metrics::observe_request_duration(&info.model, info.start.elapsed().as_secs_f64());
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

fn extract_top_level_counts(value: &Value, outcome: &mut TapOutcome) {
    if let Some(n) = value.get("prompt_eval_count").and_then(Value::as_i64) {
        outcome.prompt_eval_count = Some(n);
    }
    if let Some(n) = value.get("eval_count").and_then(Value::as_i64) {
        outcome.eval_count = Some(n);
    }
}

fn finalize(state: &AppState, id: u64, status: RequestStatus, error: Option<String>) {
    state.watchdog.deregister(id);
    if let Some(info) = state.tracker.find(id) {
        state.tracker.finish(id, status, error.clone());
        telemetry::record_finish(&state.store, &info, status, error);
        metrics::record_request(&info.model, status.as_str(), "none");
    }
}

/// `GET /healthz/upstream`: probes the upstream's own health surface and
/// mirrors the result into the `proxy_upstream_healthy` gauge.
pub async fn upstream_health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let url = format!("{}/api/version", state.config.file().upstream_base_url.trim_end_matches('/'));
    let healthy = state
        .config
        .http_client()
        .get(url)
        .timeout(Duration::from_secs(3))
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false);
    metrics::set_upstream_healthy(healthy);
    if healthy {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "upstream unreachable")
    }
}

/// Fallback route: forwards any other request verbatim to the upstream,
/// untouched by context rewriting or the tap. Covers model management
/// endpoints like `/api/tags`, `/api/show`, `/api/pull`.
pub async fn passthrough_handler(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, state.config.file().request_body_max_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, format!("failed to read request body: {}", e)).into_response();
        }
    };

    passthrough_inner(state, parts, body_bytes).await
}

async fn passthrough_inner(state: AppState, parts: axum::http::request::Parts, body_bytes: Bytes) -> Response {
    let url = format!(
        "{}{}",
        state.config.file().upstream_base_url.trim_end_matches('/'),
        parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or(parts.uri.path())
    );

    let mut req = state.config.http_client().request(parts.method.clone(), &url);
    for (name, value) in parts.headers.iter() {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        req = req.header(name, value);
    }
    if !body_bytes.is_empty() {
        req = req.body(body_bytes);
    }

    let response = match req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            error!(error = %e, "passthrough request to upstream failed");
            return (StatusCode::BAD_GATEWAY, format!("upstream unreachable: {}", e)).into_response();
        }
    };

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
    let stream = response.bytes_stream().map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    let mut builder = Response::builder().status(status);
    if let Some(ct) = content_type {
        builder = builder.header(header::CONTENT_TYPE, ct);
    }
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_policy_always_forces_proxy_value() {
        let (ctx, clamped) = apply_override_policy(OverridePolicy::Always, 4096, Some(8192));
        assert_eq!(ctx, 4096);
        assert!(!clamped);
    }

    #[test]
    fn override_policy_if_missing_respects_user_value() {
        let (ctx, clamped) = apply_override_policy(OverridePolicy::IfMissing, 4096, Some(2048));
        assert_eq!(ctx, 2048);
        assert!(!clamped);
    }

    #[test]
    fn override_policy_if_too_small_raises_to_proxy_value() {
        // Spec §8 scenario 2: overwrite to the larger proxy value is not a clamp.
        let (ctx, clamped) = apply_override_policy(OverridePolicy::IfTooSmall, 4096, Some(1024));
        assert_eq!(ctx, 4096);
        assert!(!clamped);
    }

    #[test]
    fn override_policy_if_too_small_keeps_larger_user_value() {
        let (ctx, clamped) = apply_override_policy(OverridePolicy::IfTooSmall, 4096, Some(8192));
        assert_eq!(ctx, 8192);
        assert!(!clamped);
    }

    #[test]
    fn extract_features_counts_generate_prompt_and_images() {
        let body = serde_json::json!({"prompt": "hello", "images": ["a", "b"]});
        let features = extract_features(Endpoint::Generate, &body);
        assert_eq!(features.text_bytes, 5);
        assert_eq!(features.image_count, 2);
        assert_eq!(features.message_count, 1);
    }

    #[test]
    fn extract_features_counts_chat_messages() {
        let body = serde_json::json!({"messages": [
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "there"}
        ]});
        let features = extract_features(Endpoint::Chat, &body);
        assert_eq!(features.message_count, 2);
        assert_eq!(features.text_bytes, 7);
    }

    #[test]
    fn extract_features_counts_content_part_arrays() {
        let body = serde_json::json!({"messages": [
            {"role": "user", "content": [
                {"type": "text", "text": "hi"},
                {"type": "image", "data": "..."}
            ]}
        ]});
        let features = extract_features(Endpoint::Chat, &body);
        assert_eq!(features.text_bytes, 2);
        assert_eq!(features.image_count, 1);
    }

    #[test]
    fn oversize_user_ctx_is_clamped_to_effective_max_regardless_of_policy() {
        // Mirrors the effective-max clamp applied after `apply_override_policy`
        // in `rewrite_body`: a user value above effective_max is always
        // brought down, independent of override policy.
        let effective_max = 8192u32;
        let (ctx, policy_clamped) = apply_override_policy(OverridePolicy::IfTooSmall, 4096, Some(32768));
        assert_eq!(ctx, 32768);
        assert!(!policy_clamped);
        let (final_ctx, clamped) = if ctx > effective_max { (effective_max, true) } else { (ctx, policy_clamped) };
        assert_eq!(final_ctx, 8192);
        assert!(clamped);
    }

    #[test]
    fn strip_system_prompt_removes_matched_text_from_chat_messages() {
        let pattern = Regex::new(r"\[SECRET\]").unwrap();
        let mut body = serde_json::json!({"messages": [
            {"role": "system", "content": "[SECRET] be nice"}
        ]});
        strip_system_prompt(Endpoint::Chat, &mut body, &pattern);
        assert_eq!(body["messages"][0]["content"], " be nice");
    }

    #[tokio::test]
    async fn passthrough_forwards_the_request_body_upstream() {
        use crate::calibration::{CalibrationDefaults, CalibrationStore};
        use crate::config::{Config, ConfigFile};
        use crate::events::EventBus;
        use crate::metadata_cache::MetadataCache;
        use crate::router::AppState;
        use crate::store::MemoryStore;
        use crate::tracker::Tracker;
        use crate::watchdog::{Watchdog, WatchdogConfig};
        use wiremock::matchers::{body_bytes, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .and(body_bytes(b"{\"name\":\"llama3\"}".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let mut config_file: ConfigFile = serde_json::from_str("{}").unwrap();
        config_file.upstream_base_url = server.uri();
        let config = Config::from_parsed(config_file).unwrap();

        let events = EventBus::new(100, 10);
        let tracker = Arc::new(Tracker::new(100, events.clone(), Duration::from_millis(250)));
        let state = AppState {
            config,
            tracker: tracker.clone(),
            events,
            calibration: Arc::new(CalibrationStore::new(CalibrationDefaults::default(), 0.2, None)),
            metadata_cache: Arc::new(MetadataCache::new(Duration::from_secs(300))),
            watchdog: Arc::new(Watchdog::new(WatchdogConfig::default(), tracker)),
            store: Arc::new(MemoryStore::new(500)),
            system_prompt_strip: None,
        };

        let request = Request::builder()
            .method("POST")
            .uri("/api/pull")
            .body(Body::from(&b"{\"name\":\"llama3\"}"[..]))
            .unwrap();

        let response = passthrough_handler(State(state), request).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_chat_body_is_forwarded_unrewritten_instead_of_rejected() {
        use crate::calibration::{CalibrationDefaults, CalibrationStore};
        use crate::config::{Config, ConfigFile};
        use crate::events::EventBus;
        use crate::metadata_cache::MetadataCache;
        use crate::router::AppState;
        use crate::store::MemoryStore;
        use crate::tracker::Tracker;
        use crate::watchdog::{Watchdog, WatchdogConfig};
        use wiremock::matchers::{body_bytes, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_bytes(b"not json at all".to_vec()))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let mut config_file: ConfigFile = serde_json::from_str("{}").unwrap();
        config_file.upstream_base_url = server.uri();
        let config = Config::from_parsed(config_file).unwrap();

        let events = EventBus::new(100, 10);
        let tracker = Arc::new(Tracker::new(100, events.clone(), Duration::from_millis(250)));
        let state = AppState {
            config,
            tracker: tracker.clone(),
            events,
            calibration: Arc::new(CalibrationStore::new(CalibrationDefaults::default(), 0.2, None)),
            metadata_cache: Arc::new(MetadataCache::new(Duration::from_secs(300))),
            watchdog: Arc::new(Watchdog::new(WatchdogConfig::default(), tracker)),
            store: Arc::new(MemoryStore::new(500)),
            system_prompt_strip: None,
        };

        let request = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .body(Body::from(&b"not json at all"[..]))
            .unwrap();

        let response = handle_chat(State(state), request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
