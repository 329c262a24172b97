//! Prometheus metrics registry and `/metrics` handler.
//!
//! Mirrors the teacher's `lazy_static!` block of `register_*_vec!` macros;
//! only the metric names and label sets change to fit this proxy's domain.

use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "proxy_requests_total",
        "Total number of proxied requests",
        &["model", "status", "reason"]
    )
    .unwrap();

    static ref RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "proxy_retries_total",
        "Total number of retry attempts issued",
        &["model"]
    )
    .unwrap();

    static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "proxy_request_duration_seconds",
        "End-to-end request duration in seconds",
        &["model"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .unwrap();

    static ref TTFB: HistogramVec = register_histogram_vec!(
        "proxy_ttfb_seconds",
        "Time to first upstream byte in seconds",
        &["model"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    static ref REQUESTS_IN_FLIGHT: Gauge = register_gauge!(
        "proxy_requests_in_flight",
        "Current number of in-flight proxied requests"
    )
    .unwrap();

    static ref UPSTREAM_HEALTHY: Gauge = register_gauge!(
        "proxy_upstream_healthy",
        "1 if the upstream health check last succeeded, 0 otherwise"
    )
    .unwrap();

    static ref CONTEXT_BUCKET_CHOSEN: CounterVec = register_counter_vec!(
        "proxy_context_bucket_chosen_total",
        "Count of rewritten requests per chosen context bucket",
        &["model", "bucket"]
    )
    .unwrap();

    static ref LOOP_DETECTIONS_TOTAL: CounterVec = register_counter_vec!(
        "proxy_loop_detections_total",
        "Total number of loop-detector cancellations",
        &["model"]
    )
    .unwrap();

    static ref CALIBRATION_SAMPLES: GaugeVec = register_gauge_vec!(
        "proxy_calibration_samples",
        "Number of calibration samples observed per model",
        &["model"]
    )
    .unwrap();
}

pub fn record_request(model: &str, status: &str, reason: &str) {
    REQUESTS_TOTAL.with_label_values(&[model, status, reason]).inc();
}

pub fn record_retry(model: &str) {
    RETRIES_TOTAL.with_label_values(&[model]).inc();
}

pub fn observe_request_duration(model: &str, seconds: f64) {
    REQUEST_DURATION.with_label_values(&[model]).observe(seconds);
}

pub fn observe_ttfb(model: &str, seconds: f64) {
    TTFB.with_label_values(&[model]).observe(seconds);
}

pub fn increment_in_flight(delta: f64) {
    REQUESTS_IN_FLIGHT.add(delta);
}

pub fn set_upstream_healthy(healthy: bool) {
    UPSTREAM_HEALTHY.set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_context_bucket(model: &str, bucket: u32) {
    CONTEXT_BUCKET_CHOSEN
        .with_label_values(&[model, &bucket.to_string()])
        .inc();
}

pub fn record_loop_detection(model: &str) {
    LOOP_DETECTIONS_TOTAL.with_label_values(&[model]).inc();
}

pub fn set_calibration_samples(model: &str, samples: f64) {
    CALIBRATION_SAMPLES.with_label_values(&[model]).set(samples);
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "failed to encode prometheus metrics");
    }
    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_metrics_does_not_panic() {
        record_request("m1", "success", "none");
        record_retry("m1");
        observe_request_duration("m1", 1.5);
        observe_ttfb("m1", 0.2);
        increment_in_flight(1.0);
        increment_in_flight(-1.0);
        set_upstream_healthy(true);
        record_context_bucket("m1", 4096);
        record_loop_detection("m1");
        set_calibration_samples("m1", 3.0);
    }
}
