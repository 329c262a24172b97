//! Read-only JSON query handlers over the telemetry [`Store`].

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::router::AppState;
use crate::store::{RequestFilter, SeriesMetric, Store};
use crate::tracker::RequestStatus;

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub window: Option<String>,
}

/// Parse a window string, accepting the literal aliases the spec names
/// (`1h`, `24h`, `7d`) in addition to anything `humantime` understands
/// (`30m`, `2h 30m`, ...).
pub fn parse_window(raw: &str) -> Option<Duration> {
    match raw {
        "1h" => Some(Duration::from_secs(3600)),
        "24h" => Some(Duration::from_secs(24 * 3600)),
        "7d" => Some(Duration::from_secs(7 * 24 * 3600)),
        other => humantime::parse_duration(other).ok(),
    }
}

fn resolve_window(query: &WindowQuery) -> Option<Duration> {
    query.window.as_deref().and_then(parse_window)
}

pub async fn overview_handler(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> impl IntoResponse {
    Json(state.store.overview(resolve_window(&query)))
}

#[derive(Debug, Deserialize)]
pub struct ListRequestsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub status: Option<String>,
    pub model: Option<String>,
    pub reason: Option<String>,
    pub window: Option<String>,
}

pub async fn list_requests_handler(
    State(state): State<AppState>,
    Query(query): Query<ListRequestsQuery>,
) -> impl IntoResponse {
    let filter = RequestFilter {
        limit: query.limit.unwrap_or(100).min(1000),
        offset: query.offset.unwrap_or(0),
        status: query.status.as_deref().and_then(RequestStatus::parse),
        model: query.model.clone(),
        reason: query.reason.clone(),
        window: query.window.as_deref().and_then(parse_window),
    };
    Json(state.store.list_requests(&filter))
}

pub async fn get_request_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    match state.store.get_request(id) {
        Some(req) => Json(req).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn list_models_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.list_models())
}

#[derive(Debug, Deserialize)]
pub struct SeriesQuery {
    pub window: Option<String>,
    pub metric: Option<String>,
}

pub async fn model_series_handler(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Query(query): Query<SeriesQuery>,
) -> impl IntoResponse {
    let window = query.window.as_deref().and_then(parse_window);
    let metric = query.metric.as_deref().and_then(SeriesMetric::parse).unwrap_or_default();
    Json(state.store.series(&model, window, metric))
}

pub async fn config_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.file().clone())
}

#[allow(dead_code)]
fn assert_store_is_object_safe(_: &dyn Store) {}
