//! Shared application state and axum route wiring.
//!
//! `AppState` is a plain `Clone` struct handed to axum via `.with_state`,
//! the same shape as the teacher's own `AppState` in this file.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use regex::Regex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::calibration::CalibrationStore;
use crate::config::Config;
use crate::events::EventBus;
use crate::metadata_cache::MetadataCache;
use crate::metrics;
use crate::store::Store;
use crate::tracker::Tracker;
use crate::watchdog::Watchdog;
use crate::{dashboard, proxy, sse, telemetry_api};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub tracker: Arc<Tracker>,
    pub events: EventBus,
    pub calibration: Arc<CalibrationStore>,
    pub metadata_cache: Arc<MetadataCache>,
    pub watchdog: Arc<Watchdog>,
    pub store: Arc<dyn Store>,
    pub system_prompt_strip: Option<Arc<Regex>>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.file().cors_origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = state
            .config
            .file()
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    Router::new()
        .route("/api/chat", post(proxy::handle_chat))
        .route("/api/generate", post(proxy::handle_generate))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/healthz", get(health_handler))
        .route("/healthz/upstream", get(proxy::upstream_health_handler))
        .route("/dashboard", get(dashboard::dashboard_handler))
        .route("/events", get(sse::events_handler))
        .nest(
            "/v1/telemetry",
            Router::new()
                .route("/overview", get(telemetry_api::overview_handler))
                .route("/requests", get(telemetry_api::list_requests_handler))
                .route("/requests/{id}", get(telemetry_api::get_request_handler))
                .route("/models", get(telemetry_api::list_models_handler))
                .route("/models/{model}/series", get(telemetry_api::model_series_handler))
                .route("/config", get(telemetry_api::config_handler)),
        )
        .fallback(proxy::passthrough_handler)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}
