use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod calibration;
mod config;
mod dashboard;
mod estimator;
mod events;
mod loopdetect;
mod metadata_cache;
mod metrics;
mod proxy;
mod retry;
mod router;
mod sse;
mod store;
mod tap;
mod telemetry;
mod telemetry_api;
mod tracker;
mod watchdog;

use calibration::CalibrationStore;
use config::{Cli, Config};
use events::EventBus;
use metadata_cache::MetadataCache;
use router::AppState;
use store::MemoryStore;
use tracker::Tracker;
use watchdog::Watchdog;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ollama_ctx_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = shellexpand::tilde(&cli.config).to_string();
    let config = match Config::from_file(&config_path) {
        Ok(c) => {
            tracing::info!(path = %config_path, "loaded config file");
            c
        }
        Err(e) => {
            tracing::warn!(path = %config_path, error = %e, "no usable config file, falling back to defaults");
            Config::from_parsed(serde_json::from_str("{}")?)?
        }
    };

    let file = config.file().clone();

    let events = EventBus::new(file.event_bus_inbound_buffer, file.event_bus_subscriber_buffer);

    let tracker = Arc::new(Tracker::new(
        file.recent_ring_capacity,
        events.clone(),
        std::time::Duration::from_millis(file.progress_interval_ms),
    ));

    let calibration = Arc::new(CalibrationStore::new(
        file.calibration_defaults.into(),
        file.calibration_alpha,
        file.calibration_persist_path.clone(),
    ));

    let metadata_cache = Arc::new(MetadataCache::new(std::time::Duration::from_secs(
        file.metadata_cache_ttl_secs,
    )));

    let watchdog = Arc::new(Watchdog::new(file.watchdog.clone(), tracker.clone()));
    watchdog.clone().spawn();

    let store: Arc<dyn store::Store> = Arc::new(MemoryStore::new(file.store_capacity.unwrap_or(file.recent_ring_capacity)));

    let system_prompt_strip = match &file.system_prompt_strip_pattern {
        Some(pattern) => Some(Arc::new(
            Regex::new(pattern).with_context(|| format!("invalid system_prompt_strip_pattern: {}", pattern))?,
        )),
        None => None,
    };

    let state = AppState {
        config: config.clone(),
        tracker,
        events,
        calibration,
        metadata_cache,
        watchdog,
        store,
        system_prompt_strip,
    };

    let app = router::build_router(state);

    let addr = SocketAddr::from((cli.host.parse::<std::net::IpAddr>()?, cli.port));
    tracing::info!(%addr, upstream = %cli.upstream, "ollama-ctx-proxy listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
