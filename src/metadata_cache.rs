//! TTL-bounded cache of upstream model-introspection results.
//!
//! Shaped like the teacher's `RateLimitTracker`: a `parking_lot::RwLock`
//! over a per-key map, read and released before any network call so misses
//! never hold the lock across an `.await`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

/// Model-introspection fields the rewrite path needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelMetadata {
    pub max_context_length: Option<u32>,
    pub tokens_per_image: Option<u32>,
}

struct CacheEntry {
    metadata: ModelMetadata,
    fetched_at: Instant,
}

/// TTL cache keyed by model name. A `ttl` of zero or negative disables
/// caching entirely: every lookup is a fresh fetch.
pub struct MetadataCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl MetadataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Return a cached, still-fresh entry for `model`, if any.
    fn fresh_entry(&self, model: &str) -> Option<ModelMetadata> {
        if self.ttl.is_zero() {
            return None;
        }
        let entries = self.entries.read();
        entries.get(model).and_then(|entry| {
            if entry.fetched_at.elapsed() <= self.ttl {
                Some(entry.metadata)
            } else {
                None
            }
        })
    }

    fn store(&self, model: &str, metadata: ModelMetadata) {
        let mut entries = self.entries.write();
        entries.insert(
            model.to_string(),
            CacheEntry {
                metadata,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Fetch metadata for `model`, using the shared `reqwest::Client` to hit
    /// upstream `POST /api/show` on a cache miss. Concurrent misses for the
    /// same model may each issue a call; this is an acceptable trade-off per
    /// spec (single-flight would require a more elaborate per-key lock).
    pub async fn get(
        &self,
        client: &reqwest::Client,
        upstream_base: &str,
        model: &str,
        timeout: Duration,
    ) -> ModelMetadata {
        if let Some(cached) = self.fresh_entry(model) {
            return cached;
        }

        match fetch_model_info(client, upstream_base, model, timeout).await {
            Ok(metadata) => {
                self.store(model, metadata);
                metadata
            }
            Err(e) => {
                debug!(model = %model, error = %e, "model metadata fetch failed, proceeding without it");
                ModelMetadata::default()
            }
        }
    }
}

async fn fetch_model_info(
    client: &reqwest::Client,
    upstream_base: &str,
    model: &str,
    timeout: Duration,
) -> anyhow::Result<ModelMetadata> {
    let url = format!("{}/api/show", upstream_base.trim_end_matches('/'));
    let resp = client
        .post(url)
        .json(&serde_json::json!({ "model": model }))
        .timeout(timeout)
        .send()
        .await?
        .error_for_status()?;
    let body: Value = resp.json().await?;
    Ok(extract_model_metadata(&body))
}

/// Walk `model_info` looking for a key ending in `context_length` and a key
/// containing `tokens_per_image`, the way the upstream's `/api/show`
/// introspection response is shaped (keys are namespaced per architecture,
/// e.g. `llama.context_length`, `qwen2.context_length`).
pub fn extract_model_metadata(body: &Value) -> ModelMetadata {
    let mut metadata = ModelMetadata::default();
    let Some(model_info) = body.get("model_info").and_then(Value::as_object) else {
        return metadata;
    };

    for (key, value) in model_info {
        if metadata.max_context_length.is_none() && key.ends_with("context_length") {
            metadata.max_context_length = value.as_u64().map(|v| v as u32);
        }
        if metadata.tokens_per_image.is_none() && key.contains("tokens_per_image") {
            metadata.tokens_per_image = value.as_u64().map(|v| v as u32);
        }
    }

    metadata
}
