//! Configuration: a `clap`-parsed CLI/env surface plus a `serde_json`
//! config file, wrapped in a single `Arc`-shared `Config` the way the
//! teacher wraps `ConfigFile` in `ConfigInner` alongside a shared
//! `reqwest::Client`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationDefaults;
use crate::loopdetect::LoopDetectorConfig;
use crate::retry::RetryConfig;
use crate::tap::OutputLimitAction;
use crate::watchdog::WatchdogConfig;

#[derive(Parser, Debug)]
#[command(name = "ollama-ctx-proxy")]
#[command(about = "Intercepting context-window proxy for Ollama-compatible inference servers", long_about = None)]
pub struct Cli {
    /// Path to the proxy config file.
    #[arg(short, long, env = "CTX_PROXY_CONFIG", default_value = "~/.ollama-ctx-proxy/config.json")]
    pub config: String,

    /// Server host.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port.
    #[arg(short, long, default_value = "11435")]
    pub port: u16,

    /// Upstream Ollama-compatible base URL.
    #[arg(long, env = "CTX_PROXY_UPSTREAM", default_value = "http://127.0.0.1:11434")]
    pub upstream: String,
}

/// Policy applied to a user-provided `options.num_ctx` when it differs from
/// the proxy's computed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverridePolicy {
    Always,
    IfMissing,
    IfTooSmall,
}

impl Default for OverridePolicy {
    fn default() -> Self {
        OverridePolicy::IfTooSmall
    }
}

/// A strictly ascending, non-empty set of allowed context sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketSet(pub Vec<u32>);

impl BucketSet {
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            bail!("bucket set must not be empty");
        }
        if !self.0.windows(2).all(|w| w[0] < w[1]) {
            bail!("bucket set must be strictly ascending");
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    11435
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_upstream() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_timeout_ms() -> u64 {
    120_000
}
fn default_pool_max_idle_per_host() -> usize {
    32
}
fn default_pool_idle_timeout_ms() -> u64 {
    90_000
}
fn default_buckets() -> BucketSet {
    BucketSet(vec![1024, 2048, 4096, 8192, 16384, 32768, 65536])
}
fn default_min_ctx() -> u32 {
    1024
}
fn default_max_ctx() -> u32 {
    65536
}
fn default_headroom() -> f64 {
    1.25
}
fn default_output_budget() -> u32 {
    1024
}
fn default_max_output_budget() -> u32 {
    4096
}
fn default_structured_overhead() -> u32 {
    64
}
fn default_request_body_max_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_response_tap_max_bytes() -> usize {
    1024 * 1024
}
fn default_recent_ring_capacity() -> usize {
    500
}
fn default_progress_interval_ms() -> u64 {
    250
}
fn default_event_bus_inbound() -> usize {
    100
}
fn default_event_bus_subscriber() -> usize {
    10
}
fn default_metadata_cache_ttl_secs() -> u64 {
    300
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

/// Parsed JSON configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_upstream")]
    pub upstream_base_url: String,

    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_timeout_ms")]
    pub api_timeout_ms: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout_ms")]
    pub pool_idle_timeout_ms: u64,

    #[serde(default = "default_buckets")]
    pub buckets: BucketSet,
    #[serde(default = "default_min_ctx")]
    pub min_ctx: u32,
    #[serde(default = "default_max_ctx")]
    pub max_ctx: u32,
    #[serde(default = "default_headroom")]
    pub headroom: f64,

    #[serde(default = "default_output_budget")]
    pub default_output_budget: u32,
    #[serde(default = "default_max_output_budget")]
    pub max_output_budget: u32,
    #[serde(default = "default_structured_overhead")]
    pub structured_format_overhead: u32,
    #[serde(default)]
    pub dynamic_output_budget: bool,

    #[serde(default)]
    pub override_policy: OverridePolicy,
    #[serde(default)]
    pub system_prompt_strip_pattern: Option<String>,

    #[serde(default)]
    pub calibration_defaults: CalibrationDefaultsFile,
    #[serde(default = "default_calibration_alpha")]
    pub calibration_alpha: f64,
    #[serde(default)]
    pub calibration_persist_path: Option<PathBuf>,

    #[serde(default = "default_metadata_cache_ttl_secs")]
    pub metadata_cache_ttl_secs: u64,

    #[serde(default)]
    pub loop_detector: LoopDetectorConfig,

    #[serde(default)]
    pub output_token_limit: Option<u32>,
    #[serde(default)]
    pub output_limit_action: OutputLimitAction,

    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retry_enabled: bool,

    #[serde(default = "default_request_body_max_bytes")]
    pub request_body_max_bytes: usize,
    #[serde(default = "default_response_tap_max_bytes")]
    pub response_tap_max_bytes: usize,
    #[serde(default = "default_recent_ring_capacity")]
    pub recent_ring_capacity: usize,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_event_bus_inbound")]
    pub event_bus_inbound_buffer: usize,
    #[serde(default = "default_event_bus_subscriber")]
    pub event_bus_subscriber_buffer: usize,

    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    #[serde(default)]
    pub store_capacity: Option<usize>,
}

fn default_calibration_alpha() -> f64 {
    0.20
}

/// Mirrors [`CalibrationDefaults`] for JSON (de)serialization; kept separate
/// so the runtime type in `calibration.rs` stays free of serde derives it
/// doesn't otherwise need.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationDefaultsFile {
    #[serde(default = "default_tokens_per_byte")]
    pub tokens_per_byte: f64,
    #[serde(default = "default_fixed_overhead")]
    pub fixed_overhead: u32,
    #[serde(default = "default_per_message_overhead")]
    pub per_message_overhead: u32,
}

fn default_tokens_per_byte() -> f64 {
    0.25
}
fn default_fixed_overhead() -> u32 {
    32
}
fn default_per_message_overhead() -> u32 {
    8
}

impl Default for CalibrationDefaultsFile {
    fn default() -> Self {
        Self {
            tokens_per_byte: default_tokens_per_byte(),
            fixed_overhead: default_fixed_overhead(),
            per_message_overhead: default_per_message_overhead(),
        }
    }
}

impl From<CalibrationDefaultsFile> for CalibrationDefaults {
    fn from(f: CalibrationDefaultsFile) -> Self {
        CalibrationDefaults {
            tokens_per_byte: f.tokens_per_byte,
            fixed_overhead: f.fixed_overhead,
            per_message_overhead: f.per_message_overhead,
        }
    }
}

struct ConfigInner {
    file: ConfigFile,
    http_client: reqwest::Client,
}

/// Runtime configuration shared across the router via axum state. Cheap to
/// clone: it's an `Arc` to shared inner state, exactly the teacher's
/// `Config`/`ConfigInner` split.
#[derive(Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path))?;
        let file: ConfigFile =
            serde_json::from_str(&content).context("failed to parse config JSON")?;
        Self::from_parsed(file)
    }

    /// Build from an already-parsed file, validating invariants and
    /// constructing the shared HTTP client once.
    pub fn from_parsed(file: ConfigFile) -> Result<Self> {
        file.buckets.validate()?;
        if file.min_ctx > file.max_ctx {
            bail!("min_ctx ({}) must be <= max_ctx ({})", file.min_ctx, file.max_ctx);
        }

        let mut builder = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(file.api_timeout_ms))
            .pool_max_idle_per_host(file.pool_max_idle_per_host)
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .tcp_nodelay(true);
        if file.pool_idle_timeout_ms > 0 {
            builder = builder.pool_idle_timeout(std::time::Duration::from_millis(file.pool_idle_timeout_ms));
        }
        let http_client = builder.build().context("failed to build shared http client")?;

        Ok(Config {
            inner: Arc::new(ConfigInner { file, http_client }),
        })
    }

    pub fn file(&self) -> &ConfigFile {
        &self.inner.file
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.http_client
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config").field("file", &self.inner.file).finish()
    }
}

/// Determine the `think` directive value for a rewritten request, keyed by
/// model name family. Returns `None` for families that are never rewritten
/// on this axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThinkDirective {
    Bool(bool),
    Level(&'static str),
}

pub fn think_directive_for_model(model: &str) -> Option<ThinkDirective> {
    let lower = model.to_ascii_lowercase();
    if lower.starts_with("qwen3") || lower.starts_with("deepseek") {
        Some(ThinkDirective::Bool(true))
    } else if lower.starts_with("gpt-oss") {
        Some(ThinkDirective::Level("medium"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_set_rejects_empty() {
        assert!(BucketSet(vec![]).validate().is_err());
    }

    #[test]
    fn bucket_set_rejects_non_ascending() {
        assert!(BucketSet(vec![4096, 2048]).validate().is_err());
    }

    #[test]
    fn bucket_set_accepts_ascending() {
        assert!(BucketSet(vec![1024, 2048, 4096]).validate().is_ok());
    }

    #[test]
    fn config_rejects_min_greater_than_max() {
        let mut file = default_config_file();
        file.min_ctx = 100;
        file.max_ctx = 10;
        assert!(Config::from_parsed(file).is_err());
    }

    #[test]
    fn config_builds_with_defaults() {
        let file = default_config_file();
        let config = Config::from_parsed(file).unwrap();
        assert_eq!(config.file().port, default_port());
    }

    #[test]
    fn think_directive_matches_model_families() {
        assert_eq!(think_directive_for_model("qwen3:8b"), Some(ThinkDirective::Bool(true)));
        assert_eq!(think_directive_for_model("deepseek-r1:32b"), Some(ThinkDirective::Bool(true)));
        assert_eq!(think_directive_for_model("gpt-oss:20b"), Some(ThinkDirective::Level("medium")));
        assert_eq!(think_directive_for_model("llama3:8b"), None);
    }

    fn default_config_file() -> ConfigFile {
        serde_json::from_str("{}").unwrap()
    }
}
