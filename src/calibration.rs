//! Per-model token-estimation calibration, refined by exponential moving
//! average from authoritative upstream counts.
//!
//! Structurally this mirrors the teacher's `EwmaTracker`: a
//! `parking_lot::RwLock<HashMap<...>>` keyed by name, read on the hot path
//! and written from the response tap once per completed request. Unlike the
//! EWMA tracker, each model here carries three related parameters that are
//! updated *sequentially* (byte-rate, then per-message, then fixed) so a
//! single pathological sample can't swing every parameter at once.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::estimator::PromptFeatures;

/// Learning rate for the EMA blend. Typical value 0.20: a single observation
/// can move a parameter by at most `alpha * clamp_range`.
pub const DEFAULT_ALPHA: f64 = 0.20;

const TOKENS_PER_BYTE_RANGE: (f64, f64) = (0.05, 1.0);
const PER_MESSAGE_OVERHEAD_RANGE: (u32, u32) = (0, 64);
const FIXED_OVERHEAD_RANGE: (u32, u32) = (0, 256);

/// Default parameters used when a model has never been observed.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationDefaults {
    pub tokens_per_byte: f64,
    pub fixed_overhead: u32,
    pub per_message_overhead: u32,
}

impl Default for CalibrationDefaults {
    fn default() -> Self {
        Self {
            tokens_per_byte: 0.25,
            fixed_overhead: 32,
            per_message_overhead: 8,
        }
    }
}

/// Per-model estimation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub tokens_per_byte: f64,
    pub fixed_overhead: u32,
    pub per_message_overhead: u32,
    #[serde(default)]
    pub safe_max_ctx: Option<u32>,
    #[serde(default)]
    pub updated_at: Option<u64>,
    #[serde(default)]
    pub samples: u64,
}

impl CalibrationParams {
    fn from_defaults(defaults: &CalibrationDefaults) -> Self {
        Self {
            tokens_per_byte: defaults.tokens_per_byte,
            fixed_overhead: defaults.fixed_overhead,
            per_message_overhead: defaults.per_message_overhead,
            safe_max_ctx: None,
            updated_at: None,
            samples: 0,
        }
    }
}

/// The features the proxy knew about a request at send time, paired later
/// with an authoritative [`Observation`] for calibration.
#[derive(Debug, Clone)]
pub struct CalibrationSample {
    pub model: String,
    pub endpoint: &'static str,
    pub features: PromptFeatures,
    pub image_tokens: u32,
    pub chosen_ctx: u32,
}

impl CalibrationSample {
    pub fn text_bytes(&self) -> u64 {
        self.features.text_bytes
    }

    pub fn message_count(&self) -> u32 {
        self.features.message_count
    }
}

/// A single authoritative prompt-token count reported by the upstream.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub prompt_eval_count: i64,
}

/// Per-model calibration store, safe for concurrent reads and writes.
pub struct CalibrationStore {
    params: RwLock<HashMap<String, CalibrationParams>>,
    defaults: CalibrationDefaults,
    alpha: f64,
    persist_path: Option<PathBuf>,
}

impl CalibrationStore {
    pub fn new(defaults: CalibrationDefaults, alpha: f64, persist_path: Option<PathBuf>) -> Self {
        let mut store = Self {
            params: RwLock::new(HashMap::new()),
            defaults,
            alpha,
            persist_path,
        };
        store.load_from_disk();
        store
    }

    fn load_from_disk(&mut self) {
        let Some(path) = self.persist_path.clone() else {
            return;
        };
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, CalibrationParams>>(&content) {
                Ok(loaded) => {
                    *self.params.get_mut() = loaded;
                    debug!(path = %path.display(), "loaded calibration store from disk");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to parse calibration file"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to read calibration file"),
        }
    }

    /// Return the stored parameters for `model`, or the configured defaults
    /// (with `samples = 0`) if this model has never been observed.
    pub fn get(&self, model: &str) -> CalibrationParams {
        self.params
            .read()
            .get(model)
            .cloned()
            .unwrap_or_else(|| CalibrationParams::from_defaults(&self.defaults))
    }

    /// Refine this model's parameters from a single authoritative
    /// observation. Discards samples with a non-positive prompt-eval-count
    /// or an empty model name.
    pub fn update(&self, sample: &CalibrationSample, observation: Observation) {
        if sample.model.is_empty() || observation.prompt_eval_count <= 0 {
            return;
        }

        let mut guard = self.params.write();
        let current = guard
            .entry(sample.model.clone())
            .or_insert_with(|| CalibrationParams::from_defaults(&self.defaults));

        let authoritative = observation.prompt_eval_count as f64;
        let text_bytes = sample.text_bytes().max(1) as f64;
        let message_count = sample.message_count() as f64;

        // 1. tokens_per_byte: residual after removing overhead and image
        //    contributions, normalized by byte count.
        let residual_for_rate = authoritative
            - current.fixed_overhead as f64
            - current.per_message_overhead as f64 * message_count
            - sample.image_tokens as f64;
        let candidate_rate = (residual_for_rate / text_bytes)
            .clamp(TOKENS_PER_BYTE_RANGE.0, TOKENS_PER_BYTE_RANGE.1);
        current.tokens_per_byte =
            self.alpha * candidate_rate + (1.0 - self.alpha) * current.tokens_per_byte;

        // 2. per_message_overhead: residual after removing the (now updated)
        //    byte contribution and fixed overhead, normalized by message count.
        let byte_contribution = current.tokens_per_byte * text_bytes;
        let candidate_per_message = if message_count > 0.0 {
            ((authoritative - current.fixed_overhead as f64 - byte_contribution) / message_count)
                .clamp(
                    PER_MESSAGE_OVERHEAD_RANGE.0 as f64,
                    PER_MESSAGE_OVERHEAD_RANGE.1 as f64,
                )
        } else {
            current.per_message_overhead as f64
        };
        let blended_per_message =
            self.alpha * candidate_per_message + (1.0 - self.alpha) * current.per_message_overhead as f64;
        current.per_message_overhead = blended_per_message.round().clamp(
            PER_MESSAGE_OVERHEAD_RANGE.0 as f64,
            PER_MESSAGE_OVERHEAD_RANGE.1 as f64,
        ) as u32;

        // 3. fixed_overhead: whatever residual remains.
        let candidate_fixed = (authoritative
            - byte_contribution
            - current.per_message_overhead as f64 * message_count)
            .clamp(FIXED_OVERHEAD_RANGE.0 as f64, FIXED_OVERHEAD_RANGE.1 as f64);
        let blended_fixed =
            self.alpha * candidate_fixed + (1.0 - self.alpha) * current.fixed_overhead as f64;
        current.fixed_overhead = blended_fixed
            .round()
            .clamp(FIXED_OVERHEAD_RANGE.0 as f64, FIXED_OVERHEAD_RANGE.1 as f64)
            as u32;

        current.samples += 1;
        current.updated_at = Some(now_unix());

        debug!(
            model = %sample.model,
            tokens_per_byte = current.tokens_per_byte,
            fixed_overhead = current.fixed_overhead,
            per_message_overhead = current.per_message_overhead,
            samples = current.samples,
            "calibration updated"
        );

        drop(guard);
        self.persist();
    }

    /// Lower `safe_max_ctx` to `used_ctx` if it is currently unset or larger,
    /// recording that the upstream rejected (or OOM'd at) a larger context.
    pub fn record_oom(&self, model: &str, used_ctx: u32) {
        if model.is_empty() {
            return;
        }
        let mut guard = self.params.write();
        let current = guard
            .entry(model.to_string())
            .or_insert_with(|| CalibrationParams::from_defaults(&self.defaults));

        let should_lower = match current.safe_max_ctx {
            None => true,
            Some(existing) => used_ctx < existing,
        };
        if should_lower {
            current.safe_max_ctx = Some(used_ctx);
            warn!(model = %model, safe_max_ctx = used_ctx, "lowered safe max context after OOM");
        }
        drop(guard);
        self.persist();
    }

    fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let snapshot = self.params.read().clone();
        if let Err(e) = write_atomic(path, &snapshot) {
            warn!(path = %path.display(), error = %e, "failed to persist calibration store");
        }
    }
}

fn write_atomic(path: &Path, snapshot: &HashMap<String, CalibrationParams>) -> anyhow::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let body = serde_json::to_vec_pretty(snapshot)?;
    tmp.write_all(&body)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(model: &str, text_bytes: u64, message_count: u32) -> CalibrationSample {
        CalibrationSample {
            model: model.to_string(),
            endpoint: "chat",
            features: PromptFeatures {
                message_count,
                text_bytes,
                image_count: 0,
            },
            image_tokens: 0,
            chosen_ctx: 4096,
        }
    }

    #[test]
    fn unknown_model_returns_defaults_with_zero_samples() {
        let store = CalibrationStore::new(CalibrationDefaults::default(), DEFAULT_ALPHA, None);
        let params = store.get("unknown-model");
        assert_eq!(params.samples, 0);
        assert_eq!(params.tokens_per_byte, 0.25);
    }

    #[test]
    fn update_moves_tokens_per_byte_toward_observation_scenario_4() {
        let store = CalibrationStore::new(CalibrationDefaults::default(), DEFAULT_ALPHA, None);
        let s = sample("m1", 4000, 1);
        store.update(&s, Observation { prompt_eval_count: 1120 });

        let params = store.get("m1");
        // candidate_rate = (1120 - 32 - 8) / 4000 = 0.270
        // blended = 0.2 * 0.270 + 0.8 * 0.25 = 0.254
        assert!((params.tokens_per_byte - 0.254).abs() < 1e-6);
        assert_eq!(params.samples, 1);
    }

    #[test]
    fn update_discards_non_positive_observation() {
        let store = CalibrationStore::new(CalibrationDefaults::default(), DEFAULT_ALPHA, None);
        let s = sample("m1", 4000, 1);
        store.update(&s, Observation { prompt_eval_count: 0 });
        assert_eq!(store.get("m1").samples, 0);
    }

    #[test]
    fn update_discards_empty_model() {
        let store = CalibrationStore::new(CalibrationDefaults::default(), DEFAULT_ALPHA, None);
        let s = sample("", 4000, 1);
        store.update(&s, Observation { prompt_eval_count: 500 });
        assert_eq!(store.get("").samples, 0);
    }

    #[test]
    fn params_stay_within_clamp_ranges_under_pathological_observation() {
        let store = CalibrationStore::new(CalibrationDefaults::default(), DEFAULT_ALPHA, None);
        let s = sample("m1", 10, 1);
        // Wildly oversized observation relative to the tiny prompt.
        store.update(&s, Observation { prompt_eval_count: 1_000_000 });

        let params = store.get("m1");
        assert!(params.tokens_per_byte >= 0.05 && params.tokens_per_byte <= 1.0);
        assert!(params.per_message_overhead <= 64);
        assert!(params.fixed_overhead <= 256);
    }

    #[test]
    fn record_oom_lowers_safe_max_ctx() {
        let store = CalibrationStore::new(CalibrationDefaults::default(), DEFAULT_ALPHA, None);
        store.record_oom("m1", 8192);
        assert_eq!(store.get("m1").safe_max_ctx, Some(8192));

        // A larger value afterward should not raise it back up.
        store.record_oom("m1", 16384);
        assert_eq!(store.get("m1").safe_max_ctx, Some(8192));

        // A smaller value should lower it further.
        store.record_oom("m1", 4096);
        assert_eq!(store.get("m1").safe_max_ctx, Some(4096));
    }

    #[test]
    fn persistence_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");

        {
            let store = CalibrationStore::new(
                CalibrationDefaults::default(),
                DEFAULT_ALPHA,
                Some(path.clone()),
            );
            let s = sample("m1", 4000, 1);
            store.update(&s, Observation { prompt_eval_count: 1120 });
        }

        let reloaded = CalibrationStore::new(CalibrationDefaults::default(), DEFAULT_ALPHA, Some(path));
        let params = reloaded.get("m1");
        assert_eq!(params.samples, 1);
        assert!((params.tokens_per_byte - 0.254).abs() < 1e-6);
    }

    #[test]
    fn sequential_update_order_is_rate_then_message_then_fixed() {
        // Regression guard: the per-message and fixed candidates must be
        // computed using the *already-updated* tokens_per_byte, not the
        // pre-update value, so this test pins down observable behavior
        // rather than re-deriving the formula.
        let store = CalibrationStore::new(CalibrationDefaults::default(), DEFAULT_ALPHA, None);
        let s = sample("m1", 4000, 2);
        store.update(&s, Observation { prompt_eval_count: 2000 });
        let params = store.get("m1");
        assert!(params.tokens_per_byte > 0.0);
        assert!(params.per_message_overhead <= 64);
    }
}
