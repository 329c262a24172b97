//! Pure token-estimation and bucketization functions.
//!
//! Nothing in this module touches shared state: every function takes its
//! inputs by value/reference and returns a value. The Proxy Handler and the
//! Response Tap both call into these helpers, so they stay allocation-free
//! and side-effect-free to keep the hot path cheap.

use crate::calibration::CalibrationParams;

/// Structural features of a request the estimator needs, extracted once
/// during rewriting (or approximated again inside the tap for output-limit
/// enforcement).
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptFeatures {
    pub message_count: u32,
    pub text_bytes: u64,
    pub image_count: u32,
}

/// Where an output-token budget decision came from. Telemetry-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputBudgetSource {
    UserProvided,
    DefaultStatic,
    DefaultDynamic,
}

/// `fixed_overhead + per_message_overhead * message_count + tokens_per_byte *
/// text_bytes + image_count * tokens_per_image`, rounded to the nearest
/// integer.
pub fn estimate_prompt_tokens(
    features: &PromptFeatures,
    params: &CalibrationParams,
    tokens_per_image: u32,
) -> u32 {
    let base = params.fixed_overhead as f64
        + params.per_message_overhead as f64 * features.message_count as f64
        + params.tokens_per_byte * features.text_bytes as f64;
    let images = features.image_count as f64 * tokens_per_image as f64;
    (base + images).round().max(0.0) as u32
}

/// Compute the output-token budget for a request.
///
/// `user_num_predict` wins if present and within `max_budget`. Otherwise the
/// default budget is used, optionally scaled by prompt size when
/// `dynamic_flag` is set (proportional to prompt tokens, capped at
/// `max_budget`). `structured_overhead` is added whenever the request
/// specifies a structured output format.
pub fn budget_output_tokens(
    user_num_predict: Option<u32>,
    default_budget: u32,
    max_budget: u32,
    structured_overhead: u32,
    dynamic_flag: bool,
    has_structured_format: bool,
    prompt_tokens: u32,
) -> (u32, OutputBudgetSource) {
    let extra = if has_structured_format {
        structured_overhead
    } else {
        0
    };

    if let Some(n) = user_num_predict {
        if n > 0 && n <= max_budget {
            return (n.saturating_add(extra).min(max_budget.max(n)), OutputBudgetSource::UserProvided);
        }
    }

    if dynamic_flag {
        // Scale with prompt size: larger prompts tend to produce longer
        // completions in practice. Clamp to [default_budget, max_budget].
        let scaled = (prompt_tokens as f64 * 0.5).round() as u32;
        let budget = scaled.max(default_budget).min(max_budget);
        (budget.saturating_add(extra).min(max_budget), OutputBudgetSource::DefaultDynamic)
    } else {
        let budget = default_budget.min(max_budget);
        (budget.saturating_add(extra).min(max_budget), OutputBudgetSource::DefaultStatic)
    }
}

/// Multiply by `multiplier` (clamped to at least 1.0) and round up.
pub fn apply_headroom(tokens: u32, multiplier: f64) -> u32 {
    let multiplier = multiplier.max(1.0);
    (tokens as f64 * multiplier).ceil() as u32
}

/// Smallest bucket `>= tokens`; if none qualifies, the largest bucket.
///
/// `buckets` must be a non-empty, strictly ascending slice — that is a
/// config-load invariant, validated once in [`crate::config::Config::validate`],
/// not re-checked per call.
pub fn bucketize(tokens: u32, buckets: &[u32]) -> u32 {
    debug_assert!(!buckets.is_empty(), "bucket set must not be empty");
    debug_assert!(
        buckets.windows(2).all(|w| w[0] < w[1]),
        "bucket set must be strictly ascending"
    );
    buckets
        .iter()
        .copied()
        .find(|&b| b >= tokens)
        .unwrap_or(*buckets.last().unwrap())
}

/// Clamp `ctx` to `[min, max]`.
pub fn clamp_ctx(ctx: u32, min: u32, max: u32) -> u32 {
    ctx.clamp(min, max.max(min))
}
