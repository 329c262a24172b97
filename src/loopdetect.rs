//! Per-request rolling n-gram repetition detector.
//!
//! Cheap enough per-request that, unlike the shared trackers/caches, a plain
//! `parking_lot::Mutex` over the whole state is the right shape — no
//! read/write split needed.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoopDetectorConfig {
    pub window_bytes: usize,
    pub ngram_bytes: usize,
    pub repeat_threshold: u32,
    pub min_output_bytes: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            window_bytes: 4096,
            ngram_bytes: 64,
            repeat_threshold: 3,
            min_output_bytes: 1024,
        }
    }
}

impl LoopDetectorConfig {
    /// Enforce `{256, 8, 2, 256}` minimums, and clamp `ngram_bytes` to at
    /// most half the window.
    pub fn normalized(mut self) -> Self {
        self.window_bytes = self.window_bytes.max(256);
        self.ngram_bytes = self.ngram_bytes.max(8);
        self.repeat_threshold = self.repeat_threshold.max(2);
        self.min_output_bytes = self.min_output_bytes.max(256);
        self.ngram_bytes = self.ngram_bytes.min(self.window_bytes / 2).max(8);
        self
    }
}

struct State {
    buffer: VecDeque<u8>,
    counts: HashMap<Box<[u8]>, u32>,
    total_bytes: usize,
    triggered: bool,
}

pub struct LoopDetector {
    config: LoopDetectorConfig,
    state: Mutex<State>,
}

impl LoopDetector {
    pub fn new(config: LoopDetectorConfig) -> Self {
        let config = config.normalized();
        Self {
            config,
            state: Mutex::new(State {
                buffer: VecDeque::with_capacity(config.window_bytes),
                counts: HashMap::new(),
                total_bytes: 0,
                triggered: false,
            }),
        }
    }

    /// Feed newly produced output bytes. Returns `true` if this call caused
    /// (or a previous call already caused) the detector to trigger.
    pub fn feed(&self, bytes: &[u8]) -> bool {
        let mut state = self.state.lock();
        if state.triggered {
            return true;
        }

        state.total_bytes += bytes.len();
        if state.total_bytes < self.config.min_output_bytes {
            // Still buffer so n-grams are available the instant the floor is crossed.
            push_bytes(&mut state.buffer, bytes, self.config.window_bytes, &mut state.counts, self.config.ngram_bytes);
            return false;
        }

        let just_crossed = state.total_bytes - bytes.len() < self.config.min_output_bytes;
        if just_crossed {
            // Bytes below the floor were buffered without counting; count the
            // whole buffer now that the floor is crossed, then append `bytes`
            // normally below.
            recount_all(&mut state, self.config.ngram_bytes);
        }

        push_bytes(&mut state.buffer, bytes, self.config.window_bytes, &mut state.counts, self.config.ngram_bytes);

        let triggered = state
            .counts
            .values()
            .any(|&count| count >= self.config.repeat_threshold);
        if triggered {
            state.triggered = true;
        }
        triggered
    }

    pub fn is_triggered(&self) -> bool {
        self.state.lock().triggered
    }
}

/// Recompute `counts` from scratch over the current buffer contents. Used
/// once, the call at which `min_output_bytes` is first crossed, since bytes
/// appended before that point were buffered without being counted.
fn recount_all(state: &mut State, ngram_bytes: usize) {
    state.counts.clear();
    if state.buffer.len() < ngram_bytes {
        return;
    }
    let contiguous: Vec<u8> = state.buffer.iter().copied().collect();
    for window in contiguous.windows(ngram_bytes) {
        *state.counts.entry(window.into()).or_insert(0) += 1;
    }
}

/// Append `incoming` to `buffer`, updating `counts` for every new n-gram
/// (including ones spanning the old/new boundary), then evict from the
/// front until `buffer.len() <= window_bytes`, decrementing counts for every
/// n-gram that falls out of the window.
fn push_bytes(
    buffer: &mut VecDeque<u8>,
    incoming: &[u8],
    window_bytes: usize,
    counts: &mut HashMap<Box<[u8]>, u32>,
    ngram_bytes: usize,
) {
    if incoming.is_empty() {
        return;
    }

    // Materialize a tail slice covering (ngram_bytes - 1) bytes of prior
    // context plus all of `incoming`, so every new n-gram -- including ones
    // spanning the boundary -- gets counted exactly once.
    let prior_context_len = ngram_bytes.saturating_sub(1).min(buffer.len());
    let mut tail: Vec<u8> = buffer
        .iter()
        .rev()
        .take(prior_context_len)
        .copied()
        .collect();
    tail.reverse();
    tail.extend_from_slice(incoming);

    buffer.extend(incoming.iter().copied());

    if tail.len() >= ngram_bytes {
        for window in tail.windows(ngram_bytes) {
            *counts.entry(window.into()).or_insert(0) += 1;
        }
    }

    while buffer.len() > window_bytes {
        // The n-gram starting at the old front position is leaving the
        // window; it was counted when it first became fully contained.
        if buffer.len() >= ngram_bytes {
            let evicted_ngram: Vec<u8> = buffer.iter().take(ngram_bytes).copied().collect();
            if let Some(count) = counts.get_mut(evicted_ngram.as_slice()) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(evicted_ngram.as_slice());
                }
            }
        }
        buffer.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_enforces_minimums() {
        let config = LoopDetectorConfig {
            window_bytes: 10,
            ngram_bytes: 1,
            repeat_threshold: 1,
            min_output_bytes: 10,
        }
        .normalized();
        assert_eq!(config.window_bytes, 256);
        assert_eq!(config.ngram_bytes, 8);
        assert_eq!(config.repeat_threshold, 2);
        assert_eq!(config.min_output_bytes, 256);
    }

    #[test]
    fn ngram_bytes_clamped_to_half_window() {
        let config = LoopDetectorConfig {
            window_bytes: 1000,
            ngram_bytes: 900,
            repeat_threshold: 3,
            min_output_bytes: 0,
        }
        .normalized();
        assert_eq!(config.ngram_bytes, 500);
    }

    #[test]
    fn below_min_output_bytes_never_triggers() {
        let detector = LoopDetector::new(LoopDetectorConfig {
            window_bytes: 256,
            ngram_bytes: 8,
            repeat_threshold: 2,
            min_output_bytes: 10_000,
        });
        let chunk = "abababab".repeat(100);
        assert!(!detector.feed(chunk.as_bytes()));
    }

    #[test]
    fn exact_repetition_triggers() {
        let detector = LoopDetector::new(LoopDetectorConfig {
            window_bytes: 256,
            ngram_bytes: 8,
            repeat_threshold: 2,
            min_output_bytes: 0,
        });
        let phrase = "the cat sat on the mat. ";
        let mut triggered = false;
        for _ in 0..20 {
            triggered = detector.feed(phrase.as_bytes());
            if triggered {
                break;
            }
        }
        assert!(triggered);
        assert!(detector.is_triggered());
    }

    #[test]
    fn once_triggered_stays_triggered() {
        let detector = LoopDetector::new(LoopDetectorConfig {
            window_bytes: 64,
            ngram_bytes: 8,
            repeat_threshold: 2,
            min_output_bytes: 0,
        });
        let repeat = "xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx";
        detector.feed(repeat.as_bytes());
        detector.feed(repeat.as_bytes());
        assert!(detector.is_triggered());
        // Feeding unrelated, varied bytes afterwards must not un-trigger it.
        assert!(detector.feed(b"entirely different content here"));
    }

    #[test]
    fn diverse_text_does_not_trigger() {
        let detector = LoopDetector::new(LoopDetectorConfig {
            window_bytes: 4096,
            ngram_bytes: 64,
            repeat_threshold: 3,
            min_output_bytes: 0,
        });
        let text = "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam, quis nostrud exercitation ullamco laboris nisi ut aliquip ex ea commodo consequat.";
        assert!(!detector.feed(text.as_bytes()));
        assert!(!detector.is_triggered());
    }

    #[test]
    fn boundary_spanning_repetition_is_detected_across_feed_calls() {
        let detector = LoopDetector::new(LoopDetectorConfig {
            window_bytes: 256,
            ngram_bytes: 8,
            repeat_threshold: 2,
            min_output_bytes: 0,
        });
        // Split a repeated phrase across many small feed() calls so some
        // n-grams span call boundaries.
        let phrase = "repeatme";
        let mut triggered = false;
        for _ in 0..10 {
            for chunk in phrase.as_bytes().chunks(3) {
                triggered = detector.feed(chunk) || triggered;
            }
        }
        assert!(triggered);
    }

    #[test]
    fn eviction_reduces_counts_as_window_slides() {
        let detector = LoopDetector::new(LoopDetectorConfig {
            window_bytes: 16,
            ngram_bytes: 8,
            repeat_threshold: 100,
            min_output_bytes: 0,
        });
        // Threshold is unreachable, but this exercises eviction without panicking.
        for _ in 0..50 {
            assert!(!detector.feed(b"abcdefgh"));
        }
    }
}
