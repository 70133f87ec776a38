//! Tokens-per-second tracking for a single turn.

/// Rough token count for a piece of text (about four characters per token).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() / 4) as u64
}

/// A backend-reported rate, if it is usable (finite and non-negative).
pub fn accepted_rate(tokens_per_second: f64) -> Option<f64> {
    (tokens_per_second.is_finite() && tokens_per_second >= 0.0).then_some(tokens_per_second)
}

/// Tracks the live rate of one turn and computes its final average.
///
/// A rate reported by the backend always wins over the locally computed one
/// and is kept until the next report, so an unrated token never makes an
/// active stream look stalled.
#[derive(Clone, Debug, Default)]
pub struct ThroughputEstimator {
    reported: Option<f64>,
    observed_tokens: u64,
    elapsed_ms: u64,
}

impl ThroughputEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `token_delta` new tokens, `elapsed_ms` after the turn started.
    pub fn observe(&mut self, token_delta: u64, elapsed_ms: u64) {
        self.observed_tokens = self.observed_tokens.saturating_add(token_delta);
        self.elapsed_ms = self.elapsed_ms.max(elapsed_ms);
    }

    /// Records a rate reported by the backend.
    pub fn report(&mut self, tokens_per_second: f64) {
        if let Some(rate) = accepted_rate(tokens_per_second) {
            self.reported = Some(rate);
        }
    }

    /// Latest reported rate, or the computed one if nothing was reported.
    pub fn instantaneous(&self) -> f64 {
        self.reported
            .unwrap_or_else(|| Self::average(self.observed_tokens, self.elapsed_ms))
    }

    pub fn observed_tokens(&self) -> u64 {
        self.observed_tokens
    }

    /// Exact average rate over a finished turn.
    pub fn finalize(&self, total_tokens: u64, total_elapsed_ms: u64) -> f64 {
        Self::average(total_tokens, total_elapsed_ms)
    }

    pub(crate) fn average(total_tokens: u64, total_elapsed_ms: u64) -> f64 {
        if total_elapsed_ms == 0 {
            return 0.0;
        }
        total_tokens as f64 / (total_elapsed_ms as f64 / 1000.0)
    }
}
