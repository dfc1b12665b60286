//! Sampling parameters and retry widening.

use serde::{Deserialize, Serialize};

/// Highest temperature a retry may reach.
pub const RETRY_TEMPERATURE_CAP: f32 = 1.5;
/// Highest max-tokens a retry may reach.
pub const RETRY_MAX_TOKENS_CAP: u32 = 200;

/// Stop sequences appended when the caller supplies none.
pub const DEFAULT_STOP: [&str; 2] = ["User:", "System:"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub stop: Vec<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            temperature: 0.7,
            top_p: 0.9,
            repetition_penalty: 1.1,
            stop: DEFAULT_STOP.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SamplingParams {
    /// Parameters for attempt `k` (0-based).
    ///
    /// Attempt 0 is unchanged. Later attempts raise temperature by 20% and
    /// max-tokens by 30% per step, capped at 1.5 and 200. The cap applies even
    /// when the caller asked for more than 200 tokens.
    pub fn widen(&self, k: u32) -> Self {
        if k == 0 {
            return self.clone();
        }
        let k = k as f64;
        let temperature =
            ((self.temperature as f64 * (1.0 + 0.2 * k)) as f32).min(RETRY_TEMPERATURE_CAP);
        let max_tokens =
            ((self.max_tokens as f64 * (1.0 + 0.3 * k)).round() as u32).min(RETRY_MAX_TOKENS_CAP);
        Self {
            temperature,
            max_tokens,
            ..self.clone()
        }
    }
}
