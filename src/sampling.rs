//! Token sampling for the decode loop.
//!
//! After a forward pass produces logits (raw unnormalized scores over the
//! vocabulary), the sampler selects the next token. Order of operations per
//! draw: repeat penalty over the committed-token history, temperature
//! scaling, top-k truncation, softmax, top-p (nucleus) truncation, then a
//! draw from the remaining distribution. Ties are broken by the RNG draw,
//! never by token-id order.
//!
//! Sampling is deterministic for a fixed seed, which makes generation runs
//! replayable in tests.

use serde::Deserialize;

use crate::engine::TokenId;
use crate::error::SamplingError;

/// Temperatures below this are treated as greedy (argmax).
const GREEDY_TEMPERATURE: f32 = 1e-3;

/// Sampling configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SamplingConfig {
    /// Temperature for softmax scaling.
    /// - 0.0: greedy (argmax)
    /// - 0.1-0.5: focused / factual
    /// - 0.7-1.0: balanced
    /// - 1.0+: creative / diverse
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Top-K: restrict to the K most likely tokens. 0 = disabled.
    #[serde(default)]
    pub top_k: usize,

    /// Top-P (nucleus): restrict to the smallest set whose cumulative
    /// probability reaches P. 1.0 = disabled.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Repeat penalty (1.0 = none). Values > 1.0 discourage tokens already
    /// committed to the context.
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    /// RNG seed for reproducible draws.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_repeat_penalty() -> f32 {
    1.0
}
fn default_seed() -> u64 {
    42
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            temperature: default_temperature(),
            top_k: 0,
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            seed: default_seed(),
        }
    }
}

impl SamplingConfig {
    /// Greedy sampling (temperature = 0, no truncation).
    pub fn greedy() -> Self {
        SamplingConfig {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            repeat_penalty: 1.0,
            seed: default_seed(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Deterministic xorshift64 RNG for reproducible sampling.
#[derive(Debug, Clone)]
struct SeededRng {
    state: u64,
}

impl SeededRng {
    fn new(seed: u64) -> Self {
        // Zero state would produce all zeros.
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Next random float in [0, 1).
    fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// One run's sampling state: configuration plus RNG, advanced on every draw.
#[derive(Debug, Clone)]
pub struct Sampler {
    config: SamplingConfig,
    rng: SeededRng,
}

impl Sampler {
    pub fn new(config: &SamplingConfig) -> Self {
        Sampler {
            config: config.clone(),
            rng: SeededRng::new(config.seed),
        }
    }

    /// Draw the next token from `logits`, penalizing tokens in `history`.
    ///
    /// Fails on empty/non-finite logits, negative temperature, or a
    /// degenerate distribution where no token survives filtering.
    pub fn sample(&mut self, logits: &[f32], history: &[TokenId]) -> Result<TokenId, SamplingError> {
        if logits.is_empty() || !logits.iter().any(|l| l.is_finite()) {
            return Err(SamplingError::InvalidLogits);
        }
        if self.config.temperature < 0.0 {
            return Err(SamplingError::InvalidTemperature);
        }

        let mut work = logits.to_vec();
        // NaNs never survive into the distribution.
        for logit in &mut work {
            if logit.is_nan() {
                *logit = f32::NEG_INFINITY;
            }
        }

        // Repeat penalty: divide positive logits, multiply negative ones, so
        // repeated tokens always get less likely regardless of sign.
        let penalty = self.config.repeat_penalty;
        if penalty != 1.0 {
            for &token in history {
                let idx = token as usize;
                if let Some(logit) = work.get_mut(idx) {
                    if *logit > 0.0 {
                        *logit /= penalty;
                    } else {
                        *logit *= penalty;
                    }
                }
            }
        }

        if self.config.temperature < GREEDY_TEMPERATURE {
            return Ok(argmax(&work) as TokenId);
        }

        for logit in &mut work {
            *logit /= self.config.temperature;
        }

        if self.config.top_k > 0 {
            apply_top_k(&mut work, self.config.top_k);
        }

        let probs = softmax(&work)?;
        let probs = if self.config.top_p < 1.0 {
            apply_top_p(&probs, self.config.top_p)
        } else {
            probs
        };

        self.draw(&probs)
    }

    fn draw(&mut self, probs: &[f32]) -> Result<TokenId, SamplingError> {
        let r = self.rng.next_f32();
        let mut cumsum = 0.0;
        for (i, &prob) in probs.iter().enumerate() {
            cumsum += prob;
            if r < cumsum {
                return Ok(i as TokenId);
            }
        }
        // Rounding left the cumulative sum just under r: take the last token
        // with nonzero probability.
        for (i, &prob) in probs.iter().enumerate().rev() {
            if prob > 0.0 {
                return Ok(i as TokenId);
            }
        }
        Err(SamplingError::NoValidTokens)
    }
}

fn argmax(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

/// Mask everything below the k-th largest logit.
fn apply_top_k(logits: &mut [f32], k: usize) {
    if k >= logits.len() {
        return;
    }
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k - 1];
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

fn softmax(logits: &[f32]) -> Result<Vec<f32>, SamplingError> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !max_logit.is_finite() {
        // Everything was masked out.
        return Err(SamplingError::NoValidTokens);
    }
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return Err(SamplingError::NoValidTokens);
    }
    Ok(exps.iter().map(|&e| e / sum).collect())
}

/// Keep the smallest prefix (by descending probability) whose cumulative
/// probability reaches `p`; zero the rest and renormalize.
fn apply_top_p(probs: &[f32], p: f32) -> Vec<f32> {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0;
    let mut cutoff_prob = 0.0;
    for &(_, prob) in &indexed {
        cumsum += prob;
        cutoff_prob = prob;
        if cumsum >= p {
            break;
        }
    }

    let mut result = vec![0.0; probs.len()];
    for (i, &prob) in probs.iter().enumerate() {
        if prob >= cutoff_prob {
            result[i] = prob;
        }
    }
    let sum: f32 = result.iter().sum();
    if sum > 0.0 {
        for prob in &mut result {
            *prob /= sum;
        }
    }
    result
}
