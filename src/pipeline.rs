//! The per-run generation pipeline.
//!
//! Each run is a small state machine driven on its own worker thread:
//!
//! - **Priming**: encode the prompt, check window capacity, feed the prompt
//!   through one forward pass. No output yet.
//! - **Decoding**: repeatedly sample from the current logits, detokenize,
//!   commit the token to the context, and emit a fragment. Cancellation is
//!   observed once per iteration (token granularity, never sub-token).
//! - Terminal: **Completed** (EOS, stop sequence, or budget), **Cancelled**
//!   (context keeps its committed tokens and stays reusable), or **Failed**
//!   (a forward-pass failure additionally poisons the context).
//!
//! Emission is backpressured over the stream's single-slot channel: the loop
//! does not advance to the next decode step until the consumer has accepted
//! the previous event.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{SendTimeoutError, Sender};
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::engine::{InferenceEngine, RawContext, TokenId};
use crate::error::{GenerationError, TokenizerError};
use crate::sampling::{Sampler, SamplingConfig};
use crate::stream::{GenerationStats, StopReason, TokenEvent};
use crate::tokenizer::{DecodeState, TokenizerAdapter};

/// How often a blocked emit re-checks the cancellation flag.
const SEND_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A single generation request. Transient; consumed by one run.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Prompt text, fed to the context before decoding starts.
    pub prompt: String,

    /// Maximum number of text fragments to emit. 0 produces only the
    /// terminal event.
    pub max_tokens: usize,

    /// Stop when the trailing decoded text contains one of these. The
    /// matching fragment is withheld, not emitted.
    pub stop_sequences: Vec<String>,

    /// Per-run override of the context's sampling configuration.
    pub sampling: Option<SamplingConfig>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        GenerationRequest {
            prompt: prompt.into(),
            max_tokens: 512,
            stop_sequences: Vec::new(),
            sampling: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop_sequences.push(stop.into());
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = Some(sampling);
        self
    }
}

/// How a run ended, reported back to the session manager for bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    Cancelled,
    Failed { poisoned: bool },
}

/// Everything one worker needs to drive a run. Built by the session manager
/// under its registry lock, then moved onto the worker thread.
pub(crate) struct PipelineRun {
    pub engine: Arc<dyn InferenceEngine>,
    pub ctx: RawContext,
    pub window_size: usize,
    /// Context position counter, shared with the session manager so callers
    /// can observe it between runs.
    pub position: Arc<AtomicUsize>,
    pub eos_token: TokenId,
    pub tokenizer: TokenizerAdapter,
    pub sampling: SamplingConfig,
    pub request: GenerationRequest,
    pub cancel: CancellationToken,
    pub events: Sender<TokenEvent>,
}

impl PipelineRun {
    /// Drive the run to a terminal state. Exactly one terminal event ends the
    /// stream on every path; terminal sends block until the consumer accepts
    /// them (a dropped stream disconnects the channel and releases the
    /// worker).
    pub(crate) fn run(self) -> RunOutcome {
        // --- Priming ---
        let prompt_tokens = match self.tokenizer.encode(&self.request.prompt) {
            Ok(tokens) => tokens,
            Err(e) => return self.fail(GenerationError::Tokenization(e), false),
        };
        if prompt_tokens.is_empty() {
            return self.fail(
                GenerationError::Tokenization(TokenizerError::MalformedInput(
                    "prompt produced no tokens".into(),
                )),
                false,
            );
        }
        if self.cancel.is_cancelled() {
            return self.finish_cancelled();
        }

        let start_position = self.position.load(Ordering::Acquire);
        if start_position + prompt_tokens.len() > self.window_size {
            return self.fail(
                GenerationError::ContextWindowExhausted {
                    position: start_position + prompt_tokens.len(),
                    window_size: self.window_size,
                },
                false,
            );
        }

        debug!(prompt_tokens = prompt_tokens.len(), "priming context");
        let prefill_started = Instant::now();
        let mut logits = match self.engine.forward(self.ctx, &prompt_tokens) {
            Ok(logits) => logits,
            Err(e) => return self.fail(GenerationError::ForwardPass(e), true),
        };
        self.position
            .fetch_add(prompt_tokens.len(), Ordering::AcqRel);
        let prefill_ms = prefill_started.elapsed().as_secs_f64() * 1e3;

        // --- Decoding ---
        let mut sampler = Sampler::new(&self.sampling);
        let mut committed: Vec<TokenId> = prompt_tokens.clone();
        let mut decode_state = DecodeState::new();
        let mut tail = String::new();
        let max_stop_len = self
            .request
            .stop_sequences
            .iter()
            .map(|s| s.len())
            .max()
            .unwrap_or(0);
        let mut emitted = 0usize;
        let mut generated = 0usize;
        let decode_started = Instant::now();

        let reason = loop {
            if emitted >= self.request.max_tokens {
                break StopReason::MaxTokens;
            }
            if self.cancel.is_cancelled() {
                return self.finish_cancelled();
            }

            let token = match sampler.sample(&logits, &committed) {
                Ok(token) => token,
                Err(e) => return self.fail(GenerationError::Sampling(e), false),
            };
            if token == self.eos_token {
                break StopReason::EndOfSequence;
            }

            let fragment = match self.tokenizer.decode_token(token, &mut decode_state) {
                Ok(fragment) => fragment,
                Err(e) => return self.fail(GenerationError::Tokenization(e), false),
            };

            // A fragment that completes a stop sequence is withheld: not
            // committed, not emitted.
            if let Some(ref fragment) = fragment {
                if hits_stop(&self.request.stop_sequences, &tail, fragment) {
                    break StopReason::StopSequence;
                }
            }

            let position = self.position.load(Ordering::Acquire);
            if position + 1 > self.window_size {
                return self.fail(
                    GenerationError::ContextWindowExhausted {
                        position,
                        window_size: self.window_size,
                    },
                    false,
                );
            }

            logits = match self.engine.forward(self.ctx, &[token]) {
                Ok(logits) => logits,
                Err(e) => return self.fail(GenerationError::ForwardPass(e), true),
            };
            self.position.fetch_add(1, Ordering::AcqRel);
            committed.push(token);
            generated += 1;

            if let Some(fragment) = fragment {
                if max_stop_len > 0 {
                    tail.push_str(&fragment);
                    trim_tail(&mut tail, max_stop_len.saturating_sub(1));
                }
                if let Err(outcome) = self.send_fragment(fragment) {
                    return outcome;
                }
                emitted += 1;
            }
        };

        let decode_ms = decode_started.elapsed().as_secs_f64() * 1e3;
        let stats = GenerationStats {
            prompt_tokens: prompt_tokens.len(),
            generated_tokens: generated,
            prefill_ms,
            decode_ms,
            tokens_per_second: if decode_ms > 0.0 {
                generated as f64 / (decode_ms / 1e3)
            } else {
                0.0
            },
        };
        debug!(?reason, generated, "generation completed");
        let _ = self.events.send(TokenEvent::Completed { reason, stats });
        RunOutcome::Completed
    }

    /// Backpressured emit: blocks in short slices so a cancel still lands
    /// while the consumer stalls. A disconnected stream counts as
    /// cancellation (dropping the stream cancels the token too).
    fn send_fragment(&self, fragment: String) -> Result<(), RunOutcome> {
        let mut event = TokenEvent::Fragment(fragment);
        loop {
            match self.events.send_timeout(event, SEND_POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => {
                    if self.cancel.is_cancelled() {
                        return Err(self.finish_cancelled());
                    }
                    event = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    debug!("stream dropped by consumer");
                    return Err(RunOutcome::Cancelled);
                }
            }
        }
    }

    fn finish_cancelled(&self) -> RunOutcome {
        debug!("generation cancelled");
        let _ = self.events.send(TokenEvent::Cancelled);
        RunOutcome::Cancelled
    }

    fn fail(&self, error: GenerationError, poisoned: bool) -> RunOutcome {
        if poisoned {
            warn!(%error, "forward pass failed; context poisoned");
        } else {
            debug!(%error, "generation failed");
        }
        let _ = self.events.send(TokenEvent::Failed(error));
        RunOutcome::Failed { poisoned }
    }
}

/// Whether `tail + fragment` contains any stop sequence. `tail` holds only
/// already-emitted text capped below the longest stop length, so a hit always
/// overlaps the new fragment.
fn hits_stop(stop_sequences: &[String], tail: &str, fragment: &str) -> bool {
    if stop_sequences.is_empty() {
        return false;
    }
    let mut candidate = String::with_capacity(tail.len() + fragment.len());
    candidate.push_str(tail);
    candidate.push_str(fragment);
    stop_sequences
        .iter()
        .any(|stop| !stop.is_empty() && candidate.contains(stop.as_str()))
}

/// Keep at most `keep` trailing bytes, rounded forward to a char boundary.
fn trim_tail(tail: &mut String, keep: usize) {
    if tail.len() <= keep {
        return;
    }
    let mut cut = tail.len() - keep;
    while cut < tail.len() && !tail.is_char_boundary(cut) {
        cut += 1;
    }
    tail.drain(..cut);
}
