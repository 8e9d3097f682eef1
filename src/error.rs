//! Error types for the llm-bridge crate.
//!
//! The taxonomy follows the resource lifecycle: [`LoadError`] and
//! [`ContextError`] cover acquisition and are surfaced synchronously with no
//! partial state left behind; [`GenerationError`] covers failures inside a run
//! and arrives as the terminal [`crate::stream::TokenEvent::Failed`] event;
//! [`BusyError`] covers release operations refused while a handle is still in
//! use. Cancellation is deliberately absent here — it is a terminal stream
//! state, not an error.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::TokenId;

/// Errors from loading a model or resolving a model handle.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("model file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid model format in {path}: {detail}")]
    InvalidFormat { path: PathBuf, detail: String },

    #[error("out of memory loading model: {0}")]
    OutOfMemory(String),

    #[error("unknown or unloaded model handle")]
    UnknownModel,
}

/// Errors from creating an inference context.
#[derive(Debug, Clone, Error)]
pub enum ContextError {
    #[error("unknown or unloaded model handle")]
    UnknownModel,

    #[error("invalid context window size {requested} (model supports 1..={max})")]
    InvalidWindowSize { requested: usize, max: usize },

    #[error("out of memory reserving KV cache: {0}")]
    OutOfMemory(String),
}

/// Errors from starting or running a generation.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("unknown or released context handle")]
    UnknownContext,

    /// Single-flight violation: the context already has a run in flight.
    /// Callers that need sequential turns serialize at their own layer.
    #[error("context already has a generation in flight")]
    ContextBusy,

    /// A previous forward-pass failure left the native context state
    /// untrusted. The context must be released, not retried.
    #[error("context is poisoned by an earlier forward-pass failure and must be released")]
    ContextPoisoned,

    #[error("context window exhausted at position {position} (window size {window_size})")]
    ContextWindowExhausted { position: usize, window_size: usize },

    #[error("tokenization failed: {0}")]
    Tokenization(#[from] TokenizerError),

    #[error("forward pass failed: {0}")]
    ForwardPass(#[from] EngineError),

    #[error("sampling failed: {0}")]
    Sampling(#[from] SamplingError),

    /// The OS refused a worker thread. Nothing was started; the context is
    /// left idle and usable.
    #[error("failed to spawn generation worker: {0}")]
    WorkerSpawn(String),
}

/// Errors from releasing a handle that is still referenced.
#[derive(Debug, Clone, Error)]
pub enum BusyError {
    #[error("context has a generation in flight")]
    ContextBusy,

    #[error("model is still referenced by {live_contexts} context(s)")]
    ModelInUse { live_contexts: usize },
}

/// Errors from text/token conversion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenizerError {
    #[error("invalid token id: {0}")]
    InvalidToken(TokenId),

    /// Malformed input encoding. Out-of-vocabulary text is not an error; it
    /// maps to the model's unknown-token id.
    #[error("malformed input encoding: {0}")]
    MalformedInput(String),
}

/// Errors from drawing the next token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SamplingError {
    #[error("empty or non-finite logits")]
    InvalidLogits,

    #[error("temperature must be >= 0")]
    InvalidTemperature,

    #[error("no valid tokens after filtering")]
    NoValidTokens,
}

/// Errors surfaced by a native engine implementation during decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The native forward pass failed. The context's internal state is no
    /// longer trusted after this.
    #[error("{0}")]
    Forward(String),
}
