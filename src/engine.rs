//! The narrow boundary to the native inference engine.
//!
//! Everything above this trait treats the engine as opaque: models and
//! contexts are [`RawModel`]/[`RawContext`] refs (stand-ins for native
//! pointers), and the only operations are load, context creation, a forward
//! pass that returns last-position logits, vocabulary lookups, and frees.
//! The bridge never reaches past this contract into engine internals.
//!
//! # Interior Mutability
//!
//! All methods take `&self` so one engine can serve many contexts across
//! threads. Implementations are responsible for their own internal
//! synchronization; the bridge guarantees that a given [`RawContext`] is only
//! ever driven by its single in-flight generation worker.

use std::path::Path;

use serde::Deserialize;

use crate::error::{ContextError, EngineError, LoadError, TokenizerError};

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Opaque reference to a loaded model inside the native engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawModel(pub u64);

/// Opaque reference to an inference context inside the native engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawContext(pub u64);

/// Parameters for loading a model.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadParams {
    /// Threads the engine may use for the load and for forward passes.
    /// 0 = engine default.
    #[serde(default)]
    pub n_threads: usize,

    /// Memory-map weight files instead of reading them eagerly.
    #[serde(default = "default_use_mmap")]
    pub use_mmap: bool,
}

fn default_use_mmap() -> bool {
    true
}

impl Default for LoadParams {
    fn default() -> Self {
        LoadParams {
            n_threads: 0,
            use_mmap: default_use_mmap(),
        }
    }
}

/// Immutable attributes of a loaded model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    /// Number of entries in the vocabulary.
    pub vocab_size: usize,

    /// Embedding dimension.
    pub embedding_dim: usize,

    /// Hard upper bound on context window size.
    pub max_context_len: usize,

    /// Quantization format tag (e.g. "Q4_K_M", "F16").
    pub quantization: String,

    /// End-of-sequence token id.
    pub eos_token: TokenId,

    /// Token id that out-of-vocabulary input maps to.
    pub unknown_token: TokenId,
}

/// The native engine contract — everything else plugs into this.
///
/// Implementations wrap a real inference library (or a mock in tests). The
/// bridge owns destruction ordering: `free_context` is always called before
/// `free_model` for contexts bound to that model.
pub trait InferenceEngine: Send + Sync {
    /// Load model weights from disk. Slow; may allocate large buffers.
    fn load_model(&self, path: &Path, params: &LoadParams) -> Result<RawModel, LoadError>;

    /// Attributes of a loaded model.
    fn model_info(&self, model: RawModel) -> Result<ModelInfo, LoadError>;

    /// Create an inference context (KV cache + position state) bound to a
    /// model. Reserves memory for `window_size` tokens.
    fn new_context(&self, model: RawModel, window_size: usize)
        -> Result<RawContext, ContextError>;

    /// Append `tokens` to the context state and return the logits for the
    /// last position (one `f32` per vocabulary entry).
    fn forward(&self, ctx: RawContext, tokens: &[TokenId]) -> Result<Vec<f32>, EngineError>;

    /// Convert text into token ids. Out-of-vocabulary text maps to the
    /// unknown-token id; only malformed input encoding is an error.
    fn encode(&self, model: RawModel, text: &str) -> Result<Vec<TokenId>, TokenizerError>;

    /// Raw bytes for one token. May be a partial UTF-8 sequence; the caller
    /// buffers until a complete unit is decodable.
    fn token_bytes(&self, model: RawModel, token: TokenId) -> Result<Vec<u8>, TokenizerError>;

    /// Destroy a context and its KV cache.
    fn free_context(&self, ctx: RawContext);

    /// Destroy a model. All contexts bound to it are freed first.
    fn free_model(&self, model: RawModel);
}
