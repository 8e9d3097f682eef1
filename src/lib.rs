//! # llm-bridge
//!
//! Embedded bridge between an interactive chat application and a native
//! on-device LLM inference engine. The bridge owns the model and context
//! handles, serializes access to them, drives the tokenize → forward-pass →
//! sample → detokenize loop, and exposes cancellable, backpressure-aware
//! token streams.
//!
//! The engine itself sits behind the [`engine::InferenceEngine`] trait:
//! implementations wrap a real native library, tests plug in mocks, and
//! nothing above the trait ever touches engine internals.
//!
//! ## Design Notes
//!
//! ### Ownership
//! Native handles are arena-managed inside [`session::SessionManager`] with
//! reference counts: a model cannot be unloaded while any context references
//! it, and releases of busy handles fail with a typed error instead of
//! silently detaching.
//!
//! ### Single-flight
//! At most one generation run may drive a given context. This is a checked
//! precondition in `generate` returning [`error::GenerationError::ContextBusy`],
//! not a queue and not a lock, so callers keep control over queuing policy.
//!
//! ### Cancellation
//! Cooperative, observed once per decode iteration against a shared
//! [`cancel::CancellationToken`]; a timeout is a cancellation scheduled by a
//! timer. A cancelled context keeps its committed tokens and stays reusable.

pub mod cancel;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod sampling;
pub mod session;
pub mod stream;
pub mod tokenizer;

pub use cancel::CancellationToken;
pub use engine::{InferenceEngine, LoadParams, ModelInfo, RawContext, RawModel, TokenId};
pub use error::{
    BusyError, ContextError, EngineError, GenerationError, LoadError, SamplingError,
    TokenizerError,
};
pub use pipeline::GenerationRequest;
pub use sampling::{Sampler, SamplingConfig};
pub use session::{ContextHandle, ManagerConfig, ModelHandle, SessionManager};
pub use stream::{GenerationId, GenerationStats, StopReason, TokenEvent, TokenStream};
pub use tokenizer::{DecodeState, TokenizerAdapter};
