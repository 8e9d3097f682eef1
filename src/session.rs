//! High-level session and resource lifecycle management.
//!
//! [`SessionManager`] is the top-level orchestrator: it owns every native
//! model and context handle, enforces single-flight generation per context,
//! hands out cancellation by generation id, and guarantees destruction
//! ordering (a model is never freed while a context still references it).
//!
//! Handles given to callers are opaque ids; all native refs stay inside the
//! manager. The registry mutex is held only for short bookkeeping sections,
//! never across a slow engine call, so model loads and unrelated generation
//! runs proceed in parallel.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::engine::{InferenceEngine, LoadParams, ModelInfo, RawContext, RawModel};
use crate::error::{BusyError, ContextError, GenerationError, LoadError};
use crate::pipeline::{GenerationRequest, PipelineRun, RunOutcome};
use crate::sampling::SamplingConfig;
use crate::stream::{GenerationId, TokenStream};
use crate::tokenizer::TokenizerAdapter;

/// Magic bytes opening a GGUF model file, checked before committing to a
/// slow engine load.
const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Handle to a loaded model. Opaque; valid until `unload_model`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelHandle(Uuid);

impl fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle to an inference context. Opaque; valid until `release_context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(Uuid);

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Session manager configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManagerConfig {
    /// When set, loading a path that is already loaded returns the existing
    /// handle instead of a second independent copy of the weights.
    #[serde(default)]
    pub cache_by_path: bool,
}

struct ModelEntry {
    raw: RawModel,
    info: ModelInfo,
    /// Canonicalized path, used for identity caching.
    path: PathBuf,
    live_contexts: usize,
}

struct ContextEntry {
    raw: RawContext,
    model: ModelHandle,
    window_size: usize,
    /// Tokens consumed so far; shared with the in-flight worker.
    position: Arc<AtomicUsize>,
    sampling: SamplingConfig,
    /// Single-flight slot: the id of the run currently driving this context.
    active: Option<GenerationId>,
    /// Set after a forward-pass failure; the context must be released.
    poisoned: bool,
}

struct RunEntry {
    context: ContextHandle,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Registry {
    models: HashMap<ModelHandle, ModelEntry>,
    contexts: HashMap<ContextHandle, ContextEntry>,
    runs: HashMap<GenerationId, RunEntry>,
}

/// Owns all model/context handles and the public lifecycle API.
pub struct SessionManager {
    engine: Arc<dyn InferenceEngine>,
    config: ManagerConfig,
    registry: Mutex<Registry>,
}

impl SessionManager {
    /// Create a manager over a native engine with default configuration.
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Arc<Self> {
        Self::with_config(engine, ManagerConfig::default())
    }

    pub fn with_config(engine: Arc<dyn InferenceEngine>, config: ManagerConfig) -> Arc<Self> {
        Arc::new(SessionManager {
            engine,
            config,
            registry: Mutex::new(Registry::default()),
        })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("registry mutex poisoned")
    }

    /// Load a model from disk.
    ///
    /// Validates file existence and the format header before the slow engine
    /// load. Loads of different models run concurrently; loading the same
    /// path twice yields two independent handles unless
    /// [`ManagerConfig::cache_by_path`] is set.
    pub fn load_model(
        &self,
        path: impl AsRef<Path>,
        params: &LoadParams,
    ) -> Result<ModelHandle, LoadError> {
        let path = path.as_ref();
        preflight(path)?;
        let canonical = path.canonicalize().map_err(|_| LoadError::FileNotFound {
            path: path.to_path_buf(),
        })?;

        if self.config.cache_by_path {
            if let Some(handle) = self.find_by_path(&canonical) {
                debug!(model = %handle, path = %canonical.display(), "load served from cache");
                return Ok(handle);
            }
        }

        // Slow part, no lock held.
        let raw = self.engine.load_model(&canonical, params)?;
        let info = self.engine.model_info(raw)?;

        let mut registry = self.registry();
        if self.config.cache_by_path {
            // Another load of the same path may have won the race.
            if let Some((&handle, _)) = registry
                .models
                .iter()
                .find(|(_, entry)| entry.path == canonical)
            {
                drop(registry);
                self.engine.free_model(raw);
                return Ok(handle);
            }
        }
        let handle = ModelHandle(Uuid::new_v4());
        registry.models.insert(
            handle,
            ModelEntry {
                raw,
                info: info.clone(),
                path: canonical.clone(),
                live_contexts: 0,
            },
        );
        drop(registry);
        info!(
            model = %handle,
            path = %canonical.display(),
            vocab_size = info.vocab_size,
            max_context_len = info.max_context_len,
            quantization = %info.quantization,
            "model loaded"
        );
        Ok(handle)
    }

    fn find_by_path(&self, canonical: &Path) -> Option<ModelHandle> {
        self.registry()
            .models
            .iter()
            .find(|(_, entry)| entry.path == canonical)
            .map(|(&handle, _)| handle)
    }

    /// Attributes of a loaded model.
    pub fn model_info(&self, model: ModelHandle) -> Result<ModelInfo, LoadError> {
        self.registry()
            .models
            .get(&model)
            .map(|entry| entry.info.clone())
            .ok_or(LoadError::UnknownModel)
    }

    /// Encode/decode adapter over the model's vocabulary.
    pub fn tokenizer(&self, model: ModelHandle) -> Result<TokenizerAdapter, LoadError> {
        let registry = self.registry();
        let entry = registry.models.get(&model).ok_or(LoadError::UnknownModel)?;
        Ok(TokenizerAdapter::new(
            self.engine.clone(),
            entry.raw,
            entry.info.clone(),
        ))
    }

    /// Create an inference context bound to a model.
    ///
    /// Fails on an unknown handle, a window size of zero or beyond the
    /// model's hard limit, or engine memory reservation failure. Leaves no
    /// partial state on any failure path.
    pub fn create_context(
        &self,
        model: ModelHandle,
        window_size: usize,
        sampling: SamplingConfig,
    ) -> Result<ContextHandle, ContextError> {
        let (raw_model, max_context_len) = {
            let registry = self.registry();
            let entry = registry.models.get(&model).ok_or(ContextError::UnknownModel)?;
            (entry.raw, entry.info.max_context_len)
        };
        if window_size == 0 || window_size > max_context_len {
            return Err(ContextError::InvalidWindowSize {
                requested: window_size,
                max: max_context_len,
            });
        }

        // KV cache reservation may block; no lock held.
        let raw = self.engine.new_context(raw_model, window_size)?;

        let mut registry = self.registry();
        let Some(entry) = registry.models.get_mut(&model) else {
            // The model was unloaded while we reserved; undo.
            drop(registry);
            self.engine.free_context(raw);
            return Err(ContextError::UnknownModel);
        };
        entry.live_contexts += 1;
        let handle = ContextHandle(Uuid::new_v4());
        registry.contexts.insert(
            handle,
            ContextEntry {
                raw,
                model,
                window_size,
                position: Arc::new(AtomicUsize::new(0)),
                sampling,
                active: None,
                poisoned: false,
            },
        );
        drop(registry);
        info!(context = %handle, model = %model, window_size, "context created");
        Ok(handle)
    }

    /// Start a generation run on a context.
    ///
    /// Fails immediately (never queues) with [`GenerationError::ContextBusy`]
    /// if the context already has a run in flight. On success the run owns
    /// the context's mutable state until its terminal event; the returned
    /// stream delivers the run's ordered [`crate::stream::TokenEvent`]s.
    pub fn generate(
        self: &Arc<Self>,
        context: ContextHandle,
        request: GenerationRequest,
    ) -> Result<TokenStream, GenerationError> {
        let id = GenerationId::new();
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = crossbeam_channel::bounded(1);

        let run = {
            let mut registry = self.registry();
            let Registry {
                models, contexts, runs,
            } = &mut *registry;
            let entry = contexts
                .get_mut(&context)
                .ok_or(GenerationError::UnknownContext)?;
            if entry.poisoned {
                return Err(GenerationError::ContextPoisoned);
            }
            if entry.active.is_some() {
                return Err(GenerationError::ContextBusy);
            }
            let model = models
                .get(&entry.model)
                .ok_or(GenerationError::UnknownContext)?;

            entry.active = Some(id);
            runs.insert(
                id,
                RunEntry {
                    context,
                    cancel: cancel.clone(),
                },
            );

            PipelineRun {
                engine: self.engine.clone(),
                ctx: entry.raw,
                window_size: entry.window_size,
                position: entry.position.clone(),
                eos_token: model.info.eos_token,
                tokenizer: TokenizerAdapter::new(
                    self.engine.clone(),
                    model.raw,
                    model.info.clone(),
                ),
                sampling: request.sampling.clone().unwrap_or_else(|| entry.sampling.clone()),
                request,
                cancel: cancel.clone(),
                events: events_tx,
            }
        };

        debug!(generation = %id, context = %context, "generation started");
        let manager = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("generation-{id}"))
            .spawn(move || {
                let outcome = run.run();
                manager.finish_run(id, outcome);
            });
        if let Err(e) = spawned {
            // No worker ever ran; undo the registration so the context does
            // not stay busy forever.
            self.abort_run(id, context);
            warn!(generation = %id, error = %e, "worker thread spawn failed");
            return Err(GenerationError::WorkerSpawn(e.to_string()));
        }

        Ok(TokenStream::new(id, events_rx, cancel))
    }

    /// Undo a run registration whose worker never started.
    fn abort_run(&self, id: GenerationId, context: ContextHandle) {
        let mut registry = self.registry();
        registry.runs.remove(&id);
        if let Some(entry) = registry.contexts.get_mut(&context) {
            if entry.active == Some(id) {
                entry.active = None;
            }
        }
    }

    /// Worker epilogue: free the single-flight slot and record poisoning.
    fn finish_run(&self, id: GenerationId, outcome: RunOutcome) {
        let mut registry = self.registry();
        if let Some(run) = registry.runs.remove(&id) {
            if let Some(entry) = registry.contexts.get_mut(&run.context) {
                if entry.active == Some(id) {
                    entry.active = None;
                }
                if matches!(outcome, RunOutcome::Failed { poisoned: true }) {
                    entry.poisoned = true;
                    warn!(context = %run.context, "context marked unusable after forward-pass failure");
                }
            }
        }
        debug!(generation = %id, ?outcome, "generation finished");
    }

    /// Request cancellation of a run. Idempotent; a no-op if the run already
    /// completed or never existed.
    pub fn cancel(&self, id: GenerationId) {
        if let Some(run) = self.registry().runs.get(&id) {
            debug!(generation = %id, "cancellation requested");
            run.cancel.cancel();
        }
    }

    /// Release a context and free its KV cache.
    ///
    /// Fails with [`BusyError::ContextBusy`] while a run is in flight, never
    /// silently detaches. Releasing an already-released handle is a no-op.
    pub fn release_context(&self, context: ContextHandle) -> Result<(), BusyError> {
        let entry = {
            let mut registry = self.registry();
            match registry.contexts.get(&context) {
                None => return Ok(()),
                Some(entry) if entry.active.is_some() => return Err(BusyError::ContextBusy),
                Some(_) => {}
            }
            let Some(entry) = registry.contexts.remove(&context) else {
                return Ok(());
            };
            if let Some(model) = registry.models.get_mut(&entry.model) {
                model.live_contexts = model.live_contexts.saturating_sub(1);
            }
            entry
        };
        self.engine.free_context(entry.raw);
        info!(context = %context, "context released");
        Ok(())
    }

    /// Unload a model and free its weights.
    ///
    /// Fails with [`BusyError::ModelInUse`] while any context still
    /// references it. Unloading an already-unloaded handle is a no-op.
    pub fn unload_model(&self, model: ModelHandle) -> Result<(), BusyError> {
        let entry = {
            let mut registry = self.registry();
            match registry.models.get(&model) {
                None => return Ok(()),
                Some(entry) if entry.live_contexts > 0 => {
                    return Err(BusyError::ModelInUse {
                        live_contexts: entry.live_contexts,
                    })
                }
                Some(_) => {}
            }
            let Some(entry) = registry.models.remove(&model) else {
                return Ok(());
            };
            entry
        };
        self.engine.free_model(entry.raw);
        info!(model = %model, "model unloaded");
        Ok(())
    }

    /// Number of runs currently in flight across all contexts.
    pub fn active_generations(&self) -> usize {
        self.registry().runs.len()
    }

    /// Number of loaded models.
    pub fn loaded_models(&self) -> usize {
        self.registry().models.len()
    }

    /// Number of live contexts bound to a model. 0 for unknown handles.
    pub fn live_contexts(&self, model: ModelHandle) -> usize {
        self.registry()
            .models
            .get(&model)
            .map(|entry| entry.live_contexts)
            .unwrap_or(0)
    }

    /// Tokens consumed by a context so far. `None` for unknown handles.
    pub fn context_position(&self, context: ContextHandle) -> Option<usize> {
        self.registry()
            .contexts
            .get(&context)
            .map(|entry| entry.position.load(Ordering::Acquire))
    }
}

impl Drop for SessionManager {
    /// Teardown frees contexts before models. Workers hold an `Arc` to the
    /// manager, so no run can still be in flight here.
    fn drop(&mut self) {
        let Ok(mut registry) = self.registry.lock() else {
            return;
        };
        for run in registry.runs.values() {
            run.cancel.cancel();
        }
        for (_, entry) in registry.contexts.drain() {
            self.engine.free_context(entry.raw);
        }
        for (_, entry) in registry.models.drain() {
            self.engine.free_model(entry.raw);
        }
    }
}

/// Cheap validation before committing to a slow load: the file must exist
/// and open with the expected format header.
fn preflight(path: &Path) -> Result<(), LoadError> {
    if !path.is_file() {
        return Err(LoadError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let mut file = File::open(path).map_err(|e| LoadError::InvalidFormat {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .map_err(|_| LoadError::InvalidFormat {
            path: path.to_path_buf(),
            detail: "file shorter than the format header".into(),
        })?;
    if magic != GGUF_MAGIC {
        return Err(LoadError::InvalidFormat {
            path: path.to_path_buf(),
            detail: format!("bad magic {magic:02x?}, expected GGUF"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TokenId;
    use crate::error::{EngineError, TokenizerError};

    /// Minimal engine: everything succeeds, forward always favours token 0
    /// (EOS) so a greedy run completes immediately.
    struct StubEngine;

    impl InferenceEngine for StubEngine {
        fn load_model(&self, _path: &Path, _params: &LoadParams) -> Result<RawModel, LoadError> {
            Ok(RawModel(1))
        }

        fn model_info(&self, _model: RawModel) -> Result<ModelInfo, LoadError> {
            Ok(ModelInfo {
                vocab_size: 8,
                embedding_dim: 4,
                max_context_len: 64,
                quantization: "F16".into(),
                eos_token: 0,
                unknown_token: 1,
            })
        }

        fn new_context(
            &self,
            _model: RawModel,
            _window_size: usize,
        ) -> Result<RawContext, ContextError> {
            Ok(RawContext(2))
        }

        fn forward(&self, _ctx: RawContext, _tokens: &[TokenId]) -> Result<Vec<f32>, EngineError> {
            let mut logits = vec![0.0; 8];
            logits[0] = 1.0;
            Ok(logits)
        }

        fn encode(&self, _model: RawModel, text: &str) -> Result<Vec<TokenId>, TokenizerError> {
            Ok(text.bytes().map(|b| (b % 6) as TokenId + 2).collect())
        }

        fn token_bytes(&self, _model: RawModel, _token: TokenId) -> Result<Vec<u8>, TokenizerError> {
            Ok(b"x".to_vec())
        }

        fn free_context(&self, _ctx: RawContext) {}

        fn free_model(&self, _model: RawModel) {}
    }

    fn stub_manager() -> (Arc<SessionManager>, ContextHandle, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub.gguf");
        std::fs::write(&path, b"GGUF\0\0\0\0").unwrap();
        let mgr = SessionManager::new(Arc::new(StubEngine));
        let model = mgr.load_model(&path, &LoadParams::default()).unwrap();
        let ctx = mgr
            .create_context(model, 32, SamplingConfig::greedy())
            .unwrap();
        (mgr, ctx, dir)
    }

    #[test]
    fn abort_run_rolls_back_registration() {
        let (mgr, ctx, _dir) = stub_manager();
        let id = GenerationId::new();
        {
            let mut registry = mgr.registry();
            registry.contexts.get_mut(&ctx).unwrap().active = Some(id);
            registry.runs.insert(
                id,
                RunEntry {
                    context: ctx,
                    cancel: CancellationToken::new(),
                },
            );
        }
        assert_eq!(mgr.active_generations(), 1);

        mgr.abort_run(id, ctx);
        assert_eq!(mgr.active_generations(), 0);

        // The single-flight slot is genuinely free again.
        let stream = mgr.generate(ctx, GenerationRequest::new("hi")).unwrap();
        let events: Vec<_> = stream.collect();
        assert!(events.last().unwrap().is_terminal());
    }

    #[test]
    fn abort_run_ignores_a_mismatched_active_id() {
        let (mgr, ctx, _dir) = stub_manager();
        let current = GenerationId::new();
        let stale = GenerationId::new();
        {
            let mut registry = mgr.registry();
            registry.contexts.get_mut(&ctx).unwrap().active = Some(current);
        }

        mgr.abort_run(stale, ctx);
        let registry = mgr.registry();
        assert_eq!(registry.contexts.get(&ctx).unwrap().active, Some(current));
    }
}
