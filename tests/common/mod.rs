//! Shared test fixtures: a deterministic mock engine and model-file helpers.
//!
//! `MockEngine` is a scripted, character-level stand-in for the native
//! engine. Each loaded model carries a fixed reply script; every forward
//! call returns one-hot logits selecting the next scripted token, and EOS
//! once the script is exhausted. The engine tracks live and freed refs so
//! tests can assert leak-free teardown.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use llm_bridge::engine::{InferenceEngine, LoadParams, ModelInfo, RawContext, RawModel, TokenId};
use llm_bridge::error::{ContextError, EngineError, LoadError, TokenizerError};

pub const EOS_TOKEN: TokenId = 0;
pub const UNKNOWN_TOKEN: TokenId = 1;

/// Character vocabulary; token id = index + 2.
const CHARSET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789 .,!?'\n";

fn build_vocab() -> Vec<String> {
    let mut vocab = vec!["</s>".to_string(), "\u{fffd}".to_string()];
    vocab.extend(CHARSET.chars().map(|c| c.to_string()));
    vocab
}

/// Character-level encoding matching `MockEngine`'s vocabulary.
pub fn encode_chars(text: &str) -> Vec<TokenId> {
    text.chars()
        .map(|c| {
            CHARSET
                .chars()
                .position(|v| v == c)
                .map(|i| i as TokenId + 2)
                .unwrap_or(UNKNOWN_TOKEN)
        })
        .collect()
}

struct MockModel {
    vocab: Vec<String>,
    reply: Vec<TokenId>,
}

struct MockContext {
    model: u64,
    tokens: Vec<TokenId>,
    /// Index into the reply script.
    cursor: usize,
    /// Forward calls seen by this context (prefill included).
    forwards: usize,
}

#[derive(Default)]
struct MockState {
    next_ref: u64,
    models: HashMap<u64, MockModel>,
    contexts: HashMap<u64, MockContext>,
    freed_models: usize,
    freed_contexts: usize,
}

pub struct MockEngine {
    state: Mutex<MockState>,
    reply_text: String,
    step_delay: Duration,
    /// Fail the Nth forward call on a context, counting from 1.
    fail_forward_at: Option<usize>,
    max_context_len: usize,
}

impl MockEngine {
    pub fn new(reply: &str) -> Self {
        MockEngine {
            state: Mutex::new(MockState::default()),
            reply_text: reply.to_string(),
            step_delay: Duration::ZERO,
            fail_forward_at: None,
            max_context_len: 4096,
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_forward_failure_at(mut self, nth: usize) -> Self {
        self.fail_forward_at = Some(nth);
        self
    }

    pub fn with_max_context(mut self, max_context_len: usize) -> Self {
        self.max_context_len = max_context_len;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    pub fn live_models(&self) -> usize {
        self.state().models.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.state().contexts.len()
    }

    pub fn freed_models(&self) -> usize {
        self.state().freed_models
    }

    pub fn freed_contexts(&self) -> usize {
        self.state().freed_contexts
    }

    /// Forward calls across all live contexts, prefill included.
    pub fn total_forwards(&self) -> usize {
        self.state().contexts.values().map(|c| c.forwards).sum()
    }
}

impl InferenceEngine for MockEngine {
    fn load_model(&self, _path: &Path, _params: &LoadParams) -> Result<RawModel, LoadError> {
        let mut state = self.state();
        state.next_ref += 1;
        let r = state.next_ref;
        state.models.insert(
            r,
            MockModel {
                vocab: build_vocab(),
                reply: encode_chars(&self.reply_text),
            },
        );
        Ok(RawModel(r))
    }

    fn model_info(&self, model: RawModel) -> Result<ModelInfo, LoadError> {
        let state = self.state();
        let entry = state.models.get(&model.0).ok_or(LoadError::UnknownModel)?;
        Ok(ModelInfo {
            vocab_size: entry.vocab.len(),
            embedding_dim: 64,
            max_context_len: self.max_context_len,
            quantization: "MOCK".to_string(),
            eos_token: EOS_TOKEN,
            unknown_token: UNKNOWN_TOKEN,
        })
    }

    fn new_context(
        &self,
        model: RawModel,
        _window_size: usize,
    ) -> Result<RawContext, ContextError> {
        let mut state = self.state();
        if !state.models.contains_key(&model.0) {
            return Err(ContextError::UnknownModel);
        }
        state.next_ref += 1;
        let r = state.next_ref;
        state.contexts.insert(
            r,
            MockContext {
                model: model.0,
                tokens: Vec::new(),
                cursor: 0,
                forwards: 0,
            },
        );
        Ok(RawContext(r))
    }

    fn forward(&self, ctx: RawContext, tokens: &[TokenId]) -> Result<Vec<f32>, EngineError> {
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }
        let mut state = self.state();
        let Some(context) = state.contexts.get_mut(&ctx.0) else {
            return Err(EngineError::Forward("unknown context ref".into()));
        };
        context.forwards += 1;
        if self.fail_forward_at == Some(context.forwards) {
            return Err(EngineError::Forward("injected failure".into()));
        }
        context.tokens.extend_from_slice(tokens);
        let (model_ref, cursor) = (context.model, context.cursor);
        context.cursor += 1;
        let model = state
            .models
            .get(&model_ref)
            .ok_or_else(|| EngineError::Forward("model freed under context".into()))?;
        let next = model.reply.get(cursor).copied().unwrap_or(EOS_TOKEN);
        let mut logits = vec![f32::NEG_INFINITY; model.vocab.len()];
        logits[next as usize] = 1.0;
        Ok(logits)
    }

    fn encode(&self, model: RawModel, text: &str) -> Result<Vec<TokenId>, TokenizerError> {
        let state = self.state();
        if !state.models.contains_key(&model.0) {
            return Err(TokenizerError::MalformedInput("stale model ref".into()));
        }
        Ok(encode_chars(text))
    }

    fn token_bytes(&self, model: RawModel, token: TokenId) -> Result<Vec<u8>, TokenizerError> {
        let state = self.state();
        let entry = state
            .models
            .get(&model.0)
            .ok_or(TokenizerError::InvalidToken(token))?;
        entry
            .vocab
            .get(token as usize)
            .map(|s| s.as_bytes().to_vec())
            .ok_or(TokenizerError::InvalidToken(token))
    }

    fn free_context(&self, ctx: RawContext) {
        let mut state = self.state();
        if state.contexts.remove(&ctx.0).is_some() {
            state.freed_contexts += 1;
        }
    }

    fn free_model(&self, model: RawModel) {
        let mut state = self.state();
        if state.models.remove(&model.0).is_some() {
            state.freed_models += 1;
        }
    }
}

/// Write a minimal file with a valid GGUF header into a temp dir.
pub fn write_model_file(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("tiny.gguf");
    let mut file = std::fs::File::create(&path).expect("create model file");
    file.write_all(b"GGUF").expect("write magic");
    file.write_all(&[0u8; 28]).expect("write padding");
    path
}

/// Write a file with the wrong magic.
pub fn write_bogus_model_file(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("bogus.bin");
    std::fs::write(&path, b"NOPE not a model").expect("write bogus file");
    path
}

/// Poll until `predicate` holds or `timeout` elapses; panics on timeout.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(Instant::now() < deadline, "condition not reached in {timeout:?}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
