//! Text/token conversion over a model's vocabulary.
//!
//! [`TokenizerAdapter`] is a stateless view over one loaded model: encoding is
//! a pure function of the vocabulary, and decoding carries its state in an
//! explicit [`DecodeState`] so the generation loop can stream fragments as
//! they become printable. A single token may decode to a partial UTF-8
//! sequence (multi-byte characters can span tokens); those bytes are buffered
//! until a complete unit is decodable.

use std::sync::Arc;

use crate::engine::{InferenceEngine, ModelInfo, RawModel, TokenId};
use crate::error::TokenizerError;

/// Streaming decode state: pending bytes that do not yet form complete UTF-8.
#[derive(Debug, Clone, Default)]
pub struct DecodeState {
    pending: Vec<u8>,
}

impl DecodeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any incomplete bytes are buffered.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Append raw token bytes and take the longest complete UTF-8 prefix.
    ///
    /// Returns `None` while the buffer holds only an incomplete multi-byte
    /// sequence. Bytes that can never form valid UTF-8 are a
    /// [`TokenizerError::MalformedInput`].
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<Option<String>, TokenizerError> {
        self.pending.extend_from_slice(bytes);
        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) => {
                if e.error_len().is_some() {
                    self.pending.clear();
                    return Err(TokenizerError::MalformedInput(
                        "invalid utf-8 in vocabulary bytes".into(),
                    ));
                }
                // Trailing bytes are an incomplete sequence; keep them.
                e.valid_up_to()
            }
        };
        if complete == 0 {
            return Ok(None);
        }
        let fragment = String::from_utf8_lossy(&self.pending[..complete]).into_owned();
        self.pending.drain(..complete);
        Ok(Some(fragment))
    }
}

/// Encode/decode adapter bound to one loaded model.
///
/// Valid for as long as the underlying model is loaded; using an adapter
/// after `unload_model` yields engine-side errors, never unsafety.
pub struct TokenizerAdapter {
    engine: Arc<dyn InferenceEngine>,
    model: RawModel,
    info: ModelInfo,
}

impl TokenizerAdapter {
    pub(crate) fn new(engine: Arc<dyn InferenceEngine>, model: RawModel, info: ModelInfo) -> Self {
        TokenizerAdapter {
            engine,
            model,
            info,
        }
    }

    /// Encode text into token ids. Deterministic for a given vocabulary;
    /// out-of-vocabulary text maps to [`Self::unknown_token`].
    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>, TokenizerError> {
        self.engine.encode(self.model, text)
    }

    /// Decode one token, buffering partial UTF-8 in `state`.
    ///
    /// Returns `None` when the token contributed only an incomplete multi-byte
    /// sequence; the fragment is emitted once later tokens complete it.
    pub fn decode_token(
        &self,
        token: TokenId,
        state: &mut DecodeState,
    ) -> Result<Option<String>, TokenizerError> {
        let bytes = self.engine.token_bytes(self.model, token)?;
        state.push(&bytes)
    }

    /// Decode a complete token sequence. Trailing incomplete bytes (a
    /// sequence ending mid-character) are dropped.
    pub fn decode(&self, tokens: &[TokenId]) -> Result<String, TokenizerError> {
        let mut state = DecodeState::new();
        let mut out = String::new();
        for &token in tokens {
            if let Some(fragment) = self.decode_token(token, &mut state)? {
                out.push_str(&fragment);
            }
        }
        Ok(out)
    }

    /// Vocabulary size of the bound model.
    pub fn vocab_size(&self) -> usize {
        self.info.vocab_size
    }

    /// End-of-sequence token id.
    pub fn eos_token(&self) -> TokenId {
        self.info.eos_token
    }

    /// Unknown-token id that out-of-vocabulary input maps to.
    pub fn unknown_token(&self) -> TokenId {
        self.info.unknown_token
    }
}
