//! Streamed generation output.
//!
//! Each generation run produces a lazy, finite, non-restartable sequence of
//! [`TokenEvent`]s over a bounded single-slot channel: the worker cannot run
//! ahead of the consumer by more than one event, so a stalled consumer never
//! causes unbounded buffering. Events for one run are strictly ordered and
//! never interleaved with another run's.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::Receiver;
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::error::GenerationError;

/// Identifier for one generation run, used to cancel it by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenerationId(Uuid);

impl GenerationId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a run completed normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model sampled its end-of-sequence token.
    EndOfSequence,
    /// A configured stop sequence matched the trailing decoded text.
    StopSequence,
    /// The maximum-tokens budget was reached.
    MaxTokens,
}

/// Timing summary for a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationStats {
    /// Tokens in the encoded prompt.
    pub prompt_tokens: usize,

    /// Tokens committed to the context during decode.
    pub generated_tokens: usize,

    /// Prompt-processing (prefill) time in milliseconds.
    pub prefill_ms: f64,

    /// Decode-loop time in milliseconds.
    pub decode_ms: f64,

    /// Decode throughput, excluding prefill.
    pub tokens_per_second: f64,
}

/// One unit of streamed output. Exactly one terminal event ends every run.
#[derive(Debug, Clone)]
pub enum TokenEvent {
    /// A decoded text fragment.
    Fragment(String),

    /// The run finished normally.
    Completed {
        reason: StopReason,
        stats: GenerationStats,
    },

    /// The run was cancelled. The context keeps its committed tokens and
    /// remains reusable.
    Cancelled,

    /// The run failed. A forward-pass failure additionally poisons the
    /// context (it must be released, not reused).
    Failed(GenerationError),
}

impl TokenEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TokenEvent::Fragment(_))
    }
}

/// Consumer end of one generation run.
///
/// A blocking iterator over [`TokenEvent`]s, fused after the terminal event.
/// Dropping the stream before the terminal event cancels the run; the worker
/// observes that at its next checkpoint and frees the single-flight slot.
#[derive(Debug)]
pub struct TokenStream {
    id: GenerationId,
    events: Receiver<TokenEvent>,
    cancel: CancellationToken,
    done: bool,
}

impl TokenStream {
    pub(crate) fn new(
        id: GenerationId,
        events: Receiver<TokenEvent>,
        cancel: CancellationToken,
    ) -> Self {
        TokenStream {
            id,
            events,
            cancel,
            done: false,
        }
    }

    /// Id of this run, usable with [`crate::session::SessionManager::cancel`].
    pub fn generation_id(&self) -> GenerationId {
        self.id
    }

    /// A clone of this run's cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Receive the next event, waiting at most `timeout`. `None` on timeout
    /// or after the terminal event.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<TokenEvent> {
        if self.done {
            return None;
        }
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                if event.is_terminal() {
                    self.done = true;
                }
                Some(event)
            }
            Err(_) => None,
        }
    }
}

impl Iterator for TokenStream {
    type Item = TokenEvent;

    fn next(&mut self) -> Option<TokenEvent> {
        if self.done {
            return None;
        }
        match self.events.recv() {
            Ok(event) => {
                if event.is_terminal() {
                    self.done = true;
                }
                Some(event)
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if !self.done {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn stats() -> GenerationStats {
        GenerationStats {
            prompt_tokens: 1,
            generated_tokens: 1,
            prefill_ms: 0.0,
            decode_ms: 0.0,
            tokens_per_second: 0.0,
        }
    }

    #[test]
    fn fused_after_terminal_event() {
        let (tx, rx) = bounded(4);
        tx.send(TokenEvent::Fragment("a".into())).unwrap();
        tx.send(TokenEvent::Completed {
            reason: StopReason::MaxTokens,
            stats: stats(),
        })
        .unwrap();
        tx.send(TokenEvent::Fragment("never seen".into())).unwrap();

        let mut stream = TokenStream::new(GenerationId::new(), rx, CancellationToken::new());
        assert!(matches!(stream.next(), Some(TokenEvent::Fragment(_))));
        assert!(matches!(stream.next(), Some(TokenEvent::Completed { .. })));
        assert!(stream.next().is_none());
        assert!(stream.next().is_none());
    }

    #[test]
    fn drop_before_terminal_cancels() {
        let (_tx, rx) = bounded::<TokenEvent>(1);
        let cancel = CancellationToken::new();
        let stream = TokenStream::new(GenerationId::new(), rx, cancel.clone());
        drop(stream);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn drop_after_terminal_does_not_cancel() {
        let (tx, rx) = bounded(1);
        let cancel = CancellationToken::new();
        tx.send(TokenEvent::Cancelled).unwrap();
        let mut stream = TokenStream::new(GenerationId::new(), rx, cancel.clone());
        assert!(matches!(stream.next(), Some(TokenEvent::Cancelled)));
        drop(stream);
        assert!(!cancel.is_cancelled());
    }
}
