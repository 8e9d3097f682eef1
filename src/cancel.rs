//! Cooperative cancellation for generation runs.
//!
//! A [`CancellationToken`] is a single-writer, multi-reader flag associated
//! 1:1 with an in-flight run. Cancellation is cooperative, never preemptive:
//! the decode loop observes the flag once per iteration, so it takes effect
//! within one forward-pass latency. Once set, the flag stays set for the life
//! of the run.
//!
//! Timeouts use the same mechanism: a timeout is a cancellation scheduled by
//! a timer ([`CancellationToken::cancel_after`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Shared cancellation flag for one generation run. Clones observe the same
/// flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; irreversible for this run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Schedule a cancel after `delay` from a detached timer thread.
    pub fn cancel_after(&self, delay: Duration) {
        let token = self.clone();
        let _ = thread::Builder::new()
            .name("cancel-timer".into())
            .spawn(move || {
                thread::sleep(delay);
                token.cancel();
            });
    }
}
