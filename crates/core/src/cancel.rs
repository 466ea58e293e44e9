//! Latched cancellation flag for tile producers.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Cooperative cancellation flag shared between a producer and its callers.
///
/// Clones share the same underlying state. `cancel()` latches the flag so an
/// in-flight load can observe it via `is_cancelled()` and bail out early;
/// `reset()` clears the latch before the next load proceeds.
///
/// # Example
///
/// ```
/// use chartpad_core::CancelFlag;
///
/// let flag = CancelFlag::new();
/// let producer_flag = flag.clone();
///
/// flag.cancel();
/// assert!(producer_flag.is_cancelled());
///
/// flag.reset();
/// assert!(!producer_flag.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    /// Create a new flag in the non-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the flag. Idempotent; observed by all clones.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check whether `cancel()` has been called since the last `reset()`.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Clear the latch so subsequent loads may proceed.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}
