use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

/// Handle that interrupts the pending read or flush of one adapter.
///
/// The adapter keeps a one-shot internal token; cancelling it makes the
/// in-flight operation return normally with `is_canceled` set. The adapter
/// swaps in a fresh token once it observes the cancellation, so a later
/// operation is unaffected.
#[derive(Debug, Clone, Default)]
pub struct PipeCanceller {
    current: Arc<Mutex<CancellationToken>>,
}

impl PipeCanceller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel whatever operation is pending, or the next one if none is.
    pub fn cancel(&self) {
        self.lock().cancel();
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.lock().clone()
    }

    /// Replace a fired token with a fresh one.
    pub(crate) fn reset_if_cancelled(&self) {
        let mut current = self.lock();
        if current.is_cancelled() {
            *current = CancellationToken::new();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_recreates_token_after_cancel() {
        let canceller = PipeCanceller::new();
        let first = canceller.token();
        canceller.cancel();
        assert!(first.is_cancelled());

        canceller.reset_if_cancelled();
        let second = canceller.token();
        assert!(!second.is_cancelled());
    }
}
