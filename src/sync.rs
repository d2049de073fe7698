//! Small synchronisation primitives used at the request boundary.
//!
//! The recording system itself never blocks: producers enqueue a request
//! and either poll its status word or wait on the request's [`Semaphore`]
//! from their own task context. [`CancelToken`] is the cooperative
//! replacement for the volatile timeout flags the device polls used to
//! share with timer callbacks.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Counting semaphore.
///
/// `give` is called by the gatekeeper when a request reaches a terminal
/// state; the producer that issued the request calls `try_take` (typically
/// from a periodic task or an RTOS wrapper that knows how to sleep).
#[derive(Debug, Default)]
pub struct Semaphore {
    count: AtomicU32,
}

impl Semaphore {
    pub const fn new() -> Self {
        Semaphore {
            count: AtomicU32::new(0),
        }
    }

    /// Release the semaphore once.
    pub fn give(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Take the semaphore if it is available. Never blocks.
    pub fn try_take(&self) -> bool {
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .is_ok()
    }

    /// Number of outstanding `give`s.
    pub fn available(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

/// Shared cancellation flag checked at well-defined suspension points.
///
/// A timer (or any other context) holds a clone and calls [`cancel`];
/// the long-running operation polls [`is_cancelled`] each time it is about
/// to refill a buffer and abandons the work when the flag is set.
///
/// [`cancel`]: CancelToken::cancel
/// [`is_cancelled`]: CancelToken::is_cancelled
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Re-arm the token before a new operation starts.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_counts_gives() {
        let sem = Semaphore::new();
        assert!(!sem.try_take(), "fresh semaphore must not be takeable");

        sem.give();
        sem.give();
        assert_eq!(sem.available(), 2);
        assert!(sem.try_take());
        assert!(sem.try_take());
        assert!(!sem.try_take(), "semaphore must be exhausted after takes");
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let timer_side = token.clone();

        assert!(!token.is_cancelled());
        timer_side.cancel();
        assert!(token.is_cancelled(), "cancel must be visible via clones");

        token.clear();
        assert!(!timer_side.is_cancelled());
    }
}
