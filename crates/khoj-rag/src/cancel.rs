//! Cooperative cancellation token.
//!
//! Cloned into every orchestration layer and checked at stage entry, at the
//! top of each agent iteration, before each retry attempt, and during backoff
//! sleeps. Cancelling is idempotent and wakes all pending waiters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::RagError;

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Fails with [`RagError::Aborted`] if the token has been cancelled.
    pub fn check(&self) -> Result<(), RagError> {
        if self.is_cancelled() {
            Err(RagError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled. Safe against the
    /// check-then-register race: the waiter is enabled before the final
    /// flag check.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        loop {
            if self.is_cancelled() {
                return;
            }
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_is_live() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_propagates_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(RagError::Aborted)));
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::task::yield_now().await;
        token.cancel();
        handle.await.expect("waiter task");
    }

    #[tokio::test]
    async fn test_wait_after_cancel_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
