use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use duplex_domain::Error;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// A one-shot cooperative cancellation signal.
///
/// Cloning shares the same underlying state — every clone observes the same
/// cancellation. Tokens are not reusable: once cancelled, they stay
/// cancelled forever.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    cancelled_at: Arc<Mutex<Option<DateTime<Utc>>>>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            cancelled_at: Arc::new(Mutex::new(None)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Sets the signal. Idempotent: only the first call records a timestamp.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::Release) {
            *self.cancelled_at.lock() = Some(Utc::now());
        }
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        *self.cancelled_at.lock()
    }

    /// Fails with `Error::Cancelled` if the token has been cancelled.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Suspends until the token is cancelled. Returns immediately if it
    /// already is.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
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
    fn starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancelled_at().is_none());
        assert!(token.check().is_ok());
    }

    #[test]
    fn cancel_is_idempotent_and_records_one_timestamp() {
        let token = CancelToken::new();
        token.cancel();
        let first = token.cancelled_at().expect("timestamp recorded");
        token.cancel();
        token.cancel();
        assert_eq!(token.cancelled_at(), Some(first));
        assert!(token.is_cancelled());
    }

    #[test]
    fn check_fails_once_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn wait_returns_immediately_if_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(50), token.wait())
            .await
            .expect("wait should not block");
    }

    #[tokio::test]
    async fn wait_unblocks_when_cancelled_from_another_task() {
        let token = CancelToken::new();
        let waiter_token = token.clone();
        let waiter = tokio::spawn(async move {
            waiter_token.wait().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(200), waiter)
            .await
            .expect("waiter should complete")
            .expect("waiter task should not panic");
    }
}
