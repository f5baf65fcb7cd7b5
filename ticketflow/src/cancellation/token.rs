//! Cooperative cancellation of a workflow run.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use crate::errors::{FlowError, FlowResult};

/// Callback invoked once when a run is cancelled.
pub type CancelCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Shared flag checked by the execution graph before every stage and fork.
///
/// Cancelling stops further scheduling only; stages already running finish
/// normally. The first reason wins.
#[derive(Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    callbacks: RwLock<Vec<CancelCallback>>,
}

fn invoke(callback: &CancelCallback, reason: &str) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(reason))) {
        warn!("Cancellation callback panicked: {:?}", e);
    }
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Later calls are ignored.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let reason = reason.into();
        debug!(reason = %reason, "Run cancelled");
        *self.reason.write() = Some(reason.clone());
        for callback in self.callbacks.read().iter() {
            invoke(callback, &reason);
        }
    }

    /// Registers a callback receiving the reason. Runs immediately when the
    /// token is already cancelled. Panicking callbacks are logged.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let callback: CancelCallback = Box::new(callback);
        match self.reason() {
            Some(reason) => invoke(&callback, &reason),
            None => self.callbacks.write().push(callback),
        }
    }

    /// Returns whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The first cancellation reason.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Fails with [`FlowError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> FlowResult<()> {
        if self.is_cancelled() {
            Err(FlowError::Cancelled(
                self.reason().unwrap_or_else(|| "cancelled".to_string()),
            ))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_check_before_and_after_cancel() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());

        token.cancel("deadline passed");
        let err = token.check().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(err.to_string().contains("deadline passed"));
    }

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        token.cancel("first");
        token.cancel("second");
        assert_eq!(token.reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_callbacks_receive_reason() {
        let token = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let before = seen.clone();
        token.on_cancel(move |r| before.lock().push(format!("before:{r}")));
        token.cancel("stop");
        let after = seen.clone();
        token.on_cancel(move |r| after.lock().push(format!("after:{r}")));

        assert_eq!(*seen.lock(), vec!["before:stop", "after:stop"]);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let token = CancellationToken::new();
        token.on_cancel(|_| panic!("boom"));
        token.cancel("stop");
        assert!(token.is_cancelled());
    }
}
