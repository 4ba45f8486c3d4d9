//! Cancellation and deadline propagation.
//!
//! Every suspension point in the runtime (FIFO open, rendezvous poll,
//! post-start wait, cgroup drain) checks a caller supplied [`Context`].
//! The deadline, if any, is also propagated to the console socket as a
//! socket timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

/// Cancels the associated [`Context`] from another thread.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Context {
    /// A context without deadline that is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Context {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancelled.clone())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, `None` if no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns an error if the context is cancelled or past its deadline.
    /// `what` names the pending operation for the timeout message.
    pub fn check(&self, what: &str) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout(what.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_never_expires() {
        let ctx = Context::background();
        assert!(ctx.check("anything").is_ok());
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn test_deadline_expires() {
        let ctx = Context::with_timeout(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        match ctx.check("rendezvous") {
            Err(Error::Timeout(what)) => assert_eq!(what, "rendezvous"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_cancel_from_handle() {
        let ctx = Context::with_timeout(Duration::from_secs(60));
        let handle = ctx.cancel_handle();
        assert!(ctx.check("drain").is_ok());
        handle.cancel();
        assert!(matches!(ctx.check("drain"), Err(Error::Cancelled)));
    }
}
