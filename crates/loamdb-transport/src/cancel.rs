//! Cooperative cancellation.
//!
//! Every long-running operation takes a token and checks it at suspension
//! points. Cancellation carries a typed reason so callers can tell a
//! database shutdown from a superseding worker.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::Notify;

/// Why an operation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// The database or node is shutting down.
    Shutdown,
    /// The database was deleted.
    DatabaseDeleted,
    /// The underlying connection was dropped by an operator or peer.
    ConnectionDropped,
    /// A newer connection took over this one.
    Superseded,
    /// Explicit caller request.
    #[default]
    UserRequested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Shutdown => write!(f, "Shutdown"),
            CancelReason::DatabaseDeleted => write!(f, "DatabaseDeleted"),
            CancelReason::ConnectionDropped => write!(f, "ConnectionDropped"),
            CancelReason::Superseded => write!(f, "Superseded"),
            CancelReason::UserRequested => write!(f, "UserRequested"),
        }
    }
}

/// Error returned when an operation observes cancellation.
#[derive(Debug, Error)]
#[error("operation cancelled: {0}")]
pub struct CancelledError(pub CancelReason);

struct CancelInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
    children: Mutex<Vec<Arc<CancelInner>>>,
}

impl CancelInner {
    fn new(initial: Option<CancelReason>) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(initial.is_some()),
            reason: Mutex::new(initial),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self, reason: CancelReason) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.reason.lock() {
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.notify.notify_waiters();
        if let Ok(children) = self.children.lock() {
            for child in children.iter() {
                child.cancel(reason);
            }
        }
    }
}

/// A cloneable token observed by the cancelled operation.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// True once cancellation was triggered.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The cancellation reason, once cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        *self.inner.reason.lock().expect("lock poisoned")
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            if self.is_cancelled() {
                return self.reason().unwrap_or_default();
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return self.reason().unwrap_or_default();
            }
            notified.await;
        }
    }

    /// Return Err when cancelled; used at loop heads.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError(self.reason().unwrap_or_default()))
        } else {
            Ok(())
        }
    }

    /// Create a child pair cancelled with the parent but also cancellable
    /// on its own.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let child = CancelInner::new(self.reason().filter(|_| self.is_cancelled()));
        self.inner
            .children
            .lock()
            .expect("lock poisoned")
            .push(child.clone());
        (
            CancelToken {
                inner: child.clone(),
            },
            CancelHandle { inner: child },
        )
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl CancelHandle {
    /// Trigger cancellation. The first reason wins; later calls are no-ops.
    pub fn cancel(&self, reason: CancelReason) {
        self.inner.cancel(reason);
    }

    /// True once cancellation was triggered.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

/// Create a fresh token/handle pair.
pub fn cancel_pair() -> (CancelToken, CancelHandle) {
    let inner = CancelInner::new(None);
    (
        CancelToken {
            inner: inner.clone(),
        },
        CancelHandle { inner },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_sets_flag_and_reason() {
        let (token, handle) = cancel_pair();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        handle.cancel(CancelReason::Shutdown);
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some(CancelReason::Shutdown));
        assert!(token.check().is_err());
    }

    #[test]
    fn test_first_reason_wins() {
        let (token, handle) = cancel_pair();
        handle.cancel(CancelReason::DatabaseDeleted);
        handle.cancel(CancelReason::Shutdown);
        assert_eq!(token.reason(), Some(CancelReason::DatabaseDeleted));
    }

    #[test]
    fn test_child_cancelled_with_parent() {
        let (parent, handle) = cancel_pair();
        let (child, _child_handle) = parent.child();

        handle.cancel(CancelReason::Shutdown);
        assert!(child.is_cancelled());
        assert_eq!(child.reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn test_child_cancel_does_not_affect_parent() {
        let (parent, _handle) = cancel_pair();
        let (child, child_handle) = parent.child();

        child_handle.cancel(CancelReason::Superseded);
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let (token, handle) = cancel_pair();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        handle.cancel(CancelReason::ConnectionDropped);
        assert_eq!(waiter.await.unwrap(), CancelReason::ConnectionDropped);
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves_immediately_when_already_cancelled() {
        let (token, handle) = cancel_pair();
        handle.cancel(CancelReason::Shutdown);
        assert_eq!(token.cancelled().await, CancelReason::Shutdown);
    }
}
