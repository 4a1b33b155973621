//! Cooperative cancellation for cohort evaluation.
//!
//! A [`CancellationToken`] is handed to every [`DataStore`](crate::DataStore)
//! call. Stores are expected to poll it between units of work and bail out
//! with [`StoreError::Cancelled`](crate::StoreError::Cancelled) once it fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{EngineError, EngineResult};

#[derive(Debug)]
struct TokenState {
    cancelled: AtomicBool,
    deadline: Option<(Instant, Duration)>,
    parent: Option<CancellationToken>,
}

/// Shared cancellation flag with an optional deadline.
///
/// Cloning a token is cheap and every clone observes the same flag. A
/// [`child`](Self::child) token fires when it is cancelled itself or when
/// any of its ancestors fires, but cancelling the child leaves the parent
/// untouched.
///
/// # Example
///
/// ```rust
/// use cohort_engine::CancellationToken;
///
/// let token = CancellationToken::new();
/// let child = token.child();
///
/// child.cancel();
/// assert!(child.is_cancelled());
/// assert!(!token.is_cancelled());
///
/// token.cancel();
/// assert!(token.child().is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Creates a token that never fires unless cancelled.
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Creates a token that fires once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Some((Instant::now() + timeout, timeout)), None)
    }

    /// Creates a child token linked to this one.
    pub fn child(&self) -> Self {
        Self::build(None, Some(self.clone()))
    }

    /// Creates a child token that additionally fires after `timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self::build(Some((Instant::now() + timeout, timeout)), Some(self.clone()))
    }

    fn build(deadline: Option<(Instant, Duration)>, parent: Option<CancellationToken>) -> Self {
        Self {
            inner: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                deadline,
                parent,
            }),
        }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Returns true if this token or an ancestor was cancelled or has
    /// passed its deadline.
    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    /// Time left before the nearest deadline, if any deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        let own = self
            .inner
            .deadline
            .map(|(at, _)| at.saturating_duration_since(Instant::now()));
        let parent = self.inner.parent.as_ref().and_then(|p| p.remaining());
        match (own, parent) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Returns `Err(Cancelled)` or `Err(Timeout)` if the token has fired.
    pub fn check(&self) -> EngineResult<()> {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return Err(EngineError::Cancelled);
        }
        if let Some((at, timeout)) = self.inner.deadline {
            if Instant::now() >= at {
                return Err(EngineError::Timeout(timeout));
            }
        }
        match &self.inner.parent {
            Some(parent) => parent.check(),
            None => Ok(()),
        }
    }
}
