//! Ambient execution context threaded through every runtime component
//!
//! This module provides:
//! - Cooperative cancellation with cause reporting
//! - Deadline propagation (a child deadline never extends its parent's)
//! - Telemetry handle carriage with process-default fallback
//!
//! A [`Ctx`] is cheap to clone and is passed by reference into every blocking
//! public call in the crate. Work that has already been accepted is never
//! forcibly aborted; user code is expected to observe the context and return.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::telemetry::{self, Meter, MeterProvider};

/// Why a context stopped accepting work.
///
/// Cancellation is a normal control-flow outcome, never logged as an error
/// at this layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The context (or one of its ancestors) was cancelled explicitly.
    #[error("context cancelled")]
    Cancelled,

    /// The context's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Handle that cancels the [`Ctx`] it was derived with.
///
/// Dropping the canceller does NOT cancel the context; cancellation is
/// always explicit.
#[derive(Debug, Clone)]
pub struct Canceller {
    token: CancellationToken,
}

impl Canceller {
    /// Cancel the associated context and everything derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the associated context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct CtxInner {
    token: CancellationToken,
    deadline: Option<Instant>,
    meter_provider: Option<Arc<dyn MeterProvider>>,
}

/// Ambient context: cancellation, deadline, and telemetry handles.
#[derive(Clone)]
pub struct Ctx {
    inner: Arc<CtxInner>,
}

impl Default for Ctx {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx")
            .field("cancelled", &self.inner.token.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

impl Ctx {
    /// Root context: never cancelled, no deadline, process-default telemetry.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(CtxInner {
                token: CancellationToken::new(),
                deadline: None,
                meter_provider: None,
            }),
        }
    }

    fn derive(&self, deadline: Option<Instant>) -> (Ctx, Canceller) {
        let token = self.inner.token.child_token();
        let canceller = Canceller {
            token: token.clone(),
        };
        let ctx = Ctx {
            inner: Arc::new(CtxInner {
                token,
                deadline,
                meter_provider: self.inner.meter_provider.clone(),
            }),
        };
        (ctx, canceller)
    }

    /// Derive a cancellable child context.
    pub fn with_cancel(&self) -> (Ctx, Canceller) {
        self.derive(self.inner.deadline)
    }

    /// Derive a child context with a deadline.
    ///
    /// The effective deadline is the earlier of `at` and the parent's
    /// deadline; a child can never outlive its parent.
    pub fn with_deadline(&self, at: Instant) -> (Ctx, Canceller) {
        let effective = match self.inner.deadline {
            Some(parent) => parent.min(at),
            None => at,
        };
        self.derive(Some(effective))
    }

    /// Derive a child context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> (Ctx, Canceller) {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context carrying an explicit meter provider.
    pub fn with_meter_provider(&self, provider: Arc<dyn MeterProvider>) -> Ctx {
        Ctx {
            inner: Arc::new(CtxInner {
                token: self.inner.token.child_token(),
                deadline: self.inner.deadline,
                meter_provider: Some(provider),
            }),
        }
    }

    /// The deadline, if one is set on this context or an ancestor.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Whether the context is no longer accepting work.
    pub fn is_cancelled(&self) -> bool {
        self.error().is_some()
    }

    /// The cancellation cause, or `None` while the context is live.
    pub fn error(&self) -> Option<CancelReason> {
        if self.inner.token.is_cancelled() {
            return Some(CancelReason::Cancelled);
        }
        match self.inner.deadline {
            Some(at) if Instant::now() >= at => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Wait until the context is cancelled and report the cause.
    ///
    /// A root context never resolves; callers race this against real work
    /// in a `select!`.
    pub async fn cancelled(&self) -> CancelReason {
        match self.inner.deadline {
            Some(at) => {
                tokio::select! {
                    _ = self.inner.token.cancelled() => CancelReason::Cancelled,
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {
                        CancelReason::DeadlineExceeded
                    }
                }
            }
            None => {
                self.inner.token.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }

    /// The meter provider carried by this context, falling back to the
    /// process default.
    pub fn meter_provider(&self) -> Arc<dyn MeterProvider> {
        match &self.inner.meter_provider {
            Some(provider) => provider.clone(),
            None => telemetry::default_meter_provider(),
        }
    }

    /// Shorthand for `meter_provider().meter(scope)`.
    pub fn meter(&self, scope: &str) -> Arc<dyn Meter> {
        self.meter_provider().meter(scope)
    }
}
