//! Exponential backoff and retry engine
//!
//! This module provides:
//! - A pure delay policy: `min(max, initial * multiplier^k)` with
//!   symmetric randomisation
//! - Built-in policies for fast, second-scale, and slow retry loops
//! - A retry driver bounded by the ambient context, an optional attempt
//!   limit, and a permanent-error marker
//! - An error-transformer chain applied before classification

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::context::Ctx;

/// Backoff errors.
#[derive(Error, Debug)]
pub enum BackoffError {
    /// The policy fields do not describe a usable schedule.
    #[error("invalid backoff policy: {0}")]
    InvalidPolicy(String),
}

/// Result type for backoff operations.
pub type BackoffResult<T> = Result<T, BackoffError>;

/// Delay schedule for a retry loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    /// Delay before the first retry.
    pub initial_interval: Duration,

    /// Ceiling the exponential growth is clamped to.
    pub max_interval: Duration,

    /// Growth factor per attempt; must be ≥ 1.
    pub multiplier: f64,

    /// Symmetric jitter as a fraction of the interval, in `[0, 1]`.
    pub randomization_factor: f64,
}

impl Default for Policy {
    fn default() -> Self {
        Self::seconds()
    }
}

impl Policy {
    /// 100 ms → 60 s, doubling, ±50% jitter. For tight in-process retries.
    pub fn fast() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
            randomization_factor: 0.5,
        }
    }

    /// 1 s → 60 s, doubling, ±50% jitter. The general-purpose default.
    pub fn seconds() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
            randomization_factor: 0.5,
        }
    }

    /// 30 s → 5 min, doubling, ±20% jitter. For slow external dependencies.
    pub fn thirty_seconds() -> Self {
        Self {
            initial_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(300),
            multiplier: 2.0,
            randomization_factor: 0.2,
        }
    }

    /// Validate the policy fields.
    pub fn validate(&self) -> BackoffResult<()> {
        if self.initial_interval.is_zero() {
            return Err(BackoffError::InvalidPolicy(
                "initial_interval must be positive".to_string(),
            ));
        }
        if self.max_interval < self.initial_interval {
            return Err(BackoffError::InvalidPolicy(
                "max_interval must be at least initial_interval".to_string(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(BackoffError::InvalidPolicy(
                "multiplier must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(BackoffError::InvalidPolicy(
                "randomization_factor must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// The unjittered delay before retry number `attempt` (zero-based):
    /// `min(max_interval, initial_interval * multiplier^attempt)`.
    pub fn interval_for(&self, attempt: u32) -> Duration {
        let grown = self.initial_interval.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let clamped = grown.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(clamped)
    }

    /// Apply symmetric jitter: `interval * (1 ± rand * randomization_factor)`.
    pub fn jittered(&self, interval: Duration) -> Duration {
        if self.randomization_factor <= 0.0 {
            return interval;
        }
        let delta = self.randomization_factor * interval.as_secs_f64();
        let low = interval.as_secs_f64() - delta;
        let sampled = low + rand::thread_rng().gen::<f64>() * (2.0 * delta);
        Duration::from_secs_f64(sampled.max(0.0))
    }
}

/// Marker wrapping an error the retry loop must not retry.
#[derive(Debug)]
pub struct Permanent(
    /// The wrapped error, returned unwrapped by [`Backoff::retry`].
    pub anyhow::Error,
);

impl std::fmt::Display for Permanent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "permanent: {}", self.0)
    }
}

impl std::error::Error for Permanent {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source: &(dyn std::error::Error + 'static) = &*self.0;
        Some(source)
    }
}

/// Wrap `err` so [`Backoff::retry`] stops immediately and returns it.
pub fn permanent(err: anyhow::Error) -> anyhow::Error {
    anyhow::Error::new(Permanent(err))
}

/// Information handed to the operation on each invocation.
#[derive(Debug, Clone, Copy)]
pub struct Attempt {
    /// Zero-based invocation number.
    pub number: u32,

    /// The jittered delay slept before this invocation, if any.
    pub last_delay: Option<Duration>,
}

type ErrTransformer = Arc<dyn Fn(anyhow::Error) -> anyhow::Error + Send + Sync>;

/// Retry driver pairing a [`Policy`] with loop bounds.
#[derive(Clone)]
pub struct Backoff {
    policy: Policy,
    max_attempts: Option<u32>,
    transformers: Vec<ErrTransformer>,
    testing: bool,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("policy", &self.policy)
            .field("max_attempts", &self.max_attempts)
            .field("transformers", &self.transformers.len())
            .field("testing", &self.testing)
            .finish()
    }
}

impl Backoff {
    /// Build a driver around a validated policy.
    pub fn new(policy: Policy) -> BackoffResult<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            max_attempts: None,
            transformers: Vec::new(),
            testing: false,
        })
    }

    /// Driver over [`Policy::fast`].
    pub fn fast() -> Self {
        Self {
            policy: Policy::fast(),
            max_attempts: None,
            transformers: Vec::new(),
            testing: false,
        }
    }

    /// Driver over [`Policy::seconds`].
    pub fn seconds() -> Self {
        Self {
            policy: Policy::seconds(),
            ..Self::fast()
        }
    }

    /// Driver over [`Policy::thirty_seconds`].
    pub fn thirty_seconds() -> Self {
        Self {
            policy: Policy::thirty_seconds(),
            ..Self::fast()
        }
    }

    /// Stop after `max` invocations and return the last error.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max.max(1));
        self
    }

    /// Append an error transformer, applied in registration order to every
    /// failure before it is classified (e.g. to mark error classes
    /// permanent).
    pub fn with_transformer<F>(mut self, transform: F) -> Self
    where
        F: Fn(anyhow::Error) -> anyhow::Error + Send + Sync + 'static,
    {
        self.transformers.push(Arc::new(transform));
        self
    }

    /// Skip the sleeps. Test builds only; the schedule is still computed.
    pub fn testing(mut self) -> Self {
        self.testing = true;
        self
    }

    /// The delay schedule.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Invoke `op` until it succeeds, is cancelled, returns a
    /// [`Permanent`] error, or exhausts the attempt limit.
    ///
    /// Between failures the driver sleeps the jittered policy interval,
    /// racing the context; cancellation mid-sleep returns the last error
    /// annotated with the cause. A context that is already cancelled on
    /// entry fails without invoking `op`.
    pub async fn retry<T, F, Fut>(&self, ctx: &Ctx, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut(Ctx, Attempt) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut number = 0u32;
        let mut last_delay = None;

        loop {
            if let Some(reason) = ctx.error() {
                return Err(anyhow::Error::new(reason));
            }

            let attempt = Attempt { number, last_delay };
            match op(ctx.clone(), attempt).await {
                Ok(value) => return Ok(value),
                Err(raw) => {
                    let mut err = raw;
                    for transform in &self.transformers {
                        err = transform(err);
                    }
                    if err.is::<Permanent>() {
                        return Err(match err.downcast::<Permanent>() {
                            Ok(marker) => marker.0,
                            Err(err) => err,
                        });
                    }

                    number += 1;
                    if let Some(max) = self.max_attempts {
                        if number >= max {
                            return Err(err);
                        }
                    }

                    let delay = self.policy.jittered(self.policy.interval_for(number - 1));
                    last_delay = Some(delay);
                    if !self.testing {
                        tokio::select! {
                            reason = ctx.cancelled() => return Err(err.context(reason)),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy_no_jitter() -> Policy {
        Policy {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            multiplier: 2.0,
            randomization_factor: 0.0,
        }
    }

    #[test]
    fn test_interval_growth_and_clamp() {
        let policy = policy_no_jitter();
        assert_eq!(policy.interval_for(0), Duration::from_millis(100));
        assert_eq!(policy.interval_for(1), Duration::from_millis(200));
        assert_eq!(policy.interval_for(2), Duration::from_millis(400));
        // 100ms * 2^10 = 102.4s, clamped to 2s
        assert_eq!(policy.interval_for(10), Duration::from_secs(2));
    }

    #[test]
    fn test_validation() {
        assert!(Policy::fast().validate().is_ok());
        assert!(Policy::seconds().validate().is_ok());
        assert!(Policy::thirty_seconds().validate().is_ok());

        let mut p = policy_no_jitter();
        p.initial_interval = Duration::ZERO;
        assert!(p.validate().is_err());

        let mut p = policy_no_jitter();
        p.max_interval = Duration::from_millis(1);
        assert!(p.validate().is_err());

        let mut p = policy_no_jitter();
        p.multiplier = 0.5;
        assert!(p.validate().is_err());

        let mut p = policy_no_jitter();
        p.randomization_factor = 1.5;
        assert!(p.validate().is_err());
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let backoff = Backoff::new(policy_no_jitter()).unwrap().testing();
        let calls = AtomicU32::new(0);

        let result: anyhow::Result<u32> = backoff
            .retry(&Ctx::background(), |_ctx, attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(anyhow!("not yet (attempt {})", attempt.number))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent() {
        let backoff = Backoff::fast().testing();
        let calls = AtomicU32::new(0);

        let result: anyhow::Result<()> = backoff
            .retry(&Ctx::background(), |_ctx, _attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(permanent(anyhow!("bad input"))) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "bad input");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let backoff = Backoff::fast().testing().with_max_attempts(3);
        let calls = AtomicU32::new(0);

        let result: anyhow::Result<()> = backoff
            .retry(&Ctx::background(), |_ctx, _attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("always failing")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_rejects_cancelled_ctx() {
        let (ctx, canceller) = Ctx::background().with_cancel();
        canceller.cancel();

        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = Backoff::fast()
            .testing()
            .retry(&ctx, |_ctx, _attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transformer_marks_permanent() {
        let backoff = Backoff::fast().testing().with_transformer(|err| {
            if err.to_string().contains("fatal") {
                permanent(err)
            } else {
                err
            }
        });

        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = backoff
            .retry(&Ctx::background(), |_ctx, _attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("fatal: unrecoverable")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_carries_last_delay() {
        let backoff = Backoff::new(policy_no_jitter()).unwrap().testing();
        let calls = AtomicU32::new(0);

        let _ = backoff
            .retry(&Ctx::background(), |_ctx, attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => {
                            assert_eq!(attempt.last_delay, None);
                            Err(anyhow!("again"))
                        }
                        _ => {
                            assert_eq!(attempt.last_delay, Some(Duration::from_millis(100)));
                            Ok(())
                        }
                    }
                }
            })
            .await;
    }

    proptest! {
        #[test]
        fn prop_jitter_stays_in_envelope(
            millis in 1u64..10_000,
            factor in 0.0f64..1.0,
        ) {
            let policy = Policy {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_secs(3600),
                multiplier: 2.0,
                randomization_factor: factor,
            };
            let interval = Duration::from_millis(millis);
            let jittered = policy.jittered(interval);
            let delta = interval.as_secs_f64() * factor;
            prop_assert!(jittered.as_secs_f64() >= interval.as_secs_f64() - delta - 1e-9);
            prop_assert!(jittered.as_secs_f64() <= interval.as_secs_f64() + delta + 1e-9);
        }

        #[test]
        fn prop_intervals_monotone_until_clamp(attempt in 0u32..40) {
            let policy = Policy {
                initial_interval: Duration::from_millis(50),
                max_interval: Duration::from_secs(10),
                multiplier: 1.7,
                randomization_factor: 0.0,
            };
            let here = policy.interval_for(attempt);
            let next = policy.interval_for(attempt + 1);
            prop_assert!(next >= here);
            prop_assert!(next <= policy.max_interval);
        }
    }
}
