//! Retry policies and the retry executor.
//!
//! The executor is the only place that decides whether a failure is retried.
//! Each attempt runs under the configured operation timeout and the caller's
//! cancellation token; between attempts it sleeps for a backoff delay with
//! symmetric jitter.
//!
//! ```rust,ignore
//! use resilient_scheduler::core::{OperationContext, RetryExecutor, RetryPolicyService};
//! use tokio_util::sync::CancellationToken;
//!
//! let executor = RetryExecutor::new(options);
//! let ctx = OperationContext::new("run_task").with_task_name("nightly-report");
//! let value = executor
//!     .execute_with_retry(|| async { Ok(42) }, None, &ctx, &CancellationToken::new())
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::options::duration_millis;
use crate::config::SchedulerOptions;

use super::error::{NativeErrorKind, OperationContext, SchedulerError};

/// How the delay grows between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffMode {
    /// `base * retry`
    Linear,
    /// `base * 2^(retry - 1)`
    Exponential,
}

/// Retry configuration for a single invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retry_count: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound for the computed delay, before jitter.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Jitter factor in `[0, 1]`. A factor of `j` moves the delay by at most
    /// `±j/2` of itself.
    pub jitter_factor: f64,
    /// Growth mode.
    pub backoff: BackoffMode,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        SchedulerOptions::default().default_retry_policy()
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            retry_count: 0,
            ..Self::default()
        }
    }

    /// Set the number of retries.
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Set the base delay.
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Set the backoff mode.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffMode) -> Self {
        self.backoff = backoff;
        self
    }

    /// Total attempts this policy allows.
    pub const fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Validate policy values.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            ));
        }
        if self.max_delay < self.base_delay {
            return Err("max_delay must be at least base_delay".into());
        }
        Ok(())
    }

    /// Backoff delay before retry number `retry` (1-based), without jitter.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let raw = match self.backoff {
            BackoffMode::Linear => self.base_delay.saturating_mul(retry),
            BackoffMode::Exponential => {
                // 2^31 already dwarfs any sane max_delay
                let factor = 1u32 << (retry - 1).min(31);
                self.base_delay.saturating_mul(factor)
            }
        };
        raw.min(self.max_delay)
    }

    /// Perturb `delay` by `delay * jitter_factor * (sample - 0.5)`.
    ///
    /// `sample` is a uniform draw from `[0, 1)`.
    pub fn apply_jitter(&self, delay: Duration, sample: f64) -> Duration {
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let scale = self.jitter_factor.mul_add(sample.clamp(0.0, 1.0) - 0.5, 1.0);
        // saturate instead of panicking near Duration::MAX
        Duration::try_from_secs_f64(delay.as_secs_f64() * scale.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Backoff delay with jitter drawn from the thread-local RNG.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let sample: f64 = rand::rng().random();
        self.apply_jitter(self.backoff_delay(retry), sample)
    }
}

/// Settings the executor reads from the process-wide options.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Policy used when the caller passes none.
    pub default_policy: RetryPolicy,
    /// Limit for each individual attempt.
    pub operation_timeout: Duration,
    /// Emit per-attempt debug events.
    pub detailed_logging: bool,
}

impl From<&SchedulerOptions> for RetrySettings {
    fn from(opts: &SchedulerOptions) -> Self {
        Self {
            default_policy: opts.default_retry_policy(),
            operation_timeout: opts.operation_timeout,
            detailed_logging: opts.detailed_logging,
        }
    }
}

/// Executes operations with bounded retry.
///
/// Implemented by [`RetryExecutor`]; tests may substitute their own.
pub trait RetryPolicyService: Send + Sync {
    /// Run `operation` until it succeeds, fails with a non-retriable error,
    /// runs out of attempts, or `cancel` fires.
    fn execute_with_retry<T, F, Fut>(
        &self,
        operation: F,
        policy: Option<&RetryPolicy>,
        context: &OperationContext,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<T, SchedulerError>> + Send
    where
        T: Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, SchedulerError>> + Send;

    /// No-result variant of [`execute_with_retry`](Self::execute_with_retry).
    fn execute_with_retry_unit<F, Fut>(
        &self,
        operation: F,
        policy: Option<&RetryPolicy>,
        context: &OperationContext,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), SchedulerError>> + Send
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<(), SchedulerError>> + Send,
    {
        self.execute_with_retry(operation, policy, context, cancel)
    }
}

/// Outcome of classifying one failed attempt.
enum Verdict {
    Retry(SchedulerError),
    Stop(SchedulerError),
}

/// Sort a failure into fatal, retriable or unclassified.
///
/// Order matters: permission denial wins over everything, then the transient
/// allow-list. A broken handle is retried as well, since the pool has already
/// evicted it and the next attempt checks out a fresh one. Anything left
/// stops the loop.
fn classify(err: SchedulerError, context: &OperationContext) -> Verdict {
    if err.is_cancelled() {
        return Verdict::Stop(err.with_context(context));
    }
    if err.is_permission_denied() {
        let message = match err {
            SchedulerError::PermissionDenied { message, .. } => message,
            other => other.to_string(),
        };
        return Verdict::Stop(SchedulerError::PermissionDenied {
            message,
            context: context.clone(),
        });
    }
    if err.is_retriable() {
        return Verdict::Retry(err.with_context(context));
    }
    match err {
        SchedulerError::Native(native) if native.kind.is_corruption() => {
            Verdict::Retry(SchedulerError::Generic {
                message: native.to_string(),
                context: context.clone(),
            })
        }
        SchedulerError::Native(native) if native.kind == NativeErrorKind::NotFound => {
            Verdict::Stop(SchedulerError::NotFound {
                message: native.message,
                context: context.clone(),
            })
        }
        SchedulerError::Native(native) => Verdict::Stop(SchedulerError::Generic {
            message: native.to_string(),
            context: context.clone(),
        }),
        other => Verdict::Stop(other.with_context(context)),
    }
}

/// Production retry executor.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    settings: RetrySettings,
}

impl RetryExecutor {
    /// Build an executor from process-wide options.
    pub fn new(options: &SchedulerOptions) -> Self {
        Self {
            settings: RetrySettings::from(options),
        }
    }

    /// Build an executor from explicit settings.
    pub const fn with_settings(settings: RetrySettings) -> Self {
        Self { settings }
    }

    /// Settings in effect.
    pub const fn settings(&self) -> &RetrySettings {
        &self.settings
    }
}

impl RetryPolicyService for RetryExecutor {
    async fn execute_with_retry<T, F, Fut>(
        &self,
        mut operation: F,
        policy: Option<&RetryPolicy>,
        context: &OperationContext,
        cancel: &CancellationToken,
    ) -> Result<T, SchedulerError>
    where
        T: Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, SchedulerError>> + Send,
    {
        let policy = policy.unwrap_or(&self.settings.default_policy);
        if let Err(reason) = policy.validate() {
            error!(operation = %context.operation, %reason, "rejected retry policy");
            return Err(SchedulerError::ConfigurationInvalid(format!(
                "retry policy invalid: {reason}"
            )));
        }
        let max_attempts = policy.max_attempts();
        let timeout = self.settings.operation_timeout;
        let cancelled = || SchedulerError::Cancelled {
            context: context.clone(),
        };
        let mut last_error: Option<SchedulerError> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = policy.delay_for_retry(attempt - 1);
                if self.settings.detailed_logging {
                    debug!(
                        operation = %context.operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "waiting before retry"
                    );
                }
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(cancelled()),
                    () = tokio::time::sleep(delay) => {}
                }
            }

            if self.settings.detailed_logging {
                debug!(
                    operation = %context.operation,
                    task_id = context.task_id.as_deref(),
                    attempt,
                    max_attempts,
                    "starting attempt"
                );
            }

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled()),
                res = tokio::time::timeout(timeout, operation()) => res,
            };

            let err = match outcome {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        info!(
                            operation = %context.operation,
                            task_id = context.task_id.as_deref(),
                            task_name = context.task_name.as_deref(),
                            attempt,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Ok(Err(err)) => err,
                Err(_) => SchedulerError::OperationTimedOut {
                    timeout,
                    context: context.clone(),
                },
            };

            match classify(err, context) {
                Verdict::Stop(err) => {
                    error!(
                        operation = %context.operation,
                        task_id = context.task_id.as_deref(),
                        task_name = context.task_name.as_deref(),
                        attempt,
                        error = %err,
                        "operation failed with non-retriable error"
                    );
                    return Err(err);
                }
                Verdict::Retry(err) => {
                    if attempt < max_attempts {
                        warn!(
                            operation = %context.operation,
                            task_id = context.task_id.as_deref(),
                            task_name = context.task_name.as_deref(),
                            attempt,
                            max_attempts,
                            error = %err,
                            "transient failure, retrying"
                        );
                    }
                    last_error = Some(err);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| SchedulerError::RetriesExhausted {
            attempts: max_attempts,
            context: context.clone(),
        });
        error!(
            operation = %context.operation,
            task_id = context.task_id.as_deref(),
            task_name = context.task_name.as_deref(),
            attempts = max_attempts,
            error = %err,
            "operation failed after exhausting retries"
        );
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::NativeError;

    fn policy(mode: BackoffMode) -> RetryPolicy {
        RetryPolicy {
            retry_count: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
            backoff: mode,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let p = policy(BackoffMode::Exponential);
        assert_eq!(p.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(p.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(p.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(p.backoff_delay(5), Duration::from_secs(16));
        assert_eq!(p.backoff_delay(6), Duration::from_secs(30));
        assert_eq!(p.backoff_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_linear_backoff() {
        let p = policy(BackoffMode::Linear);
        assert_eq!(p.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(p.backoff_delay(3), Duration::from_secs(3));
        assert_eq!(p.backoff_delay(31), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_extremes() {
        let p = policy(BackoffMode::Exponential).with_jitter(0.5);
        let d = Duration::from_secs(4);
        assert_eq!(p.apply_jitter(d, 0.0), Duration::from_secs(3));
        assert_eq!(p.apply_jitter(d, 0.5), d);
        assert_eq!(p.apply_jitter(d, 1.0), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_bounds_random() {
        let p = policy(BackoffMode::Exponential).with_jitter(0.4);
        let base = p.backoff_delay(3);
        let low = base.mul_f64(0.8);
        let high = base.mul_f64(1.2);
        for _ in 0..500 {
            let d = p.delay_for_retry(3);
            assert!(d >= low && d <= high, "{d:?} outside [{low:?}, {high:?}]");
        }
    }

    #[test]
    fn test_jitter_saturates_at_max_duration() {
        let p = RetryPolicy {
            retry_count: 3,
            base_delay: Duration::MAX,
            max_delay: Duration::MAX,
            jitter_factor: 1.0,
            backoff: BackoffMode::Exponential,
        };
        assert!(p.validate().is_ok());
        assert_eq!(p.apply_jitter(Duration::MAX, 1.0), Duration::MAX);
        assert!(p.apply_jitter(Duration::MAX, 0.0) <= Duration::MAX);
        for retry in 1..=3 {
            let _ = p.delay_for_retry(retry);
        }
    }

    #[test]
    fn test_policy_validation() {
        assert!(policy(BackoffMode::Linear).validate().is_ok());
        let mut bad = policy(BackoffMode::Linear);
        bad.jitter_factor = 1.5;
        assert!(bad.validate().is_err());
        let bad = policy(BackoffMode::Linear).with_max_delay(Duration::from_millis(10));
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_classify_order() {
        let ctx = OperationContext::new("delete_task");

        let denied = SchedulerError::from(NativeError::new(NativeErrorKind::AccessDenied, "0x80070005"));
        assert!(matches!(
            classify(denied, &ctx),
            Verdict::Stop(SchedulerError::PermissionDenied { .. })
        ));

        let io = SchedulerError::from(NativeError::new(NativeErrorKind::Io, "disk"));
        assert!(matches!(classify(io, &ctx), Verdict::Retry(_)));

        let interop = SchedulerError::from(NativeError::new(NativeErrorKind::InteropFailure, "rpc"));
        assert!(matches!(
            classify(interop, &ctx),
            Verdict::Retry(SchedulerError::Generic { .. })
        ));

        let disposed = SchedulerError::from(NativeError::new(NativeErrorKind::UseAfterDispose, "gone"));
        assert!(matches!(classify(disposed, &ctx), Verdict::Retry(_)));

        let other = SchedulerError::from(NativeError::new(NativeErrorKind::Other, "0x8004130F"));
        assert!(matches!(
            classify(other, &ctx),
            Verdict::Stop(SchedulerError::Generic { .. })
        ));

        let gone = SchedulerError::from(NativeError::new(NativeErrorKind::NotFound, "ghost"));
        assert!(matches!(
            classify(gone, &ctx),
            Verdict::Stop(SchedulerError::NotFound { .. })
        ));

        let missing = SchedulerError::NotFound {
            message: "no such task".into(),
            context: OperationContext::default(),
        };
        match classify(missing, &ctx) {
            Verdict::Stop(SchedulerError::NotFound { context, .. }) => assert_eq!(context, ctx),
            _ => panic!("not found should stop with context"),
        }
    }
}
