//! Retry pipelines with exponential backoff and jitter.
//!
//! Two policies matter in this layer and both are built from the same
//! [`RetryPolicy`] type:
//!
//! - the **publish pipeline** ([`RetryPolicy::publish`]): few attempts, short
//!   delays, an overall timeout. It wraps one "send this payload to this
//!   destination" call. On exhaustion the terminal failure surfaces to the
//!   caller — the relay marks the record failed; durability already happened
//!   at outbox-append time, so nothing is lost.
//! - the **connection pipeline** ([`RetryPolicy::connect`]): more patient —
//!   more attempts, larger base delay, a hard cap on the per-attempt delay.
//!   Used lazily, whenever a connection must be (re-)established, and only
//!   for errors classified transient.
//!
//! Delays grow exponentially from the base and are multiplied by random
//! jitter so that a fleet of instances does not retry in lockstep.
//!
//! # Example
//!
//! ```rust
//! use steadfast_runtime::retry::{RetryPolicy, retry_with_backoff};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::publish();
//!
//! let value = retry_with_backoff(&policy, || async {
//!     Ok::<_, String>(42)
//! }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Terminal outcome of a retry pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError<E: fmt::Display> {
    /// Every attempt in the budget failed; carries the last error seen.
    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last_error: E,
    },

    /// The overall timeout elapsed before any attempt succeeded.
    #[error("operation timed out after {timeout:?}")]
    TimedOut {
        /// The configured overall timeout.
        timeout: Duration,
    },

    /// The error was classified non-retryable and propagated immediately.
    #[error("permanent failure, not retried: {0}")]
    Permanent(E),

    /// Shutdown was signalled before the budget was spent; no further
    /// attempts were scheduled. Carries the last error seen.
    #[error("shut down after {attempts} attempts: {last_error}")]
    Interrupted {
        /// Number of attempts made before shutdown.
        attempts: u32,
        /// The error from the final attempt.
        last_error: E,
    },
}

impl<E: fmt::Display> PipelineError<E> {
    /// The underlying error, if one was captured.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted { last_error, .. } | Self::Interrupted { last_error, .. } => {
                Some(last_error)
            }
            Self::Permanent(e) => Some(e),
            Self::TimedOut { .. } => None,
        }
    }
}

/// Retry policy: bounded attempts, exponential backoff, jitter, optional
/// overall timeout.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (so 3 means "try, retry twice").
    max_attempts: u32,
    /// Delay before the first retry.
    initial_delay: Duration,
    /// Hard cap on any single inter-attempt delay.
    max_delay: Duration,
    /// Exponential growth factor.
    multiplier: f64,
    /// Whether to jitter each delay (on for everything but tests that need
    /// exact delays).
    jitter: bool,
    /// Deadline for the whole pipeline, all attempts and sleeps included.
    overall_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Policy for one broker publish: 3 attempts, 200 ms base delay, 5 s
    /// delay cap, 10 s overall timeout.
    #[must_use]
    pub const fn publish() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
            overall_timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Policy for (re-)establishing broker connectivity: 10 attempts, 1 s
    /// base delay, 30 s delay cap, no overall timeout.
    #[must_use]
    pub const fn connect() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            overall_timeout: None,
        }
    }

    /// Policy for in-process handler retries inside the consumer: 3
    /// attempts, 100 ms base delay.
    #[must_use]
    pub const fn handler() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
            overall_timeout: None,
        }
    }

    /// Set total attempts (including the first).
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the hard cap on any single inter-attempt delay.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the exponential growth factor.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set or clear the overall timeout.
    #[must_use]
    pub const fn with_overall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.overall_timeout = timeout;
        self
    }

    /// Total attempts in the budget.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retrying after failed attempt number `attempt`
    /// (0-indexed).
    ///
    /// `delay = min(initial * multiplier^attempt, max_delay)`, then
    /// multiplied by a random factor in `0.5..=1.0` when jitter is on.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        use rand::Rng;

        // max_attempts is small, the cast cannot wrap in practice.
        #[allow(clippy::cast_possible_wrap)]
        let exponential =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());

        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            1.0
        };

        Duration::from_secs_f64(capped * factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::publish()
    }
}

/// Retry an async operation under a policy, treating every error as
/// retryable.
///
/// # Errors
///
/// Returns [`PipelineError::Exhausted`] when the attempt budget is spent,
/// or [`PipelineError::TimedOut`] when the policy's overall timeout elapses
/// first.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, PipelineError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    run(policy, operation, |_| true, None).await
}

/// Retry an async operation, consulting `is_retryable` before each retry.
///
/// A non-retryable error surfaces immediately as
/// [`PipelineError::Permanent`]. This is how the connection pipeline keeps
/// programming errors from being masked by patient reconnect loops.
///
/// # Errors
///
/// Returns [`PipelineError::Permanent`] for a non-retryable error,
/// [`PipelineError::Exhausted`] when the budget is spent, or
/// [`PipelineError::TimedOut`] when the overall timeout elapses.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation: F,
    is_retryable: P,
) -> Result<T, PipelineError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    run(policy, operation, is_retryable, None).await
}

/// Retry an async operation, stopping early when shutdown is signalled.
///
/// Shutdown is cooperative: an attempt already in flight finishes, but no
/// further attempt is scheduled afterwards.
///
/// # Errors
///
/// As [`retry_with_backoff`], plus [`PipelineError::Interrupted`] when
/// shutdown preempts the remaining budget.
pub async fn retry_with_backoff_until<F, Fut, T, E>(
    policy: &RetryPolicy,
    shutdown: &watch::Receiver<bool>,
    operation: F,
) -> Result<T, PipelineError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    run(policy, operation, |_| true, Some(shutdown.clone())).await
}

async fn run<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation: F,
    is_retryable: P,
    shutdown: Option<watch::Receiver<bool>>,
) -> Result<T, PipelineError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    match policy.overall_timeout {
        Some(timeout) => {
            match tokio::time::timeout(
                timeout,
                attempt_loop(policy, operation, is_retryable, shutdown),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(timeout_ms = timeout.as_millis(), "Retry pipeline timed out");
                    Err(PipelineError::TimedOut { timeout })
                }
            }
        }
        None => attempt_loop(policy, operation, is_retryable, shutdown).await,
    }
}

async fn attempt_loop<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
    shutdown: Option<watch::Receiver<bool>>,
) -> Result<T, PipelineError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                attempt += 1;

                if !is_retryable(&err) {
                    tracing::warn!(error = %err, "Error is not retryable, failing immediately");
                    return Err(PipelineError::Permanent(err));
                }

                if attempt >= policy.max_attempts {
                    tracing::error!(
                        attempts = attempt,
                        error = %err,
                        "Operation failed after max attempts"
                    );
                    return Err(PipelineError::Exhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }

                if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
                    tracing::info!(attempts = attempt, "Shutdown signalled, abandoning retries");
                    return Err(PipelineError::Interrupted {
                        attempts: attempt,
                        last_error: err,
                    });
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying"
                );

                match &shutdown {
                    Some(rx) => {
                        let mut rx = rx.clone();
                        tokio::select! {
                            () = sleep(delay) => {}
                            _ = rx.changed() => {
                                if *rx.borrow() {
                                    return Err(PipelineError::Interrupted {
                                        attempts: attempt,
                                        last_error: err,
                                    });
                                }
                            }
                        }
                    }
                    None => sleep(delay).await,
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn exact(policy: RetryPolicy) -> RetryPolicy {
        policy.with_jitter(false)
    }

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let policy = exact(
            RetryPolicy::publish()
                .with_initial_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(10)),
        );

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let policy = exact(
            RetryPolicy::connect()
                .with_initial_delay(Duration::from_secs(1))
                .with_multiplier(10.0)
                .with_max_delay(Duration::from_secs(2)),
        );

        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_within_envelope(attempt in 0u32..12) {
            let policy = RetryPolicy::connect();
            let delay = policy.delay_for_attempt(attempt);
            let ceiling = policy
                .delay_for_attempt_ceiling_for_tests(attempt);
            prop_assert!(delay <= ceiling);
            // Nanosecond rounding in from_secs_f64 allows a hair under 0.5x.
            prop_assert!(delay.as_secs_f64() >= ceiling.as_secs_f64() * 0.5 - 1e-6);
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_try() {
        let policy = RetryPolicy::publish();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = retry_with_backoff(&policy, || {
            let c = Arc::clone(&calls_clone);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::publish()
            .with_max_attempts(4)
            .with_initial_delay(Duration::from_millis(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = retry_with_backoff(&policy, || {
            let c = Arc::clone(&calls_clone);
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_budget_and_reports_attempts() {
        let policy = RetryPolicy::publish()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<i32, _> = retry_with_backoff(&policy, || {
            let c = Arc::clone(&calls_clone);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>("persistent failure")
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(PipelineError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_errors_skip_retries() {
        let policy = RetryPolicy::connect().with_initial_delay(Duration::from_millis(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<i32, _> = retry_with_predicate(
            &policy,
            || {
                let c = Arc::clone(&calls_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("schema mismatch")
                }
            },
            |err: &&str| err.contains("transient"),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(PipelineError::Permanent(_))));
    }

    #[tokio::test]
    async fn overall_timeout_preempts_remaining_attempts() {
        let policy = RetryPolicy::publish()
            .with_max_attempts(100)
            .with_initial_delay(Duration::from_millis(50))
            .with_jitter(false)
            .with_overall_timeout(Some(Duration::from_millis(120)));

        let result: Result<i32, _> = retry_with_backoff(&policy, || async {
            Err::<i32, _>("still down")
        })
        .await;

        assert!(matches!(result, Err(PipelineError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn shutdown_prevents_further_attempts() {
        let policy = RetryPolicy::connect()
            .with_max_attempts(50)
            .with_initial_delay(Duration::from_millis(200))
            .with_jitter(false);
        let (tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let handle = tokio::spawn(async move {
            retry_with_backoff_until(&policy, &rx, move || {
                let c = Arc::clone(&calls_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("broker down")
                }
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PipelineError::Interrupted { .. })));
        // The first attempt ran; the shutdown landed during the backoff
        // sleep, so no second attempt was scheduled.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

#[cfg(test)]
impl RetryPolicy {
    /// Un-jittered delay, used by property tests as the jitter envelope.
    fn delay_for_attempt_ceiling_for_tests(&self, attempt: u32) -> Duration {
        self.clone().with_jitter(false).delay_for_attempt(attempt)
    }
}
