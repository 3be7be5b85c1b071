#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kg-net** – Shared transient-failure handling for outbound HTTP calls.
//!
//! The vector store adapter (C3), graph store adapter (C4), and the
//! enrichment orchestrator's intelligence/stamping clients (C5) all retry
//! transient failures with the same exponential backoff policy and all
//! guard the intelligence-service client with the same circuit breaker.
//! This crate owns that shared behaviour so the three call sites can't
//! drift apart.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

//─────────────────────────────
//  Retry policy
//─────────────────────────────

/// Exponential backoff policy for transient failures.
///
/// Default: base 250ms, factor 2, cap 8s, max 5 attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub factor: f64,
    /// Maximum delay between attempts.
    pub cap: Duration,
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            factor: 2.0,
            cap: Duration::from_secs(8),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before attempt number `attempt` (0-indexed, so
    /// `attempt == 0` is the delay before the *first* retry).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64()))
    }
}

/// Outcome of a classification callback: whether a failure should be
/// retried or treated as fatal immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network/timeout-style failure, eligible for retry.
    Transient,
    /// Structural failure (dimension mismatch, constraint violation, 4xx).
    /// Never retried.
    Fatal,
}

/// Retry `op` according to `policy`, classifying each error with
/// `classify`. Stops as soon as `op` succeeds, a fatal error is seen, or
/// `max_attempts` is exhausted.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    mut classify: impl FnMut(&E) -> FailureClass,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify(&err);
                attempt += 1;
                if class == FailureClass::Fatal || attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt - 1);
                debug!(attempt, ?delay, "retrying after transient failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

//─────────────────────────────
//  Circuit breaker
//─────────────────────────────

/// Current state of a [`CircuitBreaker`], exposed for `/ready` reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected until the open window elapses.
    Open,
    /// A single probe request is allowed through to test recovery.
    HalfOpen,
}

/// Circuit breaker guarding the intelligence-service HTTP client.
///
/// Opens after `failure_threshold` consecutive failures, allows a single
/// half-open probe after `open_duration`, and closes again on one success.
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_duration: Duration,
    consecutive_failures: AtomicU32,
    opened_at_millis: AtomicU64,
    state: Mutex<BreakerState>,
    clock: Box<dyn Fn() -> Duration + Send + Sync>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failure_threshold", &self.failure_threshold)
            .field("open_duration", &self.open_duration)
            .finish()
    }
}

fn monotonic_millis() -> Duration {
    use std::time::Instant;
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed()
}

impl CircuitBreaker {
    /// Construct a breaker with the default thresholds: 5 consecutive
    /// failures to open, 30s before a half-open probe is allowed.
    pub fn new() -> Self {
        Self::with_config(5, Duration::from_secs(30))
    }

    /// Construct a breaker with explicit thresholds, for tests.
    pub fn with_config(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold,
            open_duration,
            consecutive_failures: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
            state: Mutex::new(BreakerState::Closed),
            clock: Box::new(monotonic_millis),
        }
    }

    /// Current state, accounting for open→half-open transitions that are
    /// purely time-based (no request needs to arrive to trigger them).
    pub fn state(&self) -> BreakerState {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        if *state == BreakerState::Open {
            let opened_at = Duration::from_millis(self.opened_at_millis.load(Ordering::Relaxed));
            if (self.clock)().saturating_sub(opened_at) >= self.open_duration {
                *state = BreakerState::HalfOpen;
            }
        }
        *state
    }

    /// Whether a new request is allowed to proceed.
    pub fn allow_request(&self) -> bool {
        !matches!(self.state(), BreakerState::Open)
    }

    /// Record a successful call. Closes the breaker unconditionally.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.state.lock().expect("circuit breaker mutex poisoned") = BreakerState::Closed;
    }

    /// Record a failed call, opening the breaker once the threshold is hit.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let currently_half_open = self.state() == BreakerState::HalfOpen;
        if currently_half_open || failures >= self.failure_threshold {
            self.opened_at_millis
                .store((self.clock)().as_millis() as u64, Ordering::Relaxed);
            *self.state.lock().expect("circuit breaker mutex poisoned") = BreakerState::Open;
            warn!(failures, "circuit breaker opened");
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Flaky {
        fail_times: u32,
        calls: u32,
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let mut flaky = Flaky {
            fail_times: 2,
            calls: 0,
        };
        let policy = RetryPolicy {
            base: Duration::from_millis(1),
            factor: 1.0,
            cap: Duration::from_millis(5),
            max_attempts: 5,
        };
        let result: Result<u32, &'static str> = retry(
            policy,
            |_| FailureClass::Transient,
            || {
                flaky.calls += 1;
                let succeed = flaky.calls > flaky.fail_times;
                async move {
                    if succeed {
                        Ok(42)
                    } else {
                        Err("boom")
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn retry_stops_immediately_on_fatal_error() {
        let mut calls = 0u32;
        let policy = RetryPolicy::default();
        let result: Result<(), &'static str> = retry(
            policy,
            |_| FailureClass::Fatal,
            || {
                calls += 1;
                async { Err("dimension mismatch") }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn breaker_opens_after_threshold_and_closes_on_success() {
        let breaker = CircuitBreaker::with_config(3, Duration::from_secs(30));
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow_request());
    }
}
