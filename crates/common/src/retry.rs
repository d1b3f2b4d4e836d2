//! Guarded calls and backoff.
//!
//! Sink adapters and lease stores talk to remote systems. Every call made
//! while a record is being ingested runs under [`watchdog`] so a hung
//! request cannot pin a worker, and so shutdown is observed promptly.
//! The caller's error type survives untouched inside [`RetryOutcome`].
//!
//! # Key Components
//!
//! - [`RetryPolicy`]: exponential backoff with jitter
//! - [`watchdog`]: one call bounded by a timeout and a cancellation token
//! - [`RetryOutcome`]: failure type preserving the caller's error

use std::borrow::Cow;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Retry Outcome
// =============================================================================

/// Outcome of a guarded operation that did not succeed.
///
/// Generic over `E` so callers keep their native error type.
#[derive(Debug)]
pub enum RetryOutcome<E> {
    /// Operation was cancelled via the cancellation token.
    Cancelled,

    /// The call exceeded its time budget.
    Timeout {
        /// Label identifying which operation timed out.
        action: Cow<'static, str>,
    },

    /// The operation itself returned an error.
    Failed(E),
}

impl<E: Display> Display for RetryOutcome<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Timeout { action } => write!(f, "timeout: {}", action),
            Self::Failed(e) => write!(f, "{}", e),
        }
    }
}

impl<E: Display + std::fmt::Debug> std::error::Error for RetryOutcome<E> {}

// =============================================================================
// Retry Policy
// =============================================================================

/// Exponential backoff policy with jitter.
///
/// The backoff doubles after each call to [`RetryPolicy::next_backoff`]
/// (capped at `max`), with random jitter so a fleet of workers that lost
/// the bus at the same moment does not reconnect in lockstep.
///
/// ```
/// use common::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let mut policy = RetryPolicy::new(
///     Duration::from_millis(100),
///     Duration::from_secs(5),
///     0.0,
/// );
/// assert_eq!(policy.next_backoff(), Duration::from_millis(100));
/// assert_eq!(policy.next_backoff(), Duration::from_millis(200));
/// ```
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Initial backoff interval.
    pub initial: Duration,

    /// Maximum backoff interval (caps exponential growth).
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0), applied as ±jitter to the backoff.
    pub jitter: f64,

    current_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(30),
            jitter: 0.2,
            current_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with custom parameters.
    ///
    /// `jitter` is clamped to `0.0..=1.0`.
    pub fn new(
        initial: Duration,
        max: Duration,
        jitter: f64,
    ) -> Self {
        Self {
            initial,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            current_backoff: initial,
        }
    }

    /// Get next backoff duration and advance internal state.
    pub fn next_backoff(&mut self) -> Duration {
        let current = self.current_backoff;

        self.current_backoff = current.saturating_mul(2).min(self.max);

        if self.jitter > 0.0 {
            let jitter_range = -self.jitter..self.jitter;
            let jitter_factor = 1.0 + rand::rng().random_range(jitter_range);
            current.mul_f64(jitter_factor).max(Duration::from_nanos(1))
        } else {
            current
        }
    }

    /// Reset backoff to initial value after a successful operation.
    pub fn reset(&mut self) {
        self.current_backoff = self.initial;
    }
}

// =============================================================================
// Watchdog
// =============================================================================

/// Run `op` once, bounded by `timeout_duration` and `cancel`.
///
/// Cancellation wins over completion when both are ready.
pub async fn watchdog<T, E, Fut>(
    op: Fut,
    timeout_duration: Duration,
    cancel: &CancellationToken,
    label: &'static str,
) -> Result<T, RetryOutcome<E>>
where
    E: Display,
    Fut: Future<Output = Result<T, E>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RetryOutcome::Cancelled),
        result = timeout(timeout_duration, op) => {
            match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(RetryOutcome::Failed(e)),
                Err(_) => Err(RetryOutcome::Timeout {
                    action: Cow::Borrowed(label),
                }),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
