//! Cancellable sleeps.
//!
//! Polling loops (lease waits, bus receive backoff) sleep between probes.
//! Each sleep must end early when the owning worker is shutting down so the
//! in-flight message is left unacknowledged and redelivered elsewhere.

use std::time::Duration;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sleep for `period` unless `cancel` fires first.
///
/// Returns `true` when the full period elapsed and `false` when the wait
/// was cut short by cancellation.
///
/// # Example
///
/// ```ignore
/// loop {
///     if !sleep_or_cancelled(&cancel, poll_interval).await {
///         return Err(LockError::Cancelled);
///     }
///     // probe again...
/// }
/// ```
pub async fn sleep_or_cancelled(
    cancel: &CancellationToken,
    period: Duration,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }

    select! {
        _ = cancel.cancelled() => {
            debug!(?period, "sleep interrupted by cancellation");
            false
        }
        _ = tokio::time::sleep(period) => true,
    }
}
