//! Shared async utilities for SchemaForge services.
//!
//! - **Watchdog**: bound a single sink or store call by a timeout and a
//!   cancellation token without converting the caller's error type
//! - **Backoff**: exponential backoff with jitter for bus receive failures
//! - **Cancellable waits**: fixed-interval sleeps that return early on
//!   shutdown, used by the lease polling loop
//!
//! # Quick Start
//!
//! ```ignore
//! use common::{RetryOutcome, watchdog};
//!
//! match watchdog(client.live_columns("T"), timeout, &cancel, "live_columns").await {
//!     Ok(cols) => { /* ... */ }
//!     Err(RetryOutcome::Cancelled) => return Err(IngestError::Cancelled),
//!     Err(other) => { /* timeout or the call's own error */ }
//! }
//! ```

pub mod pause;
pub mod retry;

// =============================================================================
// Cancellable Waits
// =============================================================================

pub use pause::sleep_or_cancelled;

// =============================================================================
// Retry Logic
// =============================================================================

pub use retry::{
    // Outcome types
    RetryOutcome,
    // Backoff configuration
    RetryPolicy,
    // Single guarded call
    watchdog,
};
