//! Cooperative cancellation and single-flight memoization for Gantry.
//!
//! Every blocking operation in the workspace engine takes a [`CancellationToken`]. Derived
//! results are memoized in [`Promise`]s, which run their producer at most once per successful
//! outcome; a cancelled producer leaves the promise ready to be retried.

mod promise;
mod sync;
mod watchdog;

use std::time::Duration;

pub use promise::Promise;
pub use sync::{Latch, Semaphore, SemaphorePermit};
pub use tokio_util::sync::CancellationToken;
pub use watchdog::run_with_timeout;

/// How often blocking waits re-check their cancellation token.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The distinguished error returned when work observes a cancelled token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

impl Cancelled {
    /// Returns `Err(Cancelled)` if `token` has been cancelled.
    #[inline]
    pub fn check(token: &CancellationToken) -> Result<(), Cancelled> {
        if token.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,
    #[error("task exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
    #[error("task panicked")]
    Panicked,
    #[error("failed to spawn task thread: {0}")]
    Spawn(String),
}

impl From<Cancelled> for TaskError {
    fn from(_: Cancelled) -> Self {
        TaskError::Cancelled
    }
}
