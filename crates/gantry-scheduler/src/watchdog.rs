use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::{CancellationToken, TaskError};

/// Runs `f` on a dedicated named thread and waits up to `timeout` for it to finish.
///
/// If the timeout elapses, `cancel_token` is cancelled before returning. The worker thread cannot
/// be forcibly terminated, so the closure is expected to cooperate by checking the token it is
/// given. External tools (package loaders) are invoked through this to bound hangs.
pub fn run_with_timeout<T, F>(
    name: &str,
    timeout: Duration,
    cancel_token: CancellationToken,
    f: F,
) -> Result<T, TaskError>
where
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> T + Send + 'static,
{
    if cancel_token.is_cancelled() {
        return Err(TaskError::Cancelled);
    }

    let (tx, rx) = mpsc::channel::<Result<T, TaskError>>();
    let token_for_task = cancel_token.clone();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(token_for_task)))
                    .map_err(|_| TaskError::Panicked);
            let _ = tx.send(result);
        })
        .map_err(|err| TaskError::Spawn(err.to_string()))?;

    let deadline = Instant::now() + timeout;
    let poll_interval = Duration::from_millis(5);

    loop {
        if cancel_token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::warn!(
                target = "gantry.scheduler",
                task = name,
                timeout_ms = timeout.as_millis() as u64,
                "task exceeded deadline; cancelling"
            );
            cancel_token.cancel();
            return Err(TaskError::DeadlineExceeded(timeout));
        }

        match rx.recv_timeout(remaining.min(poll_interval)) {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => return Err(err),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => return Err(TaskError::Panicked),
        }
    }
}
