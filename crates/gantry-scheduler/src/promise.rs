use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{Cancelled, CancellationToken, POLL_INTERVAL};

/// A lazily computed, single-flight value.
///
/// The first caller of [`Promise::get`] runs its producer; concurrent callers block until that
/// producer finishes and then observe the same value. A producer that returns [`Cancelled`] (or
/// panics) is not memoized: the promise goes back to idle, one waiter takes over with its own
/// producer, and later callers may retry.
///
/// Clones share state, so a promise copied into a successor snapshot keeps its result.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    label: String,
    state: Mutex<State<T>>,
    done: Condvar,
}

enum State<T> {
    Idle,
    Running,
    Done(T),
}

impl<T: Clone> Promise<T> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                state: Mutex::new(State::Idle),
                done: Condvar::new(),
            }),
        }
    }

    /// A promise that already holds `value`.
    pub fn resolved(label: impl Into<String>, value: T) -> Self {
        let promise = Self::new(label);
        *promise.inner.state.lock() = State::Done(value);
        promise
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// The memoized value, if the producer has completed.
    pub fn peek(&self) -> Option<T> {
        match &*self.inner.state.lock() {
            State::Done(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Done(_))
    }

    /// Returns the memoized value, running `produce` if no other caller is computing it.
    pub fn get<F>(&self, token: &CancellationToken, produce: F) -> Result<T, Cancelled>
    where
        F: FnOnce(&CancellationToken) -> Result<T, Cancelled>,
    {
        {
            let mut state = self.inner.state.lock();
            loop {
                if let State::Done(value) = &*state {
                    return Ok(value.clone());
                }
                Cancelled::check(token)?;
                if matches!(*state, State::Running) {
                    self.inner.done.wait_for(&mut state, POLL_INTERVAL);
                    continue;
                }
                *state = State::Running;
                break;
            }
        }

        let mut reset = ResetOnUnwind {
            inner: &self.inner,
            armed: true,
        };
        let result = produce(token);
        reset.armed = false;

        let mut state = self.inner.state.lock();
        match result {
            Ok(value) => {
                *state = State::Done(value.clone());
                self.inner.done.notify_all();
                Ok(value)
            }
            Err(Cancelled) => {
                tracing::trace!(
                    target = "gantry.scheduler",
                    promise = %self.inner.label,
                    "producer cancelled; promise reset"
                );
                *state = State::Idle;
                self.inner.done.notify_all();
                Err(Cancelled)
            }
        }
    }
}

struct ResetOnUnwind<'a, T> {
    inner: &'a Inner<T>,
    armed: bool,
}

impl<T> Drop for ResetOnUnwind<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!(
                target = "gantry.scheduler",
                promise = %self.inner.label,
                "promise producer panicked"
            );
            *self.inner.state.lock() = State::Idle;
            self.inner.done.notify_all();
        }
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.lock() {
            State::Idle => "idle",
            State::Running => "running",
            State::Done(_) => "done",
        };
        f.debug_struct("Promise")
            .field("label", &self.inner.label)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn concurrent_callers_share_one_producer() {
        let promise: Promise<u32> = Promise::new("answer");
        let calls = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let promise = promise.clone();
                let calls = calls.clone();
                let start = start.clone();
                std::thread::spawn(move || {
                    start.wait();
                    promise.get(&CancellationToken::new(), |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        Ok(42)
                    })
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(promise.peek(), Some(42));
    }

    #[test]
    fn cancellation_is_not_memoized() {
        let promise: Promise<&'static str> = Promise::new("retry");
        let token = CancellationToken::new();
        assert_eq!(promise.get(&token, |_| Err(Cancelled)), Err(Cancelled));
        assert!(!promise.is_done());
        assert_eq!(promise.get(&token, |_| Ok("second")), Ok("second"));
        assert_eq!(promise.get(&token, |_| Ok("third")), Ok("second"));
    }

    #[test]
    fn cancelled_callers_do_not_start_work() {
        let promise: Promise<u8> = Promise::new("never");
        let token = CancellationToken::new();
        token.cancel();
        let result = promise.get(&token, |_| panic!("producer must not run"));
        assert_eq!(result, Err(Cancelled));
    }

    #[test]
    fn waiter_can_abandon_a_running_producer() {
        let promise: Promise<u8> = Promise::new("slow");
        let release = Arc::new(Barrier::new(2));
        let running = {
            let promise = promise.clone();
            let release = release.clone();
            std::thread::spawn(move || {
                promise.get(&CancellationToken::new(), |_| {
                    release.wait();
                    std::thread::sleep(Duration::from_millis(100));
                    Ok(1)
                })
            })
        };
        release.wait();

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                token.cancel();
            })
        };
        assert_eq!(promise.get(&token, |_| Ok(2)), Err(Cancelled));
        canceller.join().unwrap();
        assert_eq!(running.join().unwrap(), Ok(1));
        assert_eq!(promise.peek(), Some(1));
    }

    #[test]
    fn panicking_producer_resets_the_promise() {
        let promise: Promise<u8> = Promise::new("boom");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = promise.get(&CancellationToken::new(), |_| panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(promise.get(&CancellationToken::new(), |_| Ok(3)), Ok(3));
    }

    #[test]
    fn resolved_promises_never_run_producers() {
        let promise = Promise::resolved("ready", 7u8);
        assert_eq!(
            promise.get(&CancellationToken::new(), |_| panic!("unused")),
            Ok(7)
        );
    }
}
