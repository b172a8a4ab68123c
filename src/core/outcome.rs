//! Single-assignment outcomes and the callback-to-future adaptation
//!
//! An [`Outcome`] holds exactly one `Result<T>` once resolved. It can be observed
//! three ways, each consuming it:
//!
//! - [`Outcome::on_complete`] registers a callback, run immediately if the outcome is
//!   already resolved, otherwise on whichever thread resolves it;
//! - `.await`, since `Outcome<T>` implements [`Future`];
//! - [`Outcome::wait`] blocks the calling thread.
//!
//! [`Outcome::from_callbacks`] turns any `perform(args.., on_success, on_error)` style
//! operation into one that returns an outcome.

use super::error::{DatabaseError, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tracing::warn;

/// Success continuation of a callback-completing operation
pub type OnSuccess<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Error continuation of a callback-completing operation
pub type OnError = Box<dyn FnOnce(DatabaseError) + Send + 'static>;

type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

enum State<T> {
    Pending {
        waker: Option<Waker>,
        callback: Option<Callback<T>>,
    },
    Ready(Result<T>),
    Observed,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// Read half: an eventual `Result<T>`
#[must_use = "an Outcome does nothing unless observed"]
pub struct Outcome<T> {
    shared: Arc<Shared<T>>,
}

/// Write half: resolves the paired [`Outcome`]
///
/// Dropping a promise that was never resolved resolves its outcome with a
/// connection error, so observers are never left waiting.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Outcome<T> {
    /// Create an unresolved outcome and the promise that resolves it
    pub fn pending() -> (Promise<T>, Outcome<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Pending {
                waker: None,
                callback: None,
            }),
            ready: Condvar::new(),
        });
        (
            Promise {
                shared: Arc::clone(&shared),
            },
            Outcome { shared },
        )
    }

    /// An outcome that is already resolved
    pub fn ready(result: Result<T>) -> Self {
        Outcome {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Ready(result)),
                ready: Condvar::new(),
            }),
        }
    }

    /// An outcome already resolved with a value
    pub fn ok(value: T) -> Self {
        Self::ready(Ok(value))
    }

    /// An outcome already resolved with an error
    pub fn failed(err: DatabaseError) -> Self {
        Self::ready(Err(err))
    }

    /// Adapt a callback-completing operation
    ///
    /// `perform` is invoked once, immediately, with a success and an error
    /// continuation. Whichever fires first resolves the outcome; a second firing is
    /// logged and ignored. This never blocks the caller.
    pub fn from_callbacks<F>(perform: F) -> Self
    where
        F: FnOnce(OnSuccess<T>, OnError),
    {
        let (promise, outcome) = Self::pending();
        let promise = Arc::new(promise);
        let error_promise = Arc::clone(&promise);
        perform(
            Box::new(move |value| {
                promise.resolve(Ok(value));
            }),
            Box::new(move |err| {
                error_promise.resolve(Err(err));
            }),
        );
        outcome
    }

    /// Check whether a result is available without consuming the outcome
    pub fn is_ready(&self) -> bool {
        matches!(*self.shared.state.lock(), State::Ready(_))
    }

    /// Take the result if already resolved, otherwise hand the outcome back
    pub(crate) fn try_take(self) -> std::result::Result<Result<T>, Self> {
        let mut state = self.shared.state.lock();
        match std::mem::replace(&mut *state, State::Observed) {
            State::Ready(result) => Ok(result),
            other => {
                *state = other;
                drop(state);
                Err(self)
            }
        }
    }

    /// Register the completion callback
    ///
    /// Runs synchronously when already resolved, otherwise on the resolving thread.
    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        match std::mem::replace(&mut *state, State::Observed) {
            State::Ready(result) => {
                drop(state);
                callback(result);
            }
            State::Pending { waker, .. } => {
                *state = State::Pending {
                    waker,
                    callback: Some(Box::new(callback)),
                };
            }
            State::Observed => {
                drop(state);
                warn!("completion callback registered on an already observed outcome; dropped");
            }
        }
    }

    /// Block the current thread until the outcome resolves
    ///
    /// Do not call this from the pool's own worker thread or from inside an async
    /// runtime; `.await` the outcome there instead.
    pub fn wait(self) -> Result<T> {
        let mut state = self.shared.state.lock();
        loop {
            if matches!(*state, State::Ready(_)) {
                if let State::Ready(result) = std::mem::replace(&mut *state, State::Observed) {
                    return result;
                }
            }
            self.shared.ready.wait(&mut state);
        }
    }

    /// Transform the success value
    pub fn map<U, F>(self, f: F) -> Outcome<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.and_then(move |value| Ok(f(value)))
    }

    /// Transform the success value with a fallible function
    pub fn and_then<U, F>(self, f: F) -> Outcome<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let (promise, outcome) = Outcome::pending();
        self.on_complete(move |result| {
            promise.resolve(result.and_then(f));
        });
        outcome
    }

    /// Start another outcome-producing operation once this one succeeds
    pub fn then<U, F>(self, f: F) -> Outcome<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Outcome<U> + Send + 'static,
    {
        let (promise, outcome) = Outcome::pending();
        self.on_complete(move |result| match result.map(f) {
            Ok(next) => match next.try_take() {
                Ok(ready) => {
                    promise.resolve(ready);
                }
                Err(pending) => pending.on_complete(move |next| {
                    promise.resolve(next);
                }),
            },
            Err(err) => {
                promise.resolve(Err(err));
            }
        });
        outcome
    }
}

impl<T> Future for Outcome<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        match &mut *state {
            State::Pending { waker, .. } => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            State::Ready(_) => match std::mem::replace(&mut *state, State::Observed) {
                State::Ready(result) => Poll::Ready(result),
                _ => unreachable!("state checked above"),
            },
            State::Observed => panic!("Outcome polled after completion"),
        }
    }
}

impl<T> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.shared.state.lock() {
            State::Pending { .. } => "pending",
            State::Ready(_) => "ready",
            State::Observed => "observed",
        };
        f.debug_struct("Outcome").field("state", &state).finish()
    }
}

impl<T> Promise<T> {
    /// Resolve the paired outcome
    ///
    /// Returns `false`, leaving the outcome untouched, if it was already resolved.
    pub fn resolve(&self, result: Result<T>) -> bool {
        if self.settle(result) {
            true
        } else {
            warn!("outcome resolved more than once; later result discarded");
            false
        }
    }

    fn settle(&self, result: Result<T>) -> bool {
        let mut state = self.shared.state.lock();
        let pending = match &mut *state {
            State::Pending { waker, callback } => Some((waker.take(), callback.take())),
            _ => None,
        };
        let Some((waker, callback)) = pending else {
            return false;
        };

        match callback {
            Some(callback) => {
                *state = State::Observed;
                drop(state);
                callback(result);
            }
            None => {
                *state = State::Ready(result);
                drop(state);
                self.shared.ready.notify_all();
                if let Some(waker) = waker {
                    waker.wake();
                }
            }
        }
        true
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        self.settle(Err(DatabaseError::connection(
            "operation abandoned before completion",
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_callback_after_resolution_runs_immediately() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);

        Outcome::ok(7).on_complete(move |result| {
            *sink.lock() = Some(result.unwrap());
        });

        assert_eq!(*seen.lock(), Some(7));
    }

    #[test]
    fn test_callback_fires_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let (promise, outcome) = Outcome::<i32>::pending();
        outcome.on_complete(move |result| {
            assert_eq!(result.unwrap(), 1);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(promise.resolve(Ok(1)));
        assert!(!promise.resolve(Ok(2)));
        assert!(!promise.resolve(Err(DatabaseError::PoolClosed)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_from_callbacks_first_wins() {
        let outcome = Outcome::<&'static str>::from_callbacks(|on_success, on_error| {
            on_error(DatabaseError::driver_message("boom"));
            on_success("late");
        });

        let err = outcome.wait().unwrap_err();
        assert_eq!(err.to_string(), "Driver error: boom");
    }

    #[test]
    fn test_from_callbacks_dropped_continuations_resolve() {
        let outcome = Outcome::<()>::from_callbacks(|_on_success, _on_error| {});
        let err = outcome.wait().unwrap_err();
        assert!(matches!(err, DatabaseError::ConnectionError(_)));
    }

    #[test]
    fn test_wait_across_threads() {
        let (promise, outcome) = Outcome::pending();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            promise.resolve(Ok("done"));
        });

        assert_eq!(outcome.wait().unwrap(), "done");
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_await_outcome() {
        let (promise, outcome) = Outcome::pending();
        tokio::spawn(async move {
            promise.resolve(Ok(42u64));
        });

        assert_eq!(outcome.await.unwrap(), 42);
    }

    #[test]
    fn test_resolve_wakes_pending_task() {
        let (promise, outcome) = Outcome::pending();
        let mut task = tokio_test::task::spawn(outcome);
        tokio_test::assert_pending!(task.poll());

        promise.resolve(Ok(3));
        assert!(task.is_woken());
        assert_eq!(tokio_test::assert_ready!(task.poll()).unwrap(), 3);
    }

    #[test]
    fn test_callback_on_observed_outcome_is_dropped() {
        let mut outcome = Outcome::ok(5);
        let mut cx = Context::from_waker(futures_util::task::noop_waker_ref());
        assert!(matches!(Pin::new(&mut outcome).poll(&mut cx), Poll::Ready(Ok(5))));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        outcome.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_long_then_chain_on_ready_values() {
        let mut outcome = Outcome::ok(0u64);
        for _ in 0..100_000 {
            outcome = outcome.then(|v| Outcome::ok(v + 1));
        }
        assert_eq!(outcome.wait().unwrap(), 100_000);
    }

    #[test]
    fn test_map_and_then() {
        let doubled = Outcome::ok(21).map(|v| v * 2);
        assert_eq!(doubled.wait().unwrap(), 42);

        let failed = Outcome::ok(1).and_then(|_| -> Result<i32> {
            Err(DatabaseError::malformed("nope"))
        });
        assert!(matches!(
            failed.wait(),
            Err(DatabaseError::MalformedStatementSpec(_))
        ));
    }

    #[test]
    fn test_then_short_circuits() {
        let called = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&called);

        let outcome = Outcome::<i32>::failed(DatabaseError::PoolClosed).then(move |v| {
            counter.fetch_add(1, Ordering::SeqCst);
            Outcome::ok(v + 1)
        });

        assert!(matches!(outcome.wait(), Err(DatabaseError::PoolClosed)));
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }
}
