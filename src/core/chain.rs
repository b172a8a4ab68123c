//! Sequential composition with short-circuiting
//!
//! A [`Chain`] is an ordered list of step factories. Each factory receives the
//! values bound by the steps before it and returns the outcome of the next
//! operation. Factories run one at a time: step N is only constructed after step
//! N-1 resolved successfully, and the first error ends the chain.
//!
//! ```rust,no_run
//! use rust_async_pg::prelude::*;
//!
//! # fn demo(db: Database<Worker<PgBackend>>) -> Outcome<u64> {
//! let pool = db.clone();
//! Chain::new()
//!     .bind("tx", move |_| db.begin_async())
//!     .bind("updated", move |b| -> Result<Outcome<ResultSet>> {
//!         let tx = b.get::<Transaction<Worker<PgBackend>>>("tx")?;
//!         Ok(pool.execute_async(tx, "UPDATE stock SET qty = qty - 1"))
//!     })
//!     .finish(|b| Ok(b.get::<ResultSet>("updated")?.updated))
//! # }
//! ```

use super::error::{DatabaseError, Result};
use super::outcome::{Outcome, Promise};
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Anything a step factory may return
pub trait IntoOutcome<T> {
    fn into_outcome(self) -> Outcome<T>;
}

impl<T: Send + 'static> IntoOutcome<T> for Outcome<T> {
    fn into_outcome(self) -> Outcome<T> {
        self
    }
}

/// Lets a factory use `?` while reading its bindings
impl<T: Send + 'static> IntoOutcome<T> for Result<Outcome<T>> {
    fn into_outcome(self) -> Outcome<T> {
        match self {
            Ok(outcome) => outcome,
            Err(err) => Outcome::failed(err),
        }
    }
}

struct Bound {
    value: Box<dyn Any + Send>,
    type_name: &'static str,
}

/// Values produced by named steps, visible to every later step
#[derive(Default)]
pub struct Bindings {
    values: HashMap<String, Bound>,
}

impl Bindings {
    /// Borrow a bound value
    pub fn get<T: Any>(&self, name: &str) -> Result<&T> {
        let bound = self
            .values
            .get(name)
            .ok_or_else(|| DatabaseError::unbound(name))?;
        bound
            .value
            .downcast_ref::<T>()
            .ok_or_else(|| DatabaseError::type_mismatch(type_name::<T>(), bound.type_name))
    }

    /// Move a bound value out
    pub fn take<T: Any>(&mut self, name: &str) -> Result<T> {
        let bound = self
            .values
            .remove(name)
            .ok_or_else(|| DatabaseError::unbound(name))?;
        let actual = bound.type_name;
        match bound.value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => {
                self.values.insert(
                    name.to_string(),
                    Bound {
                        value,
                        type_name: actual,
                    },
                );
                Err(DatabaseError::type_mismatch(type_name::<T>(), actual))
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn insert(&mut self, name: String, bound: Bound) {
        self.values.insert(name, bound);
    }
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.values.iter().map(|(k, v)| (k, v.type_name)))
            .finish()
    }
}

type Step = Box<dyn FnOnce(&Bindings) -> Outcome<Bound> + Send>;

/// Ordered list of outcome-producing steps
#[must_use = "a Chain does nothing until finish is called"]
#[derive(Default)]
pub struct Chain {
    steps: Vec<(Option<String>, Step)>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step whose value is bound under `name`
    ///
    /// Binding an existing name replaces the earlier value for later steps.
    pub fn bind<T, S, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        T: Send + 'static,
        S: IntoOutcome<T>,
        F: FnOnce(&Bindings) -> S + Send + 'static,
    {
        self.steps.push((Some(name.into()), erase(factory)));
        self
    }

    /// Add a step whose value is discarded
    pub fn step<T, S, F>(mut self, factory: F) -> Self
    where
        T: Send + 'static,
        S: IntoOutcome<T>,
        F: FnOnce(&Bindings) -> S + Send + 'static,
    {
        self.steps.push((None, erase(factory)));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the steps, then evaluate `finish` with every binding in scope
    ///
    /// Resolves with the first step error, or with the result of `finish`.
    pub fn finish<R, F>(self, finish: F) -> Outcome<R>
    where
        R: Send + 'static,
        F: FnOnce(Bindings) -> Result<R> + Send + 'static,
    {
        let (promise, outcome) = Outcome::pending();
        advance(
            self.steps.into_iter().enumerate(),
            Bindings::default(),
            promise,
            finish,
        );
        outcome
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field(
                "steps",
                &self
                    .steps
                    .iter()
                    .map(|(name, _)| name.as_deref().unwrap_or("_"))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn erase<T, S, F>(factory: F) -> Step
where
    T: Send + 'static,
    S: IntoOutcome<T>,
    F: FnOnce(&Bindings) -> S + Send + 'static,
{
    Box::new(move |bindings| {
        factory(bindings).into_outcome().map(|value| Bound {
            value: Box::new(value),
            type_name: type_name::<T>(),
        })
    })
}

type Steps = std::iter::Enumerate<std::vec::IntoIter<(Option<String>, Step)>>;

fn advance<R, F>(mut steps: Steps, mut bindings: Bindings, promise: Promise<R>, finish: F)
where
    R: Send + 'static,
    F: FnOnce(Bindings) -> Result<R> + Send + 'static,
{
    // Steps that are already resolved are consumed in place; only a pending step
    // suspends the chain
    loop {
        let Some((index, (name, step))) = steps.next() else {
            promise.resolve(finish(bindings));
            return;
        };

        let result = match step(&bindings).try_take() {
            Ok(result) => result,
            Err(pending) => {
                pending.on_complete(move |result| {
                    if let Some(bindings) = record(index, name, result, bindings, &promise) {
                        advance(steps, bindings, promise, finish);
                    }
                });
                return;
            }
        };

        match record(index, name, result, bindings, &promise) {
            Some(next) => bindings = next,
            None => return,
        }
    }
}

/// Bind a step result, or end the chain with its error
fn record<R: Send + 'static>(
    index: usize,
    name: Option<String>,
    result: Result<Bound>,
    mut bindings: Bindings,
    promise: &Promise<R>,
) -> Option<Bindings> {
    match result {
        Ok(bound) => {
            if let Some(name) = name {
                bindings.insert(name, bound);
            }
            Some(bindings)
        }
        Err(err) => {
            debug!(step = index, error = %err, "chain short-circuited");
            promise.resolve(Err(err));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn later<T: Send + 'static>(value: Result<T>) -> Outcome<T> {
        let (promise, outcome) = Outcome::pending();
        thread::spawn(move || {
            promise.resolve(value);
        });
        outcome
    }

    #[test]
    fn test_bindings_flow_into_later_steps() {
        let result = Chain::new()
            .bind("a", |_| Outcome::ok(2i64))
            .bind("b", |b| -> Result<Outcome<i64>> {
                let a = *b.get::<i64>("a")?;
                Ok(later(Ok(a * 10)))
            })
            .finish(|b| Ok(b.get::<i64>("a")? + b.get::<i64>("b")?))
            .wait()
            .unwrap();

        assert_eq!(result, 22);
    }

    #[test]
    fn test_first_error_stops_the_chain() {
        let built = Arc::new(AtomicUsize::new(0));
        let after = Arc::clone(&built);
        let finished = Arc::new(AtomicUsize::new(0));
        let finish_count = Arc::clone(&finished);

        let err = Chain::new()
            .step(|_| Outcome::ok(()))
            .step(|_| later::<()>(Err(DatabaseError::driver_message("step 2 failed"))))
            .step(move |_| {
                after.fetch_add(1, Ordering::SeqCst);
                Outcome::<()>::failed(DatabaseError::PoolClosed)
            })
            .finish(move |_| {
                finish_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .wait()
            .unwrap_err();

        assert_eq!(err.to_string(), "Driver error: step 2 failed");
        assert_eq!(built.load(Ordering::SeqCst), 0);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unbound_and_mistyped_names() {
        let err = Chain::new()
            .bind("x", |_| Outcome::ok(1i32))
            .finish(|b| b.get::<i32>("y").copied())
            .wait()
            .unwrap_err();
        assert!(matches!(err, DatabaseError::UnboundName(ref n) if n == "y"));

        let err = Chain::new()
            .bind("x", |_| Outcome::ok(1i32))
            .finish(|b| b.get::<String>("x").cloned())
            .wait()
            .unwrap_err();
        assert!(matches!(err, DatabaseError::TypeMismatch { .. }));
    }

    #[test]
    fn test_take_moves_value() {
        let value = Chain::new()
            .bind("s", |_| Outcome::ok(String::from("moved")))
            .finish(|mut b| {
                let s = b.take::<String>("s")?;
                assert!(!b.contains("s"));
                Ok(s)
            })
            .wait()
            .unwrap();
        assert_eq!(value, "moved");
    }

    #[test]
    fn test_long_chain_of_ready_steps() {
        let mut chain = Chain::new();
        for i in 0..100_000u32 {
            chain = if i % 2 == 0 {
                chain.step(|_| Outcome::ok(()))
            } else {
                chain.bind("last", move |_| -> Result<Outcome<u32>> { Ok(Outcome::ok(i)) })
            };
        }

        let last = chain
            .finish(|b| Ok(*b.get::<u32>("last")?))
            .wait()
            .unwrap();
        assert_eq!(last, 99_999);
    }

    #[test]
    fn test_ready_and_pending_steps_interleave() {
        let mut chain = Chain::new();
        for i in 0..2_000u64 {
            chain = chain.bind("n", move |b| {
                let prev = b.get::<u64>("n").copied().unwrap_or(0);
                if i % 500 == 0 {
                    later(Ok(prev + 1))
                } else {
                    Outcome::ok(prev + 1)
                }
            });
        }
        let n = chain.finish(|b| Ok(*b.get::<u64>("n")?)).wait().unwrap();
        assert_eq!(n, 2_000);
    }

    #[test]
    fn test_empty_chain_runs_finish() {
        let chain = Chain::new();
        assert!(chain.is_empty());
        let value = chain.finish(|b| Ok(b.len())).wait().unwrap();
        assert_eq!(value, 0);
    }

    #[tokio::test]
    async fn test_chain_is_awaitable() {
        let value = Chain::new()
            .bind("n", |_| later(Ok(5u8)))
            .finish(|b| Ok(*b.get::<u8>("n")?))
            .await
            .unwrap();
        assert_eq!(value, 5);
    }
}
