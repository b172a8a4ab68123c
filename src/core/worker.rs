//! Dedicated pool worker
//!
//! Each [`Worker`] owns one OS thread running a current-thread tokio runtime.
//! Every backend operation is spawned onto that runtime and its continuation is
//! invoked there, so completions for one pool never run concurrently with each
//! other. Callers only enqueue work; they are never blocked.

use super::error::{DatabaseError, Result};
use super::executor::{Backend, Executor, PoolStatus};
use super::outcome::{OnError, OnSuccess};
use super::value::{DatabaseValue, RawResultSet};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Pair of continuations that fires exactly once
///
/// Dropped without completing (the job was refused or cancelled), it reports
/// [`DatabaseError::PoolClosed`].
struct Completion<T> {
    on_success: Option<OnSuccess<T>>,
    on_error: Option<OnError>,
}

impl<T> Completion<T> {
    fn new(on_success: OnSuccess<T>, on_error: OnError) -> Self {
        Self {
            on_success: Some(on_success),
            on_error: Some(on_error),
        }
    }

    fn complete(mut self, result: Result<T>) {
        match result {
            Ok(value) => {
                self.on_error = None;
                if let Some(on_success) = self.on_success.take() {
                    on_success(value);
                }
            }
            Err(err) => {
                self.on_success = None;
                if let Some(on_error) = self.on_error.take() {
                    on_error(err);
                }
            }
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(on_error) = self.on_error.take() {
            on_error(DatabaseError::PoolClosed);
        }
    }
}

/// Runs a [`Backend`] on its own thread and exposes it as an [`Executor`]
pub struct Worker<B: Backend> {
    backend: Arc<B>,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl<B: Backend> Worker<B> {
    /// Start the worker thread
    pub fn spawn(backend: B) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let thread = thread::Builder::new()
            .name("pg-pool-worker".to_string())
            .spawn(move || {
                info!("pool worker started");
                runtime.block_on(async move {
                    let mut in_flight = JoinSet::new();
                    loop {
                        tokio::select! {
                            job = receiver.recv() => match job {
                                Some(job) => {
                                    in_flight.spawn(job);
                                }
                                None => break,
                            },
                            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                                if let Err(e) = joined {
                                    warn!(error = %e, "pool job aborted");
                                }
                            }
                        }
                    }
                    // Drain work accepted before close
                    while in_flight.join_next().await.is_some() {}
                });
                info!("pool worker stopped");
            })?;

        let thread_id = thread.thread().id();
        Ok(Self {
            backend: Arc::new(backend),
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
            thread_id,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// True once [`shutdown`](Self::shutdown) has run
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting work, finish in-flight jobs, then close the backend
    ///
    /// Called from the worker thread itself (inside a continuation) the thread is
    /// left to wind down on its own instead of being joined.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        debug!("pool worker shutting down");

        if let Some(handle) = self.thread.lock().take() {
            if thread::current().id() == self.thread_id {
                drop(handle);
            } else if handle.join().is_err() {
                warn!("pool worker thread panicked");
            }
        }
        self.backend.close();
    }

    fn dispatch<T, F, Fut>(&self, on_success: OnSuccess<T>, on_error: OnError, operation: F)
    where
        T: Send + 'static,
        F: FnOnce(Arc<B>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let completion = Completion::new(on_success, on_error);
        let Some(sender) = self.sender.lock().clone() else {
            completion.complete(Err(DatabaseError::PoolClosed));
            return;
        };

        let pending = operation(Arc::clone(&self.backend));
        let job: Job = Box::pin(async move {
            let result = pending.await;
            completion.complete(result);
        });

        // A refused job drops its completion, which reports PoolClosed
        if sender.send(job).is_err() {
            debug!("pool worker gone; job refused");
        }
    }
}

impl<B: Backend> Executor for Worker<B> {
    type Connection = B::Connection;

    fn query(
        &self,
        conn: Option<Self::Connection>,
        sql: String,
        params: Vec<DatabaseValue>,
        on_success: OnSuccess<RawResultSet>,
        on_error: OnError,
    ) {
        self.dispatch(on_success, on_error, move |backend| async move {
            backend.query(conn, &sql, &params).await
        });
    }

    fn begin(&self, on_success: OnSuccess<Self::Connection>, on_error: OnError) {
        self.dispatch(on_success, on_error, |backend| async move {
            backend.begin().await
        });
    }

    fn commit(&self, conn: Self::Connection, on_success: OnSuccess<()>, on_error: OnError) {
        self.dispatch(on_success, on_error, move |backend| async move {
            backend.commit(conn).await
        });
    }

    fn rollback(&self, conn: Self::Connection, on_success: OnSuccess<()>, on_error: OnError) {
        self.dispatch(on_success, on_error, move |backend| async move {
            backend.rollback(conn).await
        });
    }

    fn status(&self) -> PoolStatus {
        self.backend.status()
    }

    fn close(&self) {
        self.shutdown();
    }
}

impl<B: Backend> Drop for Worker<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
