//! Executor boundary
//!
//! [`Executor`] is the callback-completing surface of a connection pool: every
//! operation takes its arguments plus a success and an error continuation, and
//! returns immediately. [`Backend`] is the async trait a driver implements; a
//! [`Worker`](super::worker::Worker) turns any backend into an executor.

use super::error::Result;
use super::outcome::{OnError, OnSuccess};
use super::value::{DatabaseValue, RawResultSet};
use async_trait::async_trait;
use serde::Serialize;

/// Connection pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolStatus {
    /// Connections currently open
    pub size: usize,
    /// Open connections not borrowed by anyone
    pub available: usize,
    /// Upper bound on open connections
    pub max_size: usize,
}

impl PoolStatus {
    /// Connections currently borrowed
    pub fn in_use(&self) -> usize {
        self.size.saturating_sub(self.available)
    }
}

/// Callback-completing pool operations
///
/// Implementations must invoke exactly one of the two continuations for every
/// call, and must never block the calling thread.
pub trait Executor: Send + Sync + 'static {
    /// A borrowed connection; cloning shares the same borrow
    type Connection: Clone + Send + Sync + 'static;

    /// Run one statement, on `conn` when given, otherwise on a connection
    /// borrowed for this statement alone
    fn query(
        &self,
        conn: Option<Self::Connection>,
        sql: String,
        params: Vec<DatabaseValue>,
        on_success: OnSuccess<RawResultSet>,
        on_error: OnError,
    );

    /// Borrow a connection and open a transaction on it
    fn begin(&self, on_success: OnSuccess<Self::Connection>, on_error: OnError);

    /// Commit and release the connection, on success or failure
    fn commit(&self, conn: Self::Connection, on_success: OnSuccess<()>, on_error: OnError);

    /// Roll back and release the connection, on success or failure
    fn rollback(&self, conn: Self::Connection, on_success: OnSuccess<()>, on_error: OnError);

    fn status(&self) -> PoolStatus;

    /// Release every idle connection and refuse further work
    fn close(&self);
}

/// Async driver operations, driven by a [`Worker`](super::worker::Worker)
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Connection: Clone + Send + Sync + 'static;

    async fn query(
        &self,
        conn: Option<Self::Connection>,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<RawResultSet>;

    async fn begin(&self) -> Result<Self::Connection>;

    /// Must release `conn` whether or not the commit succeeds
    async fn commit(&self, conn: Self::Connection) -> Result<()>;

    /// Must release `conn` whether or not the rollback succeeds
    async fn rollback(&self, conn: Self::Connection) -> Result<()>;

    fn status(&self) -> PoolStatus;

    fn close(&self);
}
