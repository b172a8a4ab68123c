//! Public database surface
//!
//! Every operation comes in two forms: `*_async` returns an [`Outcome`], the plain
//! form takes a completion callback receiving the same `Result`. Neither blocks.
//! Local failures (malformed specs, closed transactions, unconvertible values) are
//! delivered through the outcome like any other error, before the pool is touched.

use super::convert::ConverterRegistry;
use super::error::Result;
use super::executor::{Executor, PoolStatus};
use super::outcome::Outcome;
use super::statement::{InsertSpec, RowData, Statement, UpdateSpec};
use super::transaction::{Target, Transaction};
use super::value::{ResultSet, Row};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Handle to a connection pool plus its frozen converter registry
///
/// Cheap to clone; clones share the pool.
pub struct Database<E: Executor> {
    executor: Arc<E>,
    registry: Arc<ConverterRegistry>,
}

impl<E: Executor> Clone for Database<E> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<'a, E: Executor> From<&'a Database<E>> for Target<'a, E> {
    fn from(_: &'a Database<E>) -> Self {
        Target::Pool
    }
}

impl<E: Executor> Database<E> {
    /// Wrap an executor; the registry cannot change afterwards
    pub fn new(executor: E, registry: ConverterRegistry) -> Self {
        Self {
            executor: Arc::new(executor),
            registry: Arc::new(registry),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn registry(&self) -> &ConverterRegistry {
        &self.registry
    }

    pub fn status(&self) -> PoolStatus {
        self.executor.status()
    }

    /// Close the pool; later operations fail with `PoolClosed`
    pub fn close(&self) {
        self.executor.close();
    }

    /// Run a statement and resolve to its full result set
    pub fn execute_async<'a>(
        &self,
        target: impl Into<Target<'a, E>>,
        statement: impl Into<Statement>,
    ) -> Outcome<ResultSet> {
        let Statement { sql, params } = statement.into();

        let conn = match target.into() {
            Target::Pool => None,
            Target::Transaction(tx) => match tx.connection() {
                Ok(conn) => Some(conn),
                Err(e) => return Outcome::failed(e),
            },
        };
        let params = match self.registry.write_all(&params) {
            Ok(params) => params,
            Err(e) => return Outcome::failed(e),
        };

        debug!(
            sql = %sql,
            params = params.len(),
            in_transaction = conn.is_some(),
            "executing statement"
        );

        let executor = Arc::clone(&self.executor);
        let registry = Arc::clone(&self.registry);
        Outcome::from_callbacks(move |on_success, on_error| {
            executor.query(conn, sql, params, on_success, on_error)
        })
        .and_then(move |raw| registry.read_result_set(raw))
    }

    pub fn execute<'a, F>(
        &self,
        target: impl Into<Target<'a, E>>,
        statement: impl Into<Statement>,
        callback: F,
    ) where
        F: FnOnce(Result<ResultSet>) + Send + 'static,
    {
        self.execute_async(target, statement).on_complete(callback);
    }

    /// Run a statement and resolve to its rows only
    pub fn query_async<'a>(
        &self,
        target: impl Into<Target<'a, E>>,
        statement: impl Into<Statement>,
    ) -> Outcome<Vec<Row>> {
        self.execute_async(target, statement).map(|result| result.rows)
    }

    pub fn query<'a, F>(
        &self,
        target: impl Into<Target<'a, E>>,
        statement: impl Into<Statement>,
        callback: F,
    ) where
        F: FnOnce(Result<Vec<Row>>) + Send + 'static,
    {
        self.query_async(target, statement).on_complete(callback);
    }

    /// Insert one row
    pub fn insert_async<'a>(
        &self,
        target: impl Into<Target<'a, E>>,
        spec: &InsertSpec,
        row: &RowData,
    ) -> Outcome<ResultSet> {
        match spec.build(row) {
            Ok(statement) => self.execute_async(target, statement),
            Err(e) => Outcome::failed(e),
        }
    }

    pub fn insert<'a, F>(
        &self,
        target: impl Into<Target<'a, E>>,
        spec: &InsertSpec,
        row: &RowData,
        callback: F,
    ) where
        F: FnOnce(Result<ResultSet>) + Send + 'static,
    {
        self.insert_async(target, spec, row).on_complete(callback);
    }

    /// Insert several rows with one statement
    pub fn insert_many_async<'a>(
        &self,
        target: impl Into<Target<'a, E>>,
        spec: &InsertSpec,
        rows: &[RowData],
    ) -> Outcome<ResultSet> {
        match spec.build_many(rows) {
            Ok(statement) => self.execute_async(target, statement),
            Err(e) => Outcome::failed(e),
        }
    }

    pub fn insert_many<'a, F>(
        &self,
        target: impl Into<Target<'a, E>>,
        spec: &InsertSpec,
        rows: &[RowData],
        callback: F,
    ) where
        F: FnOnce(Result<ResultSet>) + Send + 'static,
    {
        self.insert_many_async(target, spec, rows).on_complete(callback);
    }

    pub fn update_async<'a>(
        &self,
        target: impl Into<Target<'a, E>>,
        spec: &UpdateSpec,
        row: &RowData,
    ) -> Outcome<ResultSet> {
        match spec.build(row) {
            Ok(statement) => self.execute_async(target, statement),
            Err(e) => Outcome::failed(e),
        }
    }

    pub fn update<'a, F>(
        &self,
        target: impl Into<Target<'a, E>>,
        spec: &UpdateSpec,
        row: &RowData,
        callback: F,
    ) where
        F: FnOnce(Result<ResultSet>) + Send + 'static,
    {
        self.update_async(target, spec, row).on_complete(callback);
    }

    /// Borrow a connection and open a transaction on it
    pub fn begin_async(&self) -> Outcome<Transaction<E>> {
        let executor = Arc::clone(&self.executor);
        let owner = Arc::clone(&self.executor);
        Outcome::from_callbacks(move |on_success, on_error| executor.begin(on_success, on_error))
            .map(move |conn| Transaction::new(owner, conn))
    }

    pub fn begin<F>(&self, callback: F)
    where
        F: FnOnce(Result<Transaction<E>>) + Send + 'static,
    {
        self.begin_async().on_complete(callback);
    }

    pub fn commit_async(&self, tx: &Transaction<E>) -> Outcome<()> {
        tx.commit()
    }

    pub fn commit<F>(&self, tx: &Transaction<E>, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        tx.commit().on_complete(callback);
    }

    pub fn rollback_async(&self, tx: &Transaction<E>) -> Outcome<()> {
        tx.rollback()
    }

    pub fn rollback<F>(&self, tx: &Transaction<E>, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        tx.rollback().on_complete(callback);
    }
}

impl<E: Executor> fmt::Debug for Database<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("status", &self.status())
            .field("registry", &self.registry)
            .finish()
    }
}
