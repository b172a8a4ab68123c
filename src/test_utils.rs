//! Scripted in-memory backend for tests
//!
//! [`MockBackend`] tracks borrowed connections exactly like a pool would, records
//! every statement it receives, and can be told to fail specific operations.

use crate::core::error::{DatabaseError, Result};
use crate::core::executor::{Backend, PoolStatus};
use crate::core::value::{DatabaseValue, RawResultSet};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// One statement seen by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub sql: String,
    pub params: Vec<DatabaseValue>,
    /// Connection id, `None` for statements on a per-statement connection
    pub connection: Option<u64>,
}

#[derive(Default)]
struct Script {
    fail_begin: bool,
    fail_commit: bool,
    fail_rollback: bool,
    fail_matching: Vec<String>,
    results: VecDeque<RawResultSet>,
    latency: Option<Duration>,
}

struct MockState {
    max: usize,
    available: Mutex<usize>,
    closed: Mutex<bool>,
    recorded: Mutex<Vec<Recorded>>,
    script: Mutex<Script>,
    next_id: AtomicU64,
}

impl MockState {
    fn acquire(self: &Arc<Self>) -> Result<MockConnection> {
        if *self.closed.lock() {
            return Err(DatabaseError::PoolClosed);
        }
        let mut available = self.available.lock();
        if *available == 0 {
            return Err(DatabaseError::pool_exhausted(self.max, self.max));
        }
        *available -= 1;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(connection = id, "mock connection borrowed");
        Ok(MockConnection(Arc::new(Lease {
            id,
            state: Arc::clone(self),
        })))
    }

    fn record(&self, sql: &str, params: &[DatabaseValue], connection: Option<u64>) {
        self.recorded.lock().push(Recorded {
            sql: sql.to_string(),
            params: params.to_vec(),
            connection,
        });
    }
}

struct Lease {
    id: u64,
    state: Arc<MockState>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        trace!(connection = self.id, "mock connection released");
        *self.state.available.lock() += 1;
    }
}

/// Borrowed mock connection; released when the last clone drops
#[derive(Clone)]
pub struct MockConnection(Arc<Lease>);

impl MockConnection {
    pub fn id(&self) -> u64 {
        self.0.id
    }
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MockConnection").field(&self.0.id).finish()
    }
}

/// Pool of `max` fake connections
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    pub fn new(max: usize) -> Self {
        Self {
            state: Arc::new(MockState {
                max,
                available: Mutex::new(max),
                closed: Mutex::new(false),
                recorded: Mutex::new(Vec::new()),
                script: Mutex::new(Script::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn fail_begin(&self, fail: bool) -> &Self {
        self.state.script.lock().fail_begin = fail;
        self
    }

    pub fn fail_commit(&self, fail: bool) -> &Self {
        self.state.script.lock().fail_commit = fail;
        self
    }

    pub fn fail_rollback(&self, fail: bool) -> &Self {
        self.state.script.lock().fail_rollback = fail;
        self
    }

    /// Fail every statement whose SQL contains `pattern`
    pub fn fail_matching(&self, pattern: impl Into<String>) -> &Self {
        self.state.script.lock().fail_matching.push(pattern.into());
        self
    }

    /// Queue the result returned by the next statement
    pub fn push_result(&self, result: RawResultSet) -> &Self {
        self.state.script.lock().results.push_back(result);
        self
    }

    /// Delay every statement by `latency`
    pub fn with_latency(&self, latency: Duration) -> &Self {
        self.state.script.lock().latency = Some(latency);
        self
    }

    /// Everything executed so far, including BEGIN/COMMIT/ROLLBACK
    pub fn statements(&self) -> Vec<Recorded> {
        self.state.recorded.lock().clone()
    }

    pub fn available(&self) -> usize {
        *self.state.available.lock()
    }

    pub fn is_closed(&self) -> bool {
        *self.state.closed.lock()
    }
}

#[async_trait]
impl Backend for MockBackend {
    type Connection = MockConnection;

    async fn query(
        &self,
        conn: Option<MockConnection>,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<RawResultSet> {
        let latency = self.state.script.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let transaction = conn.as_ref().map(MockConnection::id);
        // Per-statement connections are held until the statement finishes
        let _conn = match conn {
            Some(conn) => conn,
            None => self.state.acquire()?,
        };
        self.state.record(sql, params, transaction);

        let mut script = self.state.script.lock();
        if script.fail_matching.iter().any(|p| sql.contains(p.as_str())) {
            return Err(DatabaseError::driver_message(format!(
                "scripted failure for: {}",
                sql
            )));
        }
        Ok(script.results.pop_front().unwrap_or_default())
    }

    async fn begin(&self) -> Result<MockConnection> {
        if self.state.script.lock().fail_begin {
            return Err(DatabaseError::connection("scripted begin failure"));
        }
        let conn = self.state.acquire()?;
        self.state.record("BEGIN", &[], Some(conn.id()));
        Ok(conn)
    }

    async fn commit(&self, conn: MockConnection) -> Result<()> {
        self.state.record("COMMIT", &[], Some(conn.id()));
        drop(conn);
        if self.state.script.lock().fail_commit {
            return Err(DatabaseError::driver_message("scripted commit failure"));
        }
        Ok(())
    }

    async fn rollback(&self, conn: MockConnection) -> Result<()> {
        self.state.record("ROLLBACK", &[], Some(conn.id()));
        drop(conn);
        if self.state.script.lock().fail_rollback {
            return Err(DatabaseError::driver_message("scripted rollback failure"));
        }
        Ok(())
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.state.max,
            available: *self.state.available.lock(),
            max_size: self.state.max,
        }
    }

    fn close(&self) {
        *self.state.closed.lock() = true;
    }
}
