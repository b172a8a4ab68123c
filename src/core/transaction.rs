//! Transaction handles
//!
//! A [`Transaction`] owns one borrowed connection from `begin` until `commit` or
//! `rollback`. The connection is handed back to the executor exactly once: by
//! commit, by rollback, or by the automatic rollback issued when the last handle
//! is dropped while still active.

use super::error::{DatabaseError, Result};
use super::executor::Executor;
use super::outcome::Outcome;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Observable lifecycle state of a [`Transaction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Connection borrowed, statements allowed
    Active,
    /// Commit or rollback issued, not yet resolved
    Closing,
    Committed,
    RolledBack,
    /// Commit or rollback failed; the connection was still released
    Aborted,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Active => "active",
            TransactionState::Closing => "closing",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
            TransactionState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Aborted
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Slot<C> {
    Active(C),
    Settled(TransactionState),
}

struct Inner<E: Executor> {
    id: u64,
    slot: Mutex<Slot<E::Connection>>,
    executor: Arc<E>,
}

/// Handle over one borrowed connection
///
/// Clones share the same transaction. The handle models one sequential unit of
/// work; issuing statements on it from several chains at once gives no ordering
/// guarantee.
pub struct Transaction<E: Executor> {
    inner: Arc<Inner<E>>,
}

impl<E: Executor> Clone for Transaction<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Executor> Transaction<E> {
    pub(crate) fn new(executor: Arc<E>, conn: E::Connection) -> Self {
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(tx = id, "transaction started");
        Self {
            inner: Arc::new(Inner {
                id,
                slot: Mutex::new(Slot::Active(conn)),
                executor,
            }),
        }
    }

    /// Process-unique id, used in log fields
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> TransactionState {
        match &*self.inner.slot.lock() {
            Slot::Active(_) => TransactionState::Active,
            Slot::Settled(state) => *state,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// The borrowed connection, or `TransactionClosed` once commit/rollback began
    pub(crate) fn connection(&self) -> Result<E::Connection> {
        match &*self.inner.slot.lock() {
            Slot::Active(conn) => Ok(conn.clone()),
            Slot::Settled(state) => Err(DatabaseError::transaction_closed(state.as_str())),
        }
    }

    /// Commit and release the connection
    pub fn commit(&self) -> Outcome<()> {
        self.settle(true)
    }

    /// Roll back and release the connection
    pub fn rollback(&self) -> Outcome<()> {
        self.settle(false)
    }

    fn settle(&self, commit: bool) -> Outcome<()> {
        let conn = {
            let mut slot = self.inner.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Settled(TransactionState::Closing)) {
                Slot::Active(conn) => conn,
                Slot::Settled(state) => {
                    *slot = Slot::Settled(state);
                    return Outcome::failed(DatabaseError::transaction_closed(state.as_str()));
                }
            }
        };

        let id = self.inner.id;
        let action = if commit { "commit" } else { "rollback" };
        let executor = Arc::clone(&self.inner.executor);
        let inner = Arc::clone(&self.inner);

        let (promise, outcome) = Outcome::pending();
        Outcome::from_callbacks(move |on_success, on_error| {
            if commit {
                executor.commit(conn, on_success, on_error)
            } else {
                executor.rollback(conn, on_success, on_error)
            }
        })
        .on_complete(move |result| {
            let settled = match (&result, commit) {
                (Ok(()), true) => TransactionState::Committed,
                (Ok(()), false) => TransactionState::RolledBack,
                (Err(_), _) => TransactionState::Aborted,
            };
            match &result {
                Ok(()) => debug!(tx = id, action, "transaction finished"),
                Err(e) => warn!(tx = id, action, error = %e, "transaction aborted"),
            }
            // State first, so observers of the outcome see the terminal state
            *inner.slot.lock() = Slot::Settled(settled);
            promise.resolve(result);
        });
        outcome
    }
}

impl<E: Executor> fmt::Debug for Transaction<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<E: Executor> Drop for Inner<E> {
    fn drop(&mut self) {
        let slot = std::mem::replace(
            self.slot.get_mut(),
            Slot::Settled(TransactionState::RolledBack),
        );
        if let Slot::Active(conn) = slot {
            warn!(
                tx = self.id,
                "transaction dropped while active; rolling back"
            );
            let id = self.id;
            self.executor.rollback(
                conn,
                Box::new(|()| {}),
                Box::new(move |e| warn!(tx = id, error = %e, "automatic rollback failed")),
            );
        }
    }
}

/// Where a statement runs
pub enum Target<'a, E: Executor> {
    /// A connection borrowed for this statement alone
    Pool,
    /// The connection owned by an active transaction
    Transaction(&'a Transaction<E>),
}

impl<'a, E: Executor> Clone for Target<'a, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, E: Executor> Copy for Target<'a, E> {}

impl<'a, E: Executor> From<&'a Transaction<E>> for Target<'a, E> {
    fn from(tx: &'a Transaction<E>) -> Self {
        Target::Transaction(tx)
    }
}

impl<'a, E: Executor> fmt::Debug for Target<'a, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Pool => f.write_str("Pool"),
            Target::Transaction(tx) => f.debug_tuple("Transaction").field(&tx.id()).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::worker::Worker;
    use crate::test_utils::MockBackend;
    use std::time::{Duration, Instant};

    fn begin(worker: &Arc<Worker<MockBackend>>) -> Transaction<Worker<MockBackend>> {
        let conn = Outcome::from_callbacks(|ok, err| worker.begin(ok, err))
            .wait()
            .unwrap();
        Transaction::new(Arc::clone(worker), conn)
    }

    #[test]
    fn test_state_transitions() {
        let worker = Arc::new(Worker::spawn(MockBackend::new(1)).unwrap());
        let tx = begin(&worker);
        assert_eq!(tx.state(), TransactionState::Active);
        assert!(tx.connection().is_ok());

        tx.rollback().wait().unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(tx.state().is_terminal());
        assert!(matches!(
            tx.connection(),
            Err(DatabaseError::TransactionClosed { state: "rolled back" })
        ));
    }

    #[test]
    fn test_clones_share_state() {
        let worker = Arc::new(Worker::spawn(MockBackend::new(1)).unwrap());
        let tx = begin(&worker);
        let other = tx.clone();

        other.commit().wait().unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(tx.id(), other.id());
        assert!(tx.commit().wait().is_err());
    }

    #[test]
    fn test_closing_rejects_statements() {
        let worker = Arc::new(Worker::spawn(MockBackend::new(1)).unwrap());
        let tx = begin(&worker);

        // Closing or already committed, never active again
        let pending = tx.commit();
        assert!(matches!(
            tx.connection(),
            Err(DatabaseError::TransactionClosed { .. })
        ));
        pending.wait().unwrap();
    }

    #[test]
    fn test_drop_rolls_back_once() {
        let backend = MockBackend::new(1);
        let worker = Arc::new(Worker::spawn(backend.clone()).unwrap());
        drop(begin(&worker));

        let deadline = Instant::now() + Duration::from_secs(2);
        while backend.available() != 1 {
            assert!(Instant::now() < deadline, "connection never released");
            std::thread::sleep(Duration::from_millis(5));
        }
        let rollbacks = backend
            .statements()
            .iter()
            .filter(|s| s.sql == "ROLLBACK")
            .count();
        assert_eq!(rollbacks, 1);
    }

    #[test]
    fn test_target_from_transaction() {
        let worker = Arc::new(Worker::spawn(MockBackend::new(1)).unwrap());
        let tx = begin(&worker);
        let target: Target<'_, Worker<MockBackend>> = (&tx).into();
        assert!(matches!(target, Target::Transaction(t) if t.id() == tx.id()));
        tx.rollback().wait().unwrap();
    }
}
