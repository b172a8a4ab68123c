//! Error types for the database system
//!
//! Every failure, whether detected locally or reported by the driver, is delivered
//! as the error half of an [`Outcome`](super::outcome::Outcome). Nothing here is
//! ever thrown across the future boundary.

/// Result type alias for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Boxed error carried by driver failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error types for database operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Insert/update spec or row data rejected before any network call
    #[error("Malformed statement spec: {0}")]
    MalformedStatementSpec(String),

    /// Any error surfaced by the underlying executor, including server-reported SQL errors
    #[error("Driver error: {source}")]
    Driver {
        #[source]
        source: BoxError,
    },

    /// Operation attempted on a transaction that is no longer active
    #[error("Transaction closed: handle is {state}")]
    TransactionClosed { state: &'static str },

    /// Connection pool exhausted
    #[error("Connection pool exhausted: {active}/{max} connections in use")]
    PoolExhausted { active: usize, max: usize },

    /// Connection error (generic)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Connection timeout
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },

    /// Query timeout
    #[error("Query timeout after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },

    /// Pool was closed before the operation could run
    #[error("Connection pool is closed")]
    PoolClosed,

    /// Value conversion bridge could not convert a value
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Type conversion error
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// A composition step referenced a name that was never bound
    #[error("Unbound name: {0}")]
    UnboundName(String),

    /// Invalid pool configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DatabaseError {
    /// Create a malformed statement spec error
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        DatabaseError::MalformedStatementSpec(msg.into())
    }

    /// Wrap a driver error
    pub fn driver<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DatabaseError::Driver {
            source: Box::new(source),
        }
    }

    /// Create a driver error from a plain message
    pub fn driver_message<S: Into<String>>(msg: S) -> Self {
        let msg: String = msg.into();
        DatabaseError::Driver { source: msg.into() }
    }

    /// Create a transaction closed error
    pub fn transaction_closed(state: &'static str) -> Self {
        DatabaseError::TransactionClosed { state }
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(active: usize, max: usize) -> Self {
        DatabaseError::PoolExhausted { active, max }
    }

    /// Create a new connection error (generic)
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        DatabaseError::ConnectionError(msg.into())
    }

    /// Create a connection timeout error
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        DatabaseError::ConnectionTimeout { timeout_ms }
    }

    /// Create a query timeout error
    pub fn query_timeout(timeout_ms: u64) -> Self {
        DatabaseError::QueryTimeout { timeout_ms }
    }

    /// Create a conversion error
    pub fn conversion<S: Into<String>>(msg: S) -> Self {
        DatabaseError::Conversion(msg.into())
    }

    /// Create a new type mismatch error
    pub fn type_mismatch(expected: &str, actual: &str) -> Self {
        DatabaseError::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create an unbound name error
    pub fn unbound<S: Into<String>>(name: S) -> Self {
        DatabaseError::UnboundName(name.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        DatabaseError::InvalidConfig(msg.into())
    }

    /// True for errors detected locally, before anything reached the pool
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            DatabaseError::MalformedStatementSpec(_)
                | DatabaseError::TransactionClosed { .. }
                | DatabaseError::Conversion(_)
                | DatabaseError::TypeMismatch { .. }
                | DatabaseError::UnboundName(_)
        )
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for DatabaseError {
    fn from(err: tokio_postgres::Error) -> Self {
        DatabaseError::driver(err)
    }
}
