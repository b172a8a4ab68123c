//! Driver-backed [`Backend`](crate::core::Backend) implementations

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::{PgBackend, PgConnection, PgDatabase};
