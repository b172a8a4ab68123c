//! Core types and the composition machinery
//!
//! Everything here is backend-agnostic: values and the conversion bridge,
//! outcomes and chains, statement synthesis, transactions, and the executor
//! boundary a driver plugs into.

pub mod chain;
pub mod config;
pub mod convert;
pub mod database;
pub mod error;
pub mod executor;
pub mod outcome;
pub mod statement;
pub mod transaction;
pub mod value;
pub mod worker;

// Re-export commonly used types
pub use chain::{Bindings, Chain, IntoOutcome};
pub use config::PoolConfig;
pub use convert::{ConverterRegistry, WireType};
pub use database::Database;
pub use error::{DatabaseError, Result};
pub use executor::{Backend, Executor, PoolStatus};
pub use outcome::{OnError, OnSuccess, Outcome, Promise};
pub use statement::{InsertSpec, RowData, Statement, UpdateSpec};
pub use transaction::{Target, Transaction, TransactionState};
pub use value::{Column, CustomValue, DatabaseValue, DomainValue, RawResultSet, ResultSet, Row};
pub use worker::Worker;
