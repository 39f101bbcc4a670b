//! SQL backend over sqlx.
//!
//! This module provides the `sqlx` adapter family:
//! - Database-specific connection pools
//! - SQL rendering of query-builder state
//! - Statement execution on pools and transactions
//! - Type mappings between rows and JSON values
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod builder;
pub mod connection;
pub mod executor;
pub mod params;
pub mod pool;
pub mod sql;
pub mod transaction;
pub mod types;

pub use builder::{SqlSession, SqlxQueryBuilder, SqlxQueryBuilderFactory};
pub use connection::{SqlxAdapter, SqlxConnection};
pub use executor::{ExecOutcome, SqlExecutor};
pub use macros::DatabaseType;
pub use pool::DbPool;
pub use transaction::{DbTransaction, TxHandle};
