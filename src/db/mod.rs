//! Database abstraction layer.
//!
//! This module provides the SQL side of the storage layer:
//! - Connection pool management across backends
//! - Dialect-specific SQL rendering and identity strategies
//! - Query descriptors and the prepared-statement cache
//! - Query execution with timeout handling
//! - Transaction control on a dedicated pooled connection

pub mod dialect;
pub mod executor;
pub mod pool;
pub mod query;
pub mod statement_cache;
pub mod transaction;

pub use dialect::{Dialect, GeneratedKeys};
pub use executor::QueryExecutor;
pub use pool::DbPool;
pub use query::{PreparedSql, QueryDescriptor, QueryOp};
pub use statement_cache::StatementCache;
pub use transaction::{
    IsolationLevel, NoopTransactionManager, TransactionManager, TransactionSlot,
};
