//! Registry Store Library
//!
//! This library persists keyed entities into SQL backends (SQLite,
//! PostgreSQL, MySQL) behind one dialect-aware execution engine, and
//! layers high-availability peer registration on top of the same storage.

pub mod config;
pub mod db;
pub mod error;
pub mod ha;
pub mod storable;
pub mod storage;

pub use config::{ExecutionConfig, ServerConfig};
pub use error::{StorageError, StorageResult};
pub use storable::{FieldValue, Storable, StorableKey};
pub use storage::{SqlStorageManager, StorageManager};
