//! Entity persistence facade.
//!
//! [`StorageManager`] is the surface the rest of the process programs
//! against: generic add/get/list/remove over [`Storable`]s, with id
//! issuance and transaction boundaries. [`SqlStorageManager`] backs it
//! with a SQL database selected by configuration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::info;

use crate::config::ExecutionConfig;
use crate::db::executor::QueryExecutor;
use crate::db::pool::DbPool;
use crate::db::statement_cache::StatementCache;
use crate::db::transaction::{IsolationLevel, TransactionManager, TransactionSlot};
use crate::error::StorageResult;
use crate::storable::{Storable, StorableKey};

/// Generic entity persistence over namespaced [`Storable`]s.
#[async_trait]
pub trait StorageManager: Send + Sync {
    /// Store a new entity. A null id is generated and assigned on the
    /// entity; a supplied id that collides fails the call.
    async fn add(&self, entity: &mut Storable) -> StorageResult<()>;

    /// Store an entity, replacing any existing row with the same key.
    async fn add_or_update(&self, entity: &mut Storable) -> StorageResult<()>;

    /// Look up a single entity by key. `None` when no row matches; the
    /// first match when the key is not unique.
    async fn get(&self, key: &StorableKey) -> StorageResult<Option<Storable>>;

    /// Return every entity stored under a namespace.
    async fn list(&self, namespace: &str) -> StorageResult<Vec<Storable>>;

    /// Delete by key, returning the removed entity when one existed.
    async fn remove(&self, key: &StorableKey) -> StorageResult<Option<Storable>>;

    /// Issue a fresh id for a namespace, or `None` when the backend
    /// generates ids during insert.
    async fn next_id(&self, namespace: &str) -> StorageResult<Option<i64>>;
}

/// SQL-backed storage manager.
///
/// Owns the connection pool, the statement cache sized to it, and the
/// single transaction binding shared with the executor.
pub struct SqlStorageManager {
    pool: DbPool,
    executor: QueryExecutor,
    tx_slot: Arc<TransactionSlot>,
}

impl SqlStorageManager {
    /// Build a manager from a raw property map.
    ///
    /// Validation failures (missing keys, negative timeout) surface here,
    /// before any connection is attempted.
    pub async fn from_properties(props: &HashMap<String, JsonValue>) -> StorageResult<Self> {
        let config = ExecutionConfig::from_properties(props)?;
        Self::from_config(&config).await
    }

    /// Build a manager from validated settings.
    pub async fn from_config(config: &ExecutionConfig) -> StorageResult<Self> {
        let dialect = config.provider_dialect()?;
        let pool = DbPool::connect(config, dialect).await?;

        // Bounding the cache by the pool size keeps no more statements
        // warm than there are connections to run them on.
        let cache = Arc::new(StatementCache::new(
            dialect,
            config.max_connections_or_default(),
        ));
        let tx_slot = Arc::new(TransactionSlot::new());
        let executor = QueryExecutor::new(
            pool.clone(),
            cache,
            Arc::clone(&tx_slot),
            config.query_timeout(),
        );

        info!(
            dialect = %dialect,
            url = %config.masked_connection_url(),
            "Storage manager ready"
        );
        Ok(Self {
            pool,
            executor,
            tx_slot,
        })
    }

    /// Direct access to the query executor.
    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Roll back any transaction left open and close the pool.
    pub async fn close(&self) {
        self.tx_slot.rollback_if_active().await;
        self.pool.close().await;
    }
}

#[async_trait]
impl StorageManager for SqlStorageManager {
    async fn add(&self, entity: &mut Storable) -> StorageResult<()> {
        self.executor.insert(entity).await
    }

    async fn add_or_update(&self, entity: &mut Storable) -> StorageResult<()> {
        self.executor.insert_or_update(entity).await
    }

    async fn get(&self, key: &StorableKey) -> StorageResult<Option<Storable>> {
        let mut rows = self.executor.select_where(key).await?;
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows.swap_remove(0)))
        }
    }

    async fn list(&self, namespace: &str) -> StorageResult<Vec<Storable>> {
        self.executor.select(namespace).await
    }

    async fn remove(&self, key: &StorableKey) -> StorageResult<Option<Storable>> {
        let existing = self.get(key).await?;
        if existing.is_some() {
            self.executor.delete(key).await?;
        }
        Ok(existing)
    }

    async fn next_id(&self, namespace: &str) -> StorageResult<Option<i64>> {
        self.executor.next_id(namespace).await
    }
}

#[async_trait]
impl TransactionManager for SqlStorageManager {
    async fn begin_transaction(&self, isolation: IsolationLevel) -> StorageResult<()> {
        self.tx_slot.begin(&self.pool, isolation).await
    }

    async fn commit_transaction(&self) -> StorageResult<()> {
        self.tx_slot.commit().await
    }

    async fn rollback_transaction(&self) -> StorageResult<()> {
        self.tx_slot.rollback().await
    }
}
