//! Transaction management.
//!
//! A storage manager carries at most one open transaction at a time. The
//! transaction holds a dedicated pooled connection until committed or
//! rolled back; while it is open, every executor operation routes through
//! that connection so statements inside the unit of work are strictly
//! ordered and see each other's writes.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, MySql, Postgres, Sqlite};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::db::dialect::Dialect;
use crate::db::pool::DbPool;
use crate::error::{StorageError, StorageResult};

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// The SQL keyword form of this level.
    pub fn sql_keyword(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sql_keyword())
    }
}

/// Transaction boundary control.
///
/// Callers wrap units of work in begin/commit/rollback without knowing
/// whether the backend supports transactions at all; [`NoopTransactionManager`]
/// stands in when it does not.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Start a unit of work. Fails if one is already active.
    async fn begin_transaction(&self, isolation: IsolationLevel) -> StorageResult<()>;

    /// Make the active unit of work durable.
    async fn commit_transaction(&self) -> StorageResult<()>;

    /// Discard the active unit of work.
    async fn rollback_transaction(&self) -> StorageResult<()>;
}

/// Transaction manager that accepts every boundary call without doing
/// anything.
#[derive(Debug, Default, Clone)]
pub struct NoopTransactionManager;

#[async_trait]
impl TransactionManager for NoopTransactionManager {
    async fn begin_transaction(&self, isolation: IsolationLevel) -> StorageResult<()> {
        debug!(isolation = %isolation, "begin ignored (no-op transaction manager)");
        Ok(())
    }

    async fn commit_transaction(&self) -> StorageResult<()> {
        debug!("commit ignored (no-op transaction manager)");
        Ok(())
    }

    async fn rollback_transaction(&self) -> StorageResult<()> {
        debug!("rollback ignored (no-op transaction manager)");
        Ok(())
    }
}

/// Connection pinned to an open transaction.
pub enum TxConn {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    Sqlite(PoolConnection<Sqlite>),
}

impl TxConn {
    /// Run the terminal statement and return the connection to the pool.
    ///
    /// If COMMIT or ROLLBACK itself fails the connection is closed instead
    /// of returned, as its transaction state is no longer known.
    async fn finish(mut self, sql: &str) -> StorageResult<()> {
        let result = match &mut self {
            TxConn::MySql(conn) => sqlx::query(sql).execute(&mut **conn).await.map(|_| ()),
            TxConn::Postgres(conn) => sqlx::query(sql).execute(&mut **conn).await.map(|_| ()),
            TxConn::Sqlite(conn) => sqlx::query(sql).execute(&mut **conn).await.map(|_| ()),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, statement = sql, "discarding transaction connection");
                match self {
                    TxConn::MySql(conn) => { let _ = conn.detach().close().await; }
                    TxConn::Postgres(conn) => { let _ = conn.detach().close().await; }
                    TxConn::Sqlite(conn) => { let _ = conn.detach().close().await; }
                }
                Err(StorageError::from(e))
            }
        }
    }
}

/// The single transaction binding of a storage manager.
pub struct TransactionSlot {
    conn: Mutex<Option<TxConn>>,
}

impl TransactionSlot {
    pub fn new() -> Self {
        Self {
            conn: Mutex::new(None),
        }
    }

    /// Lock the slot for statement routing. Executor operations hold this
    /// guard while running so in-transaction statements never interleave.
    pub async fn lock(&self) -> MutexGuard<'_, Option<TxConn>> {
        self.conn.lock().await
    }

    /// Open a transaction at the given isolation level on a dedicated
    /// pooled connection.
    pub async fn begin(&self, pool: &DbPool, isolation: IsolationLevel) -> StorageResult<()> {
        let mut slot = self.conn.lock().await;
        if slot.is_some() {
            return Err(StorageError::transaction(
                "A transaction is already active",
            ));
        }

        // A connection that failed partway through the begin sequence is
        // closed rather than returned, like a failed COMMIT/ROLLBACK.
        let statements = begin_statements(pool.dialect(), isolation);
        let tx_conn = match pool {
            DbPool::MySql(pool) => {
                let mut conn = pool.acquire().await.map_err(StorageError::from)?;
                for sql in &statements {
                    if let Err(e) = sqlx::query(sql).execute(&mut *conn).await {
                        let _ = conn.detach().close().await;
                        return Err(StorageError::from(e));
                    }
                }
                TxConn::MySql(conn)
            }
            DbPool::Postgres(pool) => {
                let mut conn = pool.acquire().await.map_err(StorageError::from)?;
                for sql in &statements {
                    if let Err(e) = sqlx::query(sql).execute(&mut *conn).await {
                        let _ = conn.detach().close().await;
                        return Err(StorageError::from(e));
                    }
                }
                TxConn::Postgres(conn)
            }
            DbPool::Sqlite(pool) => {
                let mut conn = pool.acquire().await.map_err(StorageError::from)?;
                for sql in &statements {
                    if let Err(e) = sqlx::query(sql).execute(&mut *conn).await {
                        let _ = conn.detach().close().await;
                        return Err(StorageError::from(e));
                    }
                }
                TxConn::Sqlite(conn)
            }
        };

        *slot = Some(tx_conn);
        info!(isolation = %isolation, dialect = %pool.dialect(), "Transaction started");
        Ok(())
    }

    /// Commit the open transaction.
    pub async fn commit(&self) -> StorageResult<()> {
        let mut slot = self.conn.lock().await;
        let conn = slot
            .take()
            .ok_or_else(|| StorageError::transaction("No active transaction to commit"))?;
        conn.finish("COMMIT").await?;
        info!("Transaction committed");
        Ok(())
    }

    /// Roll back the open transaction.
    pub async fn rollback(&self) -> StorageResult<()> {
        let mut slot = self.conn.lock().await;
        let conn = slot
            .take()
            .ok_or_else(|| StorageError::transaction("No active transaction to roll back"))?;
        conn.finish("ROLLBACK").await?;
        info!("Transaction rolled back");
        Ok(())
    }

    /// Roll back any open transaction, ignoring failures. Used on
    /// shutdown.
    pub async fn rollback_if_active(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            warn!("Rolling back transaction left open at shutdown");
            let _ = conn.finish("ROLLBACK").await;
        }
    }

    /// Check whether a transaction is open.
    pub async fn is_active(&self) -> bool {
        self.conn.lock().await.is_some()
    }
}

impl Default for TransactionSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Statements that open a transaction at the given isolation level.
///
/// MySQL applies SET TRANSACTION to the next transaction, so it runs as a
/// separate statement before START TRANSACTION. SQLite transactions are
/// always serializable and take no level clause.
pub fn begin_statements(dialect: Dialect, isolation: IsolationLevel) -> Vec<String> {
    match dialect {
        Dialect::MySql => vec![
            format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.sql_keyword()),
            "START TRANSACTION".to_string(),
        ],
        Dialect::Postgres => vec![format!("BEGIN ISOLATION LEVEL {}", isolation.sql_keyword())],
        Dialect::Sqlite => vec!["BEGIN".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionConfig, PROP_DATA_SOURCE_CLASS, PROP_DATA_SOURCE_URL};
    use serde_json::json;
    use std::collections::HashMap;

    async fn sqlite_pool(path: &std::path::Path) -> DbPool {
        let mut props = HashMap::new();
        props.insert(PROP_DATA_SOURCE_CLASS.to_string(), json!("sqlite"));
        props.insert(
            PROP_DATA_SOURCE_URL.to_string(),
            json!(format!("sqlite://{}", path.display())),
        );
        let config = ExecutionConfig::from_properties(&props).unwrap();
        DbPool::connect(&config, Dialect::Sqlite).await.unwrap()
    }

    #[tokio::test]
    async fn test_noop_manager_accepts_all_calls() {
        let manager = NoopTransactionManager;
        manager
            .begin_transaction(IsolationLevel::ReadCommitted)
            .await
            .unwrap();
        manager.commit_transaction().await.unwrap();
        manager.rollback_transaction().await.unwrap();
    }

    #[test]
    fn test_isolation_keywords() {
        assert_eq!(IsolationLevel::ReadUncommitted.sql_keyword(), "READ UNCOMMITTED");
        assert_eq!(IsolationLevel::ReadCommitted.sql_keyword(), "READ COMMITTED");
        assert_eq!(IsolationLevel::RepeatableRead.sql_keyword(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::Serializable.sql_keyword(), "SERIALIZABLE");
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_begin_statements_per_dialect() {
        assert_eq!(
            begin_statements(Dialect::MySql, IsolationLevel::RepeatableRead),
            vec![
                "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ".to_string(),
                "START TRANSACTION".to_string(),
            ]
        );
        assert_eq!(
            begin_statements(Dialect::Postgres, IsolationLevel::Serializable),
            vec!["BEGIN ISOLATION LEVEL SERIALIZABLE".to_string()]
        );
        assert_eq!(
            begin_statements(Dialect::Sqlite, IsolationLevel::ReadCommitted),
            vec!["BEGIN".to_string()]
        );
    }

    #[tokio::test]
    async fn test_second_begin_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir.path().join("tx.db")).await;
        let slot = TransactionSlot::new();

        slot.begin(&pool, IsolationLevel::ReadCommitted).await.unwrap();
        let err = slot
            .begin(&pool, IsolationLevel::ReadCommitted)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Transaction { .. }));

        slot.rollback().await.unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn test_commit_without_begin_rejected() {
        let slot = TransactionSlot::new();
        let err = slot.commit().await.unwrap_err();
        assert!(matches!(err, StorageError::Transaction { .. }));
    }

    #[tokio::test]
    async fn test_rollback_without_begin_rejected() {
        let slot = TransactionSlot::new();
        let err = slot.rollback().await.unwrap_err();
        assert!(matches!(err, StorageError::Transaction { .. }));
    }

    #[tokio::test]
    async fn test_slot_frees_after_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let pool = sqlite_pool(&dir.path().join("tx.db")).await;
        let slot = TransactionSlot::new();

        slot.begin(&pool, IsolationLevel::ReadCommitted).await.unwrap();
        assert!(slot.is_active().await);
        slot.commit().await.unwrap();
        assert!(!slot.is_active().await);

        slot.begin(&pool, IsolationLevel::Serializable).await.unwrap();
        slot.rollback().await.unwrap();
        assert!(!slot.is_active().await);

        pool.close().await;
    }
}
