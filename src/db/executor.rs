//! Query execution engine.
//!
//! Every statement the storage layer runs flows through here: writes with
//! identity retrieval, reads materialized back into entities, next-id
//! issuance, each bounded by the configured query timeout.
//!
//! # Architecture
//!
//! The executor resolves SQL through the statement cache, binds entity
//! fields in the rendered column order, then dispatches to
//! database-specific implementations organized in submodules:
//! - `mysql`: MySQL-specific execution and row decoding
//! - `postgres`: PostgreSQL-specific execution and row decoding
//! - `sqlite`: SQLite-specific execution and row decoding
//!
//! Each submodule provides identical functionality adapted to the
//! database's type system. While a transaction is active every operation
//! runs on its pinned connection; otherwise statements go to the pool.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::{Column, Row, TypeInfo};
use tokio::time::timeout;
use tracing::debug;

use crate::db::dialect::{Dialect, GeneratedKeys};
use crate::db::pool::DbPool;
use crate::db::query::QueryDescriptor;
use crate::db::statement_cache::StatementCache;
use crate::db::transaction::{TransactionSlot, TxConn};
use crate::error::{StorageError, StorageResult};
use crate::storable::{FieldValue, Storable, StorableKey};

/// Query executor that runs entity operations against one backend.
pub struct QueryExecutor {
    pool: DbPool,
    cache: Arc<StatementCache>,
    tx_slot: Arc<TransactionSlot>,
    query_timeout: Option<Duration>,
}

impl QueryExecutor {
    /// Create an executor over an open pool.
    ///
    /// `query_timeout` of `None` leaves statement execution unbounded.
    pub fn new(
        pool: DbPool,
        cache: Arc<StatementCache>,
        tx_slot: Arc<TransactionSlot>,
        query_timeout: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            cache,
            tx_slot,
            query_timeout,
        }
    }

    /// The dialect this executor renders and decodes for.
    pub fn dialect(&self) -> Dialect {
        self.pool.dialect()
    }

    /// Insert an entity. A null id is generated by the backend and
    /// assigned on the entity before returning; a caller-supplied id is
    /// used verbatim and collisions fail the operation.
    pub async fn insert(&self, entity: &mut Storable) -> StorageResult<()> {
        self.write_entity(entity, false).await
    }

    /// Insert an entity, replacing any existing row with the same key.
    /// Id handling matches [`insert`](Self::insert).
    pub async fn insert_or_update(&self, entity: &mut Storable) -> StorageResult<()> {
        self.write_entity(entity, true).await
    }

    /// Return every entity stored under a namespace.
    pub async fn select(&self, namespace: &str) -> StorageResult<Vec<Storable>> {
        let descriptor = QueryDescriptor::select_all(namespace);
        let prepared = self.cache.get(&descriptor);

        debug!(sql = %prepared.sql, "Executing query");
        self.fetch_entities(&prepared.sql, &[], namespace).await
    }

    /// Return entities matching a key's field predicate. Partial keys are
    /// allowed, so 0, 1 or more rows may come back.
    pub async fn select_where(&self, key: &StorableKey) -> StorageResult<Vec<Storable>> {
        let descriptor = QueryDescriptor::select_where(key);
        let prepared = self.cache.get(&descriptor);
        let binds = bind_values(key.fields(), &prepared.bind_columns);

        debug!(sql = %prepared.sql, params = binds.len(), "Executing query");
        self.fetch_entities(&prepared.sql, &binds, key.namespace())
            .await
    }

    /// Delete entities matching a key. Returns the number of rows removed.
    pub async fn delete(&self, key: &StorableKey) -> StorageResult<u64> {
        let descriptor = QueryDescriptor::delete(key);
        let prepared = self.cache.get(&descriptor);
        let binds = bind_values(key.fields(), &prepared.bind_columns);

        debug!(sql = %prepared.sql, params = binds.len(), "Executing delete");
        let outcome = self.execute_write(&prepared.sql, &binds).await?;
        Ok(outcome.rows_affected)
    }

    /// Issue a fresh id for a namespace ahead of any insert.
    ///
    /// Returns `None` when the dialect generates ids during insert
    /// instead; callers then pass a null id and let insert assign it.
    pub async fn next_id(&self, namespace: &str) -> StorageResult<Option<i64>> {
        let dialect = self.pool.dialect();
        let Some(sql) = dialect.next_id_sql(namespace) else {
            return Ok(None);
        };

        debug!(sql = %sql, "Issuing id");
        match self.fetch_generated_id(&sql, &[]).await? {
            Some(id) => Ok(Some(id)),
            None => Err(StorageError::execution(
                format!("namespace '{}' has no id sequence", namespace),
                None,
            )),
        }
    }

    async fn write_entity(&self, entity: &mut Storable, upsert: bool) -> StorageResult<()> {
        let descriptor = if upsert {
            QueryDescriptor::upsert(entity)
        } else {
            QueryDescriptor::insert(entity)
        };
        let prepared = self.cache.get(&descriptor);

        debug!(
            sql = %prepared.sql,
            params = prepared.bind_columns.len(),
            "Executing write"
        );

        let generated = {
            let binds = bind_values(entity.fields(), &prepared.bind_columns);
            if entity.id().is_some() {
                self.execute_write(&prepared.sql, &binds).await?;
                None
            } else {
                match self.pool.dialect().generated_keys() {
                    GeneratedKeys::Returning => {
                        self.fetch_generated_id(&prepared.sql, &binds).await?
                    }
                    GeneratedKeys::LastInsertId => {
                        let outcome = self.execute_write(&prepared.sql, &binds).await?;
                        // An upsert that lands on an existing row issues no
                        // fresh key; MySQL reports 2 affected rows (or 0 for
                        // an identical row) on that branch.
                        if outcome.rows_affected == 1 {
                            outcome.last_insert_id
                        } else {
                            None
                        }
                    }
                    GeneratedKeys::Unsupported => {
                        // Plain insert, nothing written back. Callers must
                        // pre-populate ids for such a backend.
                        self.execute_write(&prepared.sql, &binds).await?;
                        None
                    }
                }
            }
        };

        if let Some(id) = generated {
            entity.set_id(id);
        }
        Ok(())
    }

    async fn execute_write(&self, sql: &str, binds: &[&FieldValue]) -> StorageResult<ExecOutcome> {
        let mut slot = self.tx_slot.lock().await;
        match slot.as_mut() {
            Some(conn) => match conn {
                TxConn::MySql(conn) => {
                    mysql::execute(&mut **conn, sql, binds, self.query_timeout).await
                }
                TxConn::Postgres(conn) => {
                    postgres::execute(&mut **conn, sql, binds, self.query_timeout).await
                }
                TxConn::Sqlite(conn) => {
                    sqlite::execute(&mut **conn, sql, binds, self.query_timeout).await
                }
            },
            None => {
                drop(slot);
                match &self.pool {
                    DbPool::MySql(pool) => {
                        mysql::execute(pool, sql, binds, self.query_timeout).await
                    }
                    DbPool::Postgres(pool) => {
                        postgres::execute(pool, sql, binds, self.query_timeout).await
                    }
                    DbPool::Sqlite(pool) => {
                        sqlite::execute(pool, sql, binds, self.query_timeout).await
                    }
                }
            }
        }
    }

    async fn fetch_entities(
        &self,
        sql: &str,
        binds: &[&FieldValue],
        namespace: &str,
    ) -> StorageResult<Vec<Storable>> {
        let mut slot = self.tx_slot.lock().await;
        match slot.as_mut() {
            Some(conn) => match conn {
                TxConn::MySql(conn) => {
                    mysql::fetch_entities(&mut **conn, sql, binds, namespace, self.query_timeout)
                        .await
                }
                TxConn::Postgres(conn) => {
                    postgres::fetch_entities(&mut **conn, sql, binds, namespace, self.query_timeout)
                        .await
                }
                TxConn::Sqlite(conn) => {
                    sqlite::fetch_entities(&mut **conn, sql, binds, namespace, self.query_timeout)
                        .await
                }
            },
            None => {
                drop(slot);
                match &self.pool {
                    DbPool::MySql(pool) => {
                        mysql::fetch_entities(pool, sql, binds, namespace, self.query_timeout).await
                    }
                    DbPool::Postgres(pool) => {
                        postgres::fetch_entities(pool, sql, binds, namespace, self.query_timeout)
                            .await
                    }
                    DbPool::Sqlite(pool) => {
                        sqlite::fetch_entities(pool, sql, binds, namespace, self.query_timeout)
                            .await
                    }
                }
            }
        }
    }

    async fn fetch_generated_id(
        &self,
        sql: &str,
        binds: &[&FieldValue],
    ) -> StorageResult<Option<i64>> {
        let mut slot = self.tx_slot.lock().await;
        match slot.as_mut() {
            Some(conn) => match conn {
                TxConn::MySql(conn) => {
                    mysql::fetch_id(&mut **conn, sql, binds, self.query_timeout).await
                }
                TxConn::Postgres(conn) => {
                    postgres::fetch_id(&mut **conn, sql, binds, self.query_timeout).await
                }
                TxConn::Sqlite(conn) => {
                    sqlite::fetch_id(&mut **conn, sql, binds, self.query_timeout).await
                }
            },
            None => {
                drop(slot);
                match &self.pool {
                    DbPool::MySql(pool) => {
                        mysql::fetch_id(pool, sql, binds, self.query_timeout).await
                    }
                    DbPool::Postgres(pool) => {
                        postgres::fetch_id(pool, sql, binds, self.query_timeout).await
                    }
                    DbPool::Sqlite(pool) => {
                        sqlite::fetch_id(pool, sql, binds, self.query_timeout).await
                    }
                }
            }
        }
    }
}

// =============================================================================
// Common Helper Functions
// =============================================================================

/// Result of a write statement.
struct ExecOutcome {
    rows_affected: u64,
    last_insert_id: Option<i64>,
}

/// Resolve bind values for the rendered column order. A column with no
/// field on the entity binds as null.
fn bind_values<'a>(
    fields: &'a BTreeMap<String, FieldValue>,
    columns: &'a [String],
) -> Vec<&'a FieldValue> {
    static NULL: FieldValue = FieldValue::Null;
    columns
        .iter()
        .map(|column| fields.get(column).unwrap_or(&NULL))
        .collect()
}

/// Await a statement future, bounded by the configured timeout when one
/// is set. Elapsing surfaces as a timeout error, never a partial result.
async fn bounded<T, F>(limit: Option<Duration>, operation: &str, fut: F) -> StorageResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match limit {
        Some(limit) => match timeout(limit, fut).await {
            Ok(result) => result.map_err(StorageError::from),
            Err(_) => Err(StorageError::timeout(operation, limit.as_secs())),
        },
        None => fut.await.map_err(StorageError::from),
    }
}

/// Logical shape of a result column, used to pick the decode path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Boolean,
    Integer,
    Float,
    Binary,
    Text,
    Other,
}

/// Classify a database type name into a decode category.
fn classify_column(type_name: &str) -> ColumnKind {
    let lower = type_name.to_lowercase();

    if lower == "bool" || lower == "boolean" {
        return ColumnKind::Boolean;
    }
    if lower.contains("int") || lower.contains("serial") {
        return ColumnKind::Integer;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return ColumnKind::Float;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return ColumnKind::Binary;
    }
    if lower.contains("char") || lower.contains("text") || lower.contains("clob") {
        return ColumnKind::Text;
    }
    ColumnKind::Other
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database
// type. The code structure is intentionally parallel to make differences
// obvious.

mod mysql {
    use super::*;
    use sqlx::MySql;
    use sqlx::mysql::{MySqlArguments, MySqlRow};

    pub async fn execute<'e, E>(
        executor: E,
        sql: &str,
        binds: &[&FieldValue],
        limit: Option<Duration>,
    ) -> StorageResult<ExecOutcome>
    where
        E: sqlx::Executor<'e, Database = MySql>,
    {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = bind_value(query, value);
        }
        let result = bounded(limit, "write operation", query.execute(executor)).await?;

        let last = result.last_insert_id();
        Ok(ExecOutcome {
            rows_affected: result.rows_affected(),
            last_insert_id: if last == 0 {
                None
            } else {
                i64::try_from(last).ok()
            },
        })
    }

    pub async fn fetch_entities<'e, E>(
        executor: E,
        sql: &str,
        binds: &[&FieldValue],
        namespace: &str,
        limit: Option<Duration>,
    ) -> StorageResult<Vec<Storable>>
    where
        E: sqlx::Executor<'e, Database = MySql>,
    {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = bind_value(query, value);
        }
        let rows = bounded(limit, "query execution", query.fetch_all(executor)).await?;
        Ok(rows
            .iter()
            .map(|row| row_to_storable(row, namespace))
            .collect())
    }

    pub async fn fetch_id<'e, E>(
        executor: E,
        sql: &str,
        binds: &[&FieldValue],
        limit: Option<Duration>,
    ) -> StorageResult<Option<i64>>
    where
        E: sqlx::Executor<'e, Database = MySql>,
    {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = bind_value(query, value);
        }
        let row = bounded(limit, "key retrieval", query.fetch_one(executor)).await?;
        decode_id(&row)
    }

    fn decode_id(row: &MySqlRow) -> StorageResult<Option<i64>> {
        if let Ok(value) = row.try_get::<Option<i64>, _>(0) {
            return Ok(value);
        }
        row.try_get::<Option<u64>, _>(0)
            .map(|value| value.and_then(|v| i64::try_from(v).ok()))
            .map_err(StorageError::from)
    }

    fn bind_value<'q>(
        query: sqlx::query::Query<'q, MySql, MySqlArguments>,
        value: &'q FieldValue,
    ) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
        match value {
            FieldValue::Null => query.bind(None::<String>),
            FieldValue::Bool(v) => query.bind(*v),
            FieldValue::Int(v) => query.bind(*v),
            FieldValue::Float(v) => query.bind(*v),
            FieldValue::String(v) => query.bind(v.as_str()),
            FieldValue::Bytes(v) => query.bind(v.as_slice()),
        }
    }

    fn row_to_storable(row: &MySqlRow, namespace: &str) -> Storable {
        let mut entity = Storable::new(namespace);
        for (idx, col) in row.columns().iter().enumerate() {
            let kind = classify_column(col.type_info().name());
            entity.set_field(col.name(), decode_column(row, idx, kind));
        }
        entity
    }

    fn decode_column(row: &MySqlRow, idx: usize, kind: ColumnKind) -> FieldValue {
        match kind {
            ColumnKind::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(FieldValue::Bool)
                .unwrap_or(FieldValue::Null),
            ColumnKind::Integer => decode_integer(row, idx),
            ColumnKind::Float => decode_float(row, idx),
            ColumnKind::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(FieldValue::Bytes)
                .unwrap_or(FieldValue::Null),
            ColumnKind::Text => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(FieldValue::String)
                .unwrap_or(FieldValue::Null),
            ColumnKind::Other => decode_fallback(row, idx),
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> FieldValue {
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return FieldValue::Int(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
            return i64::try_from(v)
                .map(FieldValue::Int)
                .unwrap_or(FieldValue::Null);
        }
        FieldValue::Null
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> FieldValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return FieldValue::Float(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return FieldValue::Float(v as f64);
        }
        FieldValue::Null
    }

    fn decode_fallback(row: &MySqlRow, idx: usize) -> FieldValue {
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
            return FieldValue::String(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return FieldValue::Int(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return FieldValue::Float(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return FieldValue::Bytes(v);
        }
        debug!(column = idx, "Could not decode column, storing null");
        FieldValue::Null
    }
}

mod postgres {
    use super::*;
    use sqlx::Postgres;
    use sqlx::postgres::{PgArguments, PgRow};

    pub async fn execute<'e, E>(
        executor: E,
        sql: &str,
        binds: &[&FieldValue],
        limit: Option<Duration>,
    ) -> StorageResult<ExecOutcome>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = bind_value(query, value);
        }
        let result = bounded(limit, "write operation", query.execute(executor)).await?;

        Ok(ExecOutcome {
            rows_affected: result.rows_affected(),
            last_insert_id: None,
        })
    }

    pub async fn fetch_entities<'e, E>(
        executor: E,
        sql: &str,
        binds: &[&FieldValue],
        namespace: &str,
        limit: Option<Duration>,
    ) -> StorageResult<Vec<Storable>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = bind_value(query, value);
        }
        let rows = bounded(limit, "query execution", query.fetch_all(executor)).await?;
        Ok(rows
            .iter()
            .map(|row| row_to_storable(row, namespace))
            .collect())
    }

    pub async fn fetch_id<'e, E>(
        executor: E,
        sql: &str,
        binds: &[&FieldValue],
        limit: Option<Duration>,
    ) -> StorageResult<Option<i64>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = bind_value(query, value);
        }
        let row = bounded(limit, "key retrieval", query.fetch_one(executor)).await?;
        decode_id(&row)
    }

    fn decode_id(row: &PgRow) -> StorageResult<Option<i64>> {
        if let Ok(value) = row.try_get::<Option<i64>, _>(0) {
            return Ok(value);
        }
        row.try_get::<Option<i32>, _>(0)
            .map(|value| value.map(i64::from))
            .map_err(StorageError::from)
    }

    fn bind_value<'q>(
        query: sqlx::query::Query<'q, Postgres, PgArguments>,
        value: &'q FieldValue,
    ) -> sqlx::query::Query<'q, Postgres, PgArguments> {
        match value {
            FieldValue::Null => query.bind(None::<String>),
            FieldValue::Bool(v) => query.bind(*v),
            FieldValue::Int(v) => query.bind(*v),
            FieldValue::Float(v) => query.bind(*v),
            FieldValue::String(v) => query.bind(v.as_str()),
            FieldValue::Bytes(v) => query.bind(v.as_slice()),
        }
    }

    fn row_to_storable(row: &PgRow, namespace: &str) -> Storable {
        let mut entity = Storable::new(namespace);
        for (idx, col) in row.columns().iter().enumerate() {
            let kind = classify_column(col.type_info().name());
            entity.set_field(col.name(), decode_column(row, idx, kind));
        }
        entity
    }

    fn decode_column(row: &PgRow, idx: usize, kind: ColumnKind) -> FieldValue {
        match kind {
            ColumnKind::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(FieldValue::Bool)
                .unwrap_or(FieldValue::Null),
            ColumnKind::Integer => decode_integer(row, idx),
            ColumnKind::Float => decode_float(row, idx),
            ColumnKind::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(FieldValue::Bytes)
                .unwrap_or(FieldValue::Null),
            ColumnKind::Text => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(FieldValue::String)
                .unwrap_or(FieldValue::Null),
            ColumnKind::Other => decode_fallback(row, idx),
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> FieldValue {
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return FieldValue::Int(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return FieldValue::Int(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return FieldValue::Int(v.into());
        }
        FieldValue::Null
    }

    fn decode_float(row: &PgRow, idx: usize) -> FieldValue {
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return FieldValue::Float(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
            return FieldValue::Float(v as f64);
        }
        FieldValue::Null
    }

    fn decode_fallback(row: &PgRow, idx: usize) -> FieldValue {
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
            return FieldValue::String(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return FieldValue::Int(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return FieldValue::Float(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return FieldValue::Bytes(v);
        }
        debug!(column = idx, "Could not decode column, storing null");
        FieldValue::Null
    }
}

mod sqlite {
    use super::*;
    use sqlx::Sqlite;
    use sqlx::sqlite::{SqliteArguments, SqliteRow};

    pub async fn execute<'e, E>(
        executor: E,
        sql: &str,
        binds: &[&FieldValue],
        limit: Option<Duration>,
    ) -> StorageResult<ExecOutcome>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = bind_value(query, value);
        }
        let result = bounded(limit, "write operation", query.execute(executor)).await?;

        let last = result.last_insert_rowid();
        Ok(ExecOutcome {
            rows_affected: result.rows_affected(),
            last_insert_id: if last == 0 { None } else { Some(last) },
        })
    }

    pub async fn fetch_entities<'e, E>(
        executor: E,
        sql: &str,
        binds: &[&FieldValue],
        namespace: &str,
        limit: Option<Duration>,
    ) -> StorageResult<Vec<Storable>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = bind_value(query, value);
        }
        let rows = bounded(limit, "query execution", query.fetch_all(executor)).await?;
        Ok(rows
            .iter()
            .map(|row| row_to_storable(row, namespace))
            .collect())
    }

    pub async fn fetch_id<'e, E>(
        executor: E,
        sql: &str,
        binds: &[&FieldValue],
        limit: Option<Duration>,
    ) -> StorageResult<Option<i64>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = bind_value(query, value);
        }
        let row = bounded(limit, "key retrieval", query.fetch_one(executor)).await?;
        row.try_get::<Option<i64>, _>(0).map_err(StorageError::from)
    }

    fn bind_value<'q>(
        query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
        value: &'q FieldValue,
    ) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
        match value {
            FieldValue::Null => query.bind(None::<String>),
            FieldValue::Bool(v) => query.bind(*v),
            FieldValue::Int(v) => query.bind(*v),
            FieldValue::Float(v) => query.bind(*v),
            FieldValue::String(v) => query.bind(v.as_str()),
            FieldValue::Bytes(v) => query.bind(v.as_slice()),
        }
    }

    fn row_to_storable(row: &SqliteRow, namespace: &str) -> Storable {
        let mut entity = Storable::new(namespace);
        for (idx, col) in row.columns().iter().enumerate() {
            let kind = classify_column(col.type_info().name());
            entity.set_field(col.name(), decode_column(row, idx, kind));
        }
        entity
    }

    fn decode_column(row: &SqliteRow, idx: usize, kind: ColumnKind) -> FieldValue {
        match kind {
            ColumnKind::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(FieldValue::Bool)
                .unwrap_or(FieldValue::Null),
            ColumnKind::Integer => row
                .try_get::<Option<i64>, _>(idx)
                .ok()
                .flatten()
                .map(FieldValue::Int)
                .unwrap_or(FieldValue::Null),
            ColumnKind::Float => row
                .try_get::<Option<f64>, _>(idx)
                .ok()
                .flatten()
                .map(FieldValue::Float)
                .unwrap_or(FieldValue::Null),
            ColumnKind::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(FieldValue::Bytes)
                .unwrap_or(FieldValue::Null),
            ColumnKind::Text => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(FieldValue::String)
                .unwrap_or(FieldValue::Null),
            ColumnKind::Other => decode_fallback(row, idx),
        }
    }

    fn decode_fallback(row: &SqliteRow, idx: usize) -> FieldValue {
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return FieldValue::Int(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return FieldValue::Float(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
            return FieldValue::String(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return FieldValue::Bytes(v);
        }
        debug!(column = idx, "Could not decode column, storing null");
        FieldValue::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionConfig, PROP_DATA_SOURCE_CLASS, PROP_DATA_SOURCE_URL};
    use crate::storable::ID_FIELD;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::TempDir;

    async fn sqlite_executor(dir: &TempDir) -> QueryExecutor {
        let mut props = HashMap::new();
        props.insert(PROP_DATA_SOURCE_CLASS.to_string(), json!("sqlite"));
        props.insert(
            PROP_DATA_SOURCE_URL.to_string(),
            json!(format!(
                "sqlite://{}",
                dir.path().join("store.db").display()
            )),
        );
        let config = ExecutionConfig::from_properties(&props).unwrap();
        let pool = DbPool::connect(&config, Dialect::Sqlite).await.unwrap();

        if let DbPool::Sqlite(p) = &pool {
            sqlx::query(
                "CREATE TABLE \"widgets\" (\
                 \"id\" INTEGER PRIMARY KEY AUTOINCREMENT, \
                 \"name\" TEXT, \
                 \"weight\" REAL)",
            )
            .execute(p)
            .await
            .unwrap();
        }

        let cache = Arc::new(StatementCache::new(Dialect::Sqlite, 16));
        QueryExecutor::new(pool, cache, Arc::new(TransactionSlot::new()), None)
    }

    fn widget(name: &str, weight: f64) -> Storable {
        Storable::new("widgets")
            .with_field(ID_FIELD, FieldValue::Null)
            .with_field("name", name)
            .with_field("weight", weight)
    }

    #[tokio::test]
    async fn test_insert_assigns_generated_id() {
        let dir = TempDir::new().unwrap();
        let executor = sqlite_executor(&dir).await;

        let mut entity = widget("anvil", 2.5);
        executor.insert(&mut entity).await.unwrap();
        let id = entity.id().expect("id assigned");

        let key = StorableKey::new("widgets").with_field(ID_FIELD, id);
        let found = executor.select_where(&key).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].field("name"),
            Some(&FieldValue::String("anvil".into()))
        );
        assert_eq!(found[0].field("weight"), Some(&FieldValue::Float(2.5)));
        assert_eq!(found[0].id(), Some(id));
    }

    #[tokio::test]
    async fn test_generated_ids_are_distinct() {
        let dir = TempDir::new().unwrap();
        let executor = sqlite_executor(&dir).await;

        let mut first = widget("anvil", 1.0);
        let mut second = widget("hammer", 2.0);
        executor.insert(&mut first).await.unwrap();
        executor.insert(&mut second).await.unwrap();

        assert_ne!(first.id().unwrap(), second.id().unwrap());
    }

    #[tokio::test]
    async fn test_insert_uses_supplied_id() {
        let dir = TempDir::new().unwrap();
        let executor = sqlite_executor(&dir).await;

        let mut entity = widget("anvil", 1.0);
        entity.set_id(42);
        executor.insert(&mut entity).await.unwrap();
        assert_eq!(entity.id(), Some(42));

        let key = StorableKey::new("widgets").with_field(ID_FIELD, 42i64);
        let found = executor.select_where(&key).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), Some(42));
    }

    #[tokio::test]
    async fn test_duplicate_id_insert_fails_as_unique_violation() {
        let dir = TempDir::new().unwrap();
        let executor = sqlite_executor(&dir).await;

        let mut entity = widget("anvil", 1.0);
        entity.set_id(7);
        executor.insert(&mut entity).await.unwrap();

        let mut duplicate = widget("hammer", 2.0);
        duplicate.set_id(7);
        let err = executor.insert(&mut duplicate).await.unwrap_err();
        assert!(err.is_unique_violation(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_row() {
        let dir = TempDir::new().unwrap();
        let executor = sqlite_executor(&dir).await;

        let mut entity = widget("anvil", 1.0);
        executor.insert_or_update(&mut entity).await.unwrap();
        let id = entity.id().unwrap();

        let mut replacement = widget("anvil mk2", 3.0);
        replacement.set_id(id);
        executor.insert_or_update(&mut replacement).await.unwrap();

        let key = StorableKey::new("widgets").with_field(ID_FIELD, id);
        let found = executor.select_where(&key).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].field("name"),
            Some(&FieldValue::String("anvil mk2".into()))
        );
        assert_eq!(found[0].field("weight"), Some(&FieldValue::Float(3.0)));
    }

    #[tokio::test]
    async fn test_select_namespace_returns_all_rows() {
        let dir = TempDir::new().unwrap();
        let executor = sqlite_executor(&dir).await;

        assert!(executor.select("widgets").await.unwrap().is_empty());

        let mut first = widget("anvil", 1.0);
        let mut second = widget("hammer", 2.0);
        executor.insert(&mut first).await.unwrap();
        executor.insert(&mut second).await.unwrap();

        let all = executor.select("widgets").await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_by_key() {
        let dir = TempDir::new().unwrap();
        let executor = sqlite_executor(&dir).await;

        let mut entity = widget("anvil", 1.0);
        executor.insert(&mut entity).await.unwrap();
        let key = StorableKey::new("widgets").with_field(ID_FIELD, entity.id().unwrap());

        assert_eq!(executor.delete(&key).await.unwrap(), 1);
        assert!(executor.select_where(&key).await.unwrap().is_empty());
        assert_eq!(executor.delete(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_next_id_unsupported_returns_none() {
        let dir = TempDir::new().unwrap();
        let executor = sqlite_executor(&dir).await;
        assert_eq!(executor.next_id("widgets").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_select_by_partial_key_matches_many() {
        let dir = TempDir::new().unwrap();
        let executor = sqlite_executor(&dir).await;

        let mut first = widget("anvil", 1.0);
        let mut second = widget("anvil", 9.0);
        executor.insert(&mut first).await.unwrap();
        executor.insert(&mut second).await.unwrap();

        let key = StorableKey::new("widgets").with_field("name", "anvil");
        assert_eq!(executor.select_where(&key).await.unwrap().len(), 2);
    }
}
