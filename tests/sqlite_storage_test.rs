//! Integration tests for the SQL storage layer over SQLite.
//!
//! Tests verify that:
//! - Inserts without an id receive backend-generated, unique ids
//! - Upserts replace rows in place
//! - Reads return field-equal entities and deletes remove them
//! - Concurrent inserts never collide on generated ids
//! - Uncommitted writes stay invisible to other connections
//! - Configuration validation runs before any connection attempt

use registry_store::config::{
    ExecutionConfig, PROP_DATA_SOURCE_CLASS, PROP_DATA_SOURCE_URL, PROP_QUERY_TIMEOUT_SECS,
};
use registry_store::db::{DbPool, IsolationLevel, TransactionManager};
use registry_store::error::StorageError;
use registry_store::storable::{FieldValue, ID_FIELD, Storable, StorableKey};
use registry_store::storage::{SqlStorageManager, StorageManager};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

fn sqlite_props(dir: &TempDir) -> HashMap<String, serde_json::Value> {
    let mut props = HashMap::new();
    props.insert(PROP_DATA_SOURCE_CLASS.to_string(), json!("sqlite"));
    props.insert(
        PROP_DATA_SOURCE_URL.to_string(),
        json!(format!(
            "sqlite://{}",
            dir.path().join("store.db").display()
        )),
    );
    props
}

/// Open a manager on a fresh database file and create the test table.
async fn setup_store(dir: &TempDir) -> Arc<SqlStorageManager> {
    let manager = Arc::new(
        SqlStorageManager::from_properties(&sqlite_props(dir))
            .await
            .unwrap(),
    );
    let DbPool::Sqlite(pool) = manager.pool() else {
        panic!("expected a sqlite pool");
    };
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS \"schema_info\" (\
         \"id\" INTEGER PRIMARY KEY AUTOINCREMENT, \
         \"name\" TEXT, \
         \"version\" INTEGER)",
    )
    .execute(pool)
    .await
    .unwrap();
    manager
}

fn schema_info(name: &str, version: i64) -> Storable {
    Storable::new("schema_info")
        .with_field(ID_FIELD, FieldValue::Null)
        .with_field("name", name)
        .with_field("version", version)
}

#[tokio::test]
async fn test_insert_without_id_assigns_unique_ids() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let mut entity = schema_info(&format!("schema-{i}"), 1);
        store.add(&mut entity).await.unwrap();
        ids.push(entity.id().expect("generated id"));
    }

    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 5);
    store.close().await;
}

#[tokio::test]
async fn test_inserted_entity_reads_back_field_equal() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir).await;

    let mut entity = schema_info("avro-events", 3);
    store.add(&mut entity).await.unwrap();
    let id = entity.id().unwrap();

    let key = StorableKey::new("schema_info").with_field(ID_FIELD, id);
    let fetched = store.get(&key).await.unwrap().expect("row present");

    let mut expected = schema_info("avro-events", 3);
    expected.set_id(id);
    assert_eq!(fetched, expected);
    store.close().await;
}

#[tokio::test]
async fn test_upsert_replaces_existing_row() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir).await;

    let mut entity = schema_info("avro-events", 1);
    store.add(&mut entity).await.unwrap();
    let id = entity.id().unwrap();

    let mut replacement = schema_info("avro-events", 2);
    replacement.set_id(id);
    store.add_or_update(&mut replacement).await.unwrap();

    let rows = store.list("schema_info").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].field("version"), Some(&FieldValue::Int(2)));
    store.close().await;
}

#[tokio::test]
async fn test_remove_returns_entity_then_nothing() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir).await;

    let mut entity = schema_info("json-orders", 1);
    store.add(&mut entity).await.unwrap();
    let key = StorableKey::new("schema_info").with_field(ID_FIELD, entity.id().unwrap());

    let removed = store.remove(&key).await.unwrap().expect("entity removed");
    assert_eq!(
        removed.field("name"),
        Some(&FieldValue::String("json-orders".into()))
    );
    assert!(store.get(&key).await.unwrap().is_none());
    assert!(store.remove(&key).await.unwrap().is_none());
    store.close().await;
}

#[tokio::test]
async fn test_concurrent_inserts_get_distinct_ids() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut entity = schema_info(&format!("concurrent-{i}"), 1);
            store.add(&mut entity).await.unwrap();
            entity.id().expect("generated id")
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }

    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 16);
    assert_eq!(store.list("schema_info").await.unwrap().len(), 16);
    store.close().await;
}

#[tokio::test]
async fn test_uncommitted_write_invisible_to_other_connection() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir).await;
    let observer = Arc::new(
        SqlStorageManager::from_properties(&sqlite_props(&dir))
            .await
            .unwrap(),
    );

    store
        .begin_transaction(IsolationLevel::ReadCommitted)
        .await
        .unwrap();
    let mut entity = schema_info("pending", 1);
    store.add(&mut entity).await.unwrap();

    assert!(observer.list("schema_info").await.unwrap().is_empty());

    store.commit_transaction().await.unwrap();
    assert_eq!(observer.list("schema_info").await.unwrap().len(), 1);

    observer.close().await;
    store.close().await;
}

#[tokio::test]
async fn test_missing_timeout_key_disables_timeout() {
    let mut props = HashMap::new();
    props.insert(PROP_DATA_SOURCE_CLASS.to_string(), json!("X"));
    props.insert(PROP_DATA_SOURCE_URL.to_string(), json!("jdbc:db://host/db"));

    let config = ExecutionConfig::from_properties(&props).unwrap();
    assert_eq!(config.query_timeout(), None);
}

#[tokio::test]
async fn test_negative_timeout_fails_before_any_connection() {
    let mut props = HashMap::new();
    props.insert(PROP_DATA_SOURCE_CLASS.to_string(), json!("X"));
    props.insert(PROP_DATA_SOURCE_URL.to_string(), json!("jdbc:db://host/db"));
    props.insert(PROP_QUERY_TIMEOUT_SECS.to_string(), json!(-1));

    let err = ExecutionConfig::from_properties(&props).unwrap_err();
    assert!(matches!(err, StorageError::Configuration { .. }));
}
