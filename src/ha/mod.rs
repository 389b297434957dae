//! High-availability peer coordination.
//!
//! Each running server registers itself as a durable `host_config` record
//! and keeps a view of every other registered server. The coordinator in
//! [`coordinator`] drives registration and periodic refresh; [`notifier`]
//! carries best-effort join announcements to peers.

pub mod coordinator;
pub mod notifier;

use crate::storable::{FieldValue, Storable, StorableKey, ID_FIELD};

/// Namespace holding one record per registered server.
pub const HOST_CONFIG_NAMESPACE: &str = "host_config";

/// Column storing the server's advertised URL. Also the record's key.
pub const HOST_URL_FIELD: &str = "host_url";

/// Column storing the registration time in epoch milliseconds.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Builds the record registering `server_url`, stamped with the current
/// time. Pass `None` for the id when the backend assigns one during insert.
pub fn host_config(id: Option<i64>, server_url: &str) -> Storable {
    let mut entity = Storable::new(HOST_CONFIG_NAMESPACE)
        .with_key_fields(&[HOST_URL_FIELD])
        .with_field(ID_FIELD, FieldValue::Null)
        .with_field(HOST_URL_FIELD, server_url)
        .with_field(TIMESTAMP_FIELD, chrono::Utc::now().timestamp_millis());
    if let Some(id) = id {
        entity.set_id(id);
    }
    entity
}

/// Key locating the registration record for `server_url`.
pub fn host_config_key(server_url: &str) -> StorableKey {
    StorableKey::new(HOST_CONFIG_NAMESPACE).with_field(HOST_URL_FIELD, server_url)
}

/// Reads the advertised URL out of a `host_config` record.
pub fn host_url(entity: &Storable) -> Option<&str> {
    entity.field(HOST_URL_FIELD).and_then(FieldValue::as_str)
}
