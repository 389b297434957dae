//! Entity data model for the storage layer.
//!
//! A [`Storable`] is a named bag of typed fields persisted to one table
//! (its namespace). The subset of fields listed in `key_fields` identifies
//! the entity; [`StorableKey`] is that subset extracted as a lookup value.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Field name that carries the entity identity.
pub const ID_FIELD: &str = "id";

/// A typed field value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
        }
    }

    /// Get the integer value, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

// Floats compare and hash by bit pattern so values are usable inside keys.
impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl Hash for FieldValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(v) => v.hash(state),
            Self::Float(v) => v.to_bits().hash(state),
            Self::String(s) => s.hash(state),
            Self::Bytes(b) => b.hash(state),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A persistable entity instance.
///
/// Fields are kept in a `BTreeMap` so column order is deterministic for a
/// given field set, which keeps rendered SQL and parameter binding stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Storable {
    namespace: String,
    fields: BTreeMap<String, FieldValue>,
    key_fields: Vec<String>,
}

impl Storable {
    /// Create an empty storable keyed by its `id` field.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            fields: BTreeMap::new(),
            key_fields: vec![ID_FIELD.to_string()],
        }
    }

    /// Set a field (builder form).
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Replace the identifying field names (builder form).
    pub fn with_key_fields(mut self, names: &[&str]) -> Self {
        self.key_fields = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Set a field.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Get a field value.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Logical table name this entity belongs to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// All fields in column order.
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Names of the identifying fields.
    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    /// Column names in binding order.
    pub fn column_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    /// The assigned identity, if any. A missing or NULL `id` field means
    /// the identity has not been issued yet.
    pub fn id(&self) -> Option<i64> {
        self.fields.get(ID_FIELD).and_then(FieldValue::as_i64)
    }

    /// Assign the identity.
    pub fn set_id(&mut self, id: i64) {
        self.fields.insert(ID_FIELD.to_string(), FieldValue::Int(id));
    }

    /// Extract the identifying key. Unset key fields appear as NULL.
    pub fn key(&self) -> StorableKey {
        let mut key = StorableKey::new(self.namespace.clone());
        for name in &self.key_fields {
            let value = self.fields.get(name).cloned().unwrap_or(FieldValue::Null);
            key = key.with_field(name.clone(), value);
        }
        key
    }
}

// Entities are equal when they carry the same data, regardless of how the
// key-field configuration was spelled.
impl PartialEq for Storable {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.fields == other.fields
    }
}

impl Eq for Storable {}

/// The identifying subset of a storable's fields.
///
/// Keys built from the same fields in any insertion order compare and hash
/// equal; the `BTreeMap` keeps them sorted by field name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorableKey {
    namespace: String,
    fields: BTreeMap<String, FieldValue>,
}

impl StorableKey {
    /// Create an empty key for a namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add an identifying field (builder form).
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Logical table name this key selects from.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Identifying fields in column order.
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Column names in binding order.
    pub fn column_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_field_value_types() {
        assert!(FieldValue::Null.is_null());
        assert!(!FieldValue::Bool(true).is_null());
        assert_eq!(FieldValue::Int(42).type_name(), "int");
        assert_eq!(FieldValue::from("hello").type_name(), "string");
        assert_eq!(FieldValue::Int(42).as_i64(), Some(42));
        assert_eq!(FieldValue::from("hello").as_str(), Some("hello"));
        assert_eq!(FieldValue::Null.as_i64(), None);
    }

    #[test]
    fn test_float_values_compare_by_bits() {
        assert_eq!(FieldValue::Float(1.5), FieldValue::Float(1.5));
        assert_ne!(FieldValue::Float(1.5), FieldValue::Float(2.5));
        assert_eq!(FieldValue::Float(f64::NAN), FieldValue::Float(f64::NAN));
        assert_eq!(
            hash_of(&FieldValue::Float(1.5)),
            hash_of(&FieldValue::Float(1.5))
        );
    }

    #[test]
    fn test_storable_id_lifecycle() {
        let mut entity = Storable::new("widgets")
            .with_field(ID_FIELD, FieldValue::Null)
            .with_field("name", "anvil");
        assert_eq!(entity.id(), None);

        entity.set_id(7);
        assert_eq!(entity.id(), Some(7));
    }

    #[test]
    fn test_key_is_order_independent() {
        let a = StorableKey::new("widgets")
            .with_field("name", "anvil")
            .with_field("size", 3i64);
        let b = StorableKey::new("widgets")
            .with_field("size", 3i64)
            .with_field("name", "anvil");

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_key_uses_configured_key_fields() {
        let entity = Storable::new("hosts")
            .with_key_fields(&["host_url"])
            .with_field(ID_FIELD, 1i64)
            .with_field("host_url", "http://a:8080");

        let key = entity.key();
        assert_eq!(key.column_names(), vec!["host_url".to_string()]);
        assert_eq!(
            key.fields().get("host_url"),
            Some(&FieldValue::from("http://a:8080"))
        );
    }

    #[test]
    fn test_unset_key_field_is_null() {
        let entity = Storable::new("hosts").with_key_fields(&["host_url"]);
        let key = entity.key();
        assert_eq!(key.fields().get("host_url"), Some(&FieldValue::Null));
    }

    #[test]
    fn test_storable_equality_is_field_wise() {
        let a = Storable::new("widgets")
            .with_field(ID_FIELD, 1i64)
            .with_field("name", "anvil");
        let b = Storable::new("widgets")
            .with_field("name", "anvil")
            .with_field(ID_FIELD, 1i64)
            .with_key_fields(&["name"]);

        assert_eq!(a, b);

        let c = Storable::new("widgets")
            .with_field(ID_FIELD, 2i64)
            .with_field("name", "anvil");
        assert_ne!(a, c);
    }

    #[test]
    fn test_column_names_are_sorted() {
        let entity = Storable::new("widgets")
            .with_field("zeta", 1i64)
            .with_field("alpha", 2i64)
            .with_field("mid", 3i64);
        assert_eq!(
            entity.column_names(),
            vec!["alpha".to_string(), "mid".to_string(), "zeta".to_string()]
        );
    }
}
