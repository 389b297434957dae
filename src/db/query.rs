//! Statement descriptors.
//!
//! A [`QueryDescriptor`] captures everything that determines the text of a
//! statement: the operation, the namespace, and the column layout. Two
//! descriptors that compare equal render byte-identical SQL for a given
//! dialect, which makes the descriptor the statement-cache key.

use crate::storable::{ID_FIELD, Storable, StorableKey};

/// Operation kinds the execution engine renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOp {
    Insert,
    Upsert,
    SelectAll,
    SelectWhere,
    Delete,
}

/// Identity of one renderable statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryDescriptor {
    op: QueryOp,
    namespace: String,
    /// Data columns in binding order. Empty for reads and deletes.
    columns: Vec<String>,
    /// Predicate or conflict-target columns in binding order.
    key_columns: Vec<String>,
}

impl QueryDescriptor {
    /// Descriptor for inserting an entity.
    ///
    /// An unassigned identity drops the `id` column from the statement so
    /// the backend issues one.
    pub fn insert(storable: &Storable) -> Self {
        Self {
            op: QueryOp::Insert,
            namespace: storable.namespace().to_string(),
            columns: data_columns(storable),
            key_columns: Vec::new(),
        }
    }

    /// Descriptor for inserting or replacing an entity by its key fields.
    pub fn upsert(storable: &Storable) -> Self {
        Self {
            op: QueryOp::Upsert,
            namespace: storable.namespace().to_string(),
            columns: data_columns(storable),
            key_columns: storable.key_fields().to_vec(),
        }
    }

    /// Descriptor for reading every row of a namespace.
    pub fn select_all(namespace: &str) -> Self {
        Self {
            op: QueryOp::SelectAll,
            namespace: namespace.to_string(),
            columns: Vec::new(),
            key_columns: Vec::new(),
        }
    }

    /// Descriptor for reading rows matching a key.
    pub fn select_where(key: &StorableKey) -> Self {
        Self {
            op: QueryOp::SelectWhere,
            namespace: key.namespace().to_string(),
            columns: Vec::new(),
            key_columns: key.column_names(),
        }
    }

    /// Descriptor for deleting rows matching a key.
    pub fn delete(key: &StorableKey) -> Self {
        Self {
            op: QueryOp::Delete,
            namespace: key.namespace().to_string(),
            columns: Vec::new(),
            key_columns: key.column_names(),
        }
    }

    pub fn op(&self) -> QueryOp {
        self.op
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }
}

fn data_columns(storable: &Storable) -> Vec<String> {
    storable
        .fields()
        .iter()
        .filter(|(name, value)| !(name.as_str() == ID_FIELD && value.is_null()))
        .map(|(name, _)| name.clone())
        .collect()
}

/// A rendered statement: SQL text plus the column order its placeholders
/// bind in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSql {
    pub sql: String,
    pub bind_columns: Vec<String>,
}
