//! SQL dialects.
//!
//! Everything a backend does differently lives here: identifier quoting,
//! placeholder syntax, upsert form, and how freshly generated identities
//! get back to the caller. The renderers are pure functions of a
//! [`QueryDescriptor`], so equal descriptors always produce identical SQL.

use std::fmt;

use crate::db::query::{PreparedSql, QueryDescriptor, QueryOp};
use crate::storable::ID_FIELD;

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Includes MariaDB
    MySql,
    Postgres,
    Sqlite,
}

/// How a dialect hands back identities it generated during an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratedKeys {
    /// The insert statement carries a `RETURNING` clause.
    Returning,
    /// The connection reports the last inserted id after the statement.
    LastInsertId,
    /// No retrieval mechanism. Inserts run as plain statements and callers
    /// must supply identities themselves.
    Unsupported,
}

impl Dialect {
    /// Get the display name for this dialect.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::MySql => "MySQL",
            Self::Postgres => "PostgreSQL",
            Self::Sqlite => "SQLite",
        }
    }

    /// Quote an identifier: backticks on MySQL, double quotes elsewhere.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", ident),
            Self::Postgres | Self::Sqlite => format!("\"{}\"", ident),
        }
    }

    /// Placeholder for the n-th bind parameter (1-based).
    fn placeholder(&self, n: usize) -> String {
        match self {
            Self::MySql | Self::Sqlite => "?".to_string(),
            Self::Postgres => format!("${}", n),
        }
    }

    /// Identity-retrieval strategy for inserts. Decided here, once, per
    /// dialect; callers branch on the returned value instead of probing
    /// with failing statements.
    ///
    /// SQLite uses RETURNING rather than `last_insert_rowid`, which goes
    /// stale when an upsert takes the update branch.
    pub fn generated_keys(&self) -> GeneratedKeys {
        match self {
            Self::MySql => GeneratedKeys::LastInsertId,
            Self::Postgres | Self::Sqlite => GeneratedKeys::Returning,
        }
    }

    /// Whether the dialect can issue an identity before any insert.
    pub fn supports_next_id(&self) -> bool {
        matches!(self, Self::Postgres)
    }

    /// Statement reading the next identity for a namespace, when the
    /// dialect supports out-of-band issuance. The namespace lands in a
    /// string literal, so single quotes are doubled.
    pub fn next_id_sql(&self, namespace: &str) -> Option<String> {
        match self {
            Self::Postgres => Some(format!(
                "SELECT nextval(pg_get_serial_sequence('{}', '{}'))",
                namespace.replace('\'', "''"),
                ID_FIELD
            )),
            Self::MySql | Self::Sqlite => None,
        }
    }

    /// Render a descriptor into SQL plus its bind layout.
    pub fn render(&self, descriptor: &QueryDescriptor) -> PreparedSql {
        match descriptor.op() {
            QueryOp::Insert => self.render_insert(descriptor, false),
            QueryOp::Upsert => self.render_insert(descriptor, true),
            QueryOp::SelectAll => PreparedSql {
                sql: format!(
                    "SELECT * FROM {}",
                    self.quote_ident(descriptor.namespace())
                ),
                bind_columns: Vec::new(),
            },
            QueryOp::SelectWhere => PreparedSql {
                sql: format!(
                    "SELECT * FROM {}{}",
                    self.quote_ident(descriptor.namespace()),
                    self.where_clause(descriptor.key_columns())
                ),
                bind_columns: descriptor.key_columns().to_vec(),
            },
            QueryOp::Delete => PreparedSql {
                sql: format!(
                    "DELETE FROM {}{}",
                    self.quote_ident(descriptor.namespace()),
                    self.where_clause(descriptor.key_columns())
                ),
                bind_columns: descriptor.key_columns().to_vec(),
            },
        }
    }

    fn render_insert(&self, descriptor: &QueryDescriptor, upsert: bool) -> PreparedSql {
        let columns = descriptor.columns();
        let column_list = columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let value_list = (1..=columns.len())
            .map(|n| self.placeholder(n))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote_ident(descriptor.namespace()),
            column_list,
            value_list
        );

        if upsert {
            match self {
                Self::MySql => {
                    let updates = columns
                        .iter()
                        .map(|c| {
                            let quoted = self.quote_ident(c);
                            format!("{} = VALUES({})", quoted, quoted)
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {}", updates));
                }
                Self::Postgres | Self::Sqlite => {
                    let targets = descriptor
                        .key_columns()
                        .iter()
                        .map(|c| self.quote_ident(c))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let updates = columns
                        .iter()
                        .map(|c| {
                            let quoted = self.quote_ident(c);
                            format!("{} = EXCLUDED.{}", quoted, quoted)
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    sql.push_str(&format!(
                        " ON CONFLICT ({}) DO UPDATE SET {}",
                        targets, updates
                    ));
                }
            }
        }

        // The statement hands back the issued identity when the id column
        // was omitted and the dialect supports RETURNING.
        if self.generated_keys() == GeneratedKeys::Returning
            && !columns.iter().any(|c| c == ID_FIELD)
        {
            sql.push_str(&format!(" RETURNING {}", self.quote_ident(ID_FIELD)));
        }

        PreparedSql {
            sql,
            bind_columns: columns.to_vec(),
        }
    }

    fn where_clause(&self, key_columns: &[String]) -> String {
        if key_columns.is_empty() {
            return String::new();
        }
        let predicates = key_columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", self.quote_ident(c), self.placeholder(i + 1)))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(" WHERE {}", predicates)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
