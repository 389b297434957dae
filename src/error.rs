//! Error types for the storage layer.
//!
//! All errors are defined with `thiserror`. Variants carry enough context
//! (SQLSTATE codes, suggestions) for callers to log something actionable
//! without chasing the source chain.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Rejected settings. Raised before any connection is attempted.
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    /// A statement was sent to the database and the database refused it.
    #[error("Query failed: {message}")]
    Execution {
        message: String,
        /// e.g. "23505" for a unique violation
        sql_state: Option<String>,
    },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout { operation: String, elapsed_secs: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StorageError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an execution error with optional SQL state.
    pub fn execution(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Execution {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the backend SQLSTATE for this error, if the backend reported one.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Execution { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if this error reports a duplicate key.
    ///
    /// SQLSTATE class 23 covers integrity violations on MySQL and
    /// PostgreSQL; SQLite reports extended result codes 1555 and 2067
    /// for primary-key and unique-index conflicts.
    pub fn is_unique_violation(&self) -> bool {
        match self.sql_state() {
            Some(code) => code.starts_with("23") || code == "1555" || code == "2067",
            None => false,
        }
    }
}

/// Convert sqlx errors to StorageError.
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => StorageError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                StorageError::execution(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => StorageError::execution("No rows returned", None),
            sqlx::Error::PoolTimedOut => StorageError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                StorageError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => StorageError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => StorageError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => StorageError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => {
                StorageError::execution(format!("Type not found: {}", type_name), None)
            }
            sqlx::Error::ColumnNotFound(col) => {
                StorageError::execution(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => StorageError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                StorageError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => {
                StorageError::internal(format!("Decode error: {}", source))
            }
            sqlx::Error::WorkerCrashed => StorageError::internal("Database worker crashed"),
            _ => StorageError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_configuration_display() {
        let err = StorageError::configuration("queryTimeoutInSecs must not be negative");
        assert!(err.to_string().contains("Invalid configuration"));
    }

    #[test]
    fn test_sql_state_accessor() {
        let err = StorageError::execution("duplicate key", Some("23505".to_string()));
        assert_eq!(err.sql_state(), Some("23505"));
        assert_eq!(StorageError::transaction("no active transaction").sql_state(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(StorageError::timeout("query", 30).is_retryable());
        assert!(StorageError::connection("err", "sugg").is_retryable());
        assert!(!StorageError::transaction("already active").is_retryable());
        assert!(!StorageError::configuration("bad key").is_retryable());
    }

    #[test]
    fn test_unique_violation_detection() {
        assert!(StorageError::execution("dup", Some("23505".into())).is_unique_violation());
        assert!(StorageError::execution("dup", Some("23000".into())).is_unique_violation());
        assert!(StorageError::execution("dup", Some("1555".into())).is_unique_violation());
        assert!(StorageError::execution("dup", Some("2067".into())).is_unique_violation());
        assert!(!StorageError::execution("syntax", Some("42601".into())).is_unique_violation());
        assert!(!StorageError::execution("no state", None).is_unique_violation());
    }

    #[test]
    fn test_from_sqlx_row_not_found() {
        let err: StorageError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StorageError::Execution { .. }));
    }

    #[test]
    fn test_from_sqlx_pool_timed_out() {
        let err: StorageError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, StorageError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_from_sqlx_protocol() {
        let err: StorageError = sqlx::Error::Protocol("bad frame".to_string()).into();
        assert!(matches!(err, StorageError::Connection { .. }));
    }
}
