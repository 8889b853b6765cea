//! Error types for the database access core.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Pool-level failures (acquire timeouts, slot misuse), driver failures and result
//! table access failures share one enum so every `exec_*` call yields a single
//! typed error.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Connection failed{}: {message}", slot_suffix(.slot))]
    Connect {
        /// Slot being (re)connected, if the failure happened for a specific slot.
        slot: Option<usize>,
        message: String,
        suggestion: String,
    },

    #[error("Timed out acquiring a connection slot after {attempts} attempts ({waited_ms}ms)")]
    AcquireTimeout { attempts: u32, waited_ms: u64 },

    #[error("Connection pool is shut down")]
    PoolClosed,

    #[error("Failed to prepare statement: {message} (sql: {sql})")]
    Prepare { message: String, sql: String },

    #[error("Database error: {message}")]
    Driver {
        message: String,
        /// e.g., "23000" for an integrity constraint violation
        sql_state: Option<String>,
        /// True if the backend connection is no longer usable.
        connection_lost: bool,
    },

    #[error("Result table corrupted: {message}")]
    Corruption { message: String },

    #[error("Slot {slot}: {message}")]
    Slot { slot: usize, message: String },

    #[error("Row index {index} out of range (row count: {row_count})")]
    RowIndex { index: usize, row_count: usize },

    #[error("Field index {field} out of range (field count: {field_count})")]
    FieldIndex { field: usize, field_count: usize },

    #[error("Field {field} holds {actual} bytes, {expected} needs {width}")]
    FieldType {
        field: usize,
        expected: &'static str,
        width: usize,
        actual: usize,
    },

    #[error("Field {field} could not be decoded: {message}")]
    Decode { field: usize, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn slot_suffix(slot: &Option<usize>) -> String {
    slot.map(|s| format!(" (slot {})", s)).unwrap_or_default()
}

impl DbError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connect(
        slot: Option<usize>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Connect {
            slot,
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an acquire timeout error.
    pub fn acquire_timeout(attempts: u32, waited_ms: u64) -> Self {
        Self::AcquireTimeout {
            attempts,
            waited_ms,
        }
    }

    /// Create a prepare error for the given query text.
    pub fn prepare(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Prepare {
            message: message.into(),
            sql: sql.into(),
        }
    }

    /// Create a driver error that leaves the connection usable.
    pub fn driver(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Driver {
            message: message.into(),
            sql_state,
            connection_lost: false,
        }
    }

    /// Create a driver error for a connection that is gone.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
            sql_state: None,
            connection_lost: true,
        }
    }

    /// Create a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Create a slot misuse error.
    pub fn slot(slot: usize, message: impl Into<String>) -> Self {
        Self::Slot {
            slot,
            message: message.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(field: usize, message: impl Into<String>) -> Self {
        Self::Decode {
            field,
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connect { suggestion, .. } => Some(suggestion),
            Self::AcquireTimeout { .. } => {
                Some("All slots are busy; retry later or raise the pool size")
            }
            Self::Prepare { .. } => Some("Check the SQL syntax and referenced objects"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::AcquireTimeout { .. })
    }

    /// Check if this error means the slot's connection must be rebuilt.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Driver {
                connection_lost: true,
                ..
            }
        )
    }
}

/// Convert sqlx errors raised while executing statements to DbError.
///
/// Connect and prepare paths map errors themselves so they can report
/// `Connect` / `Prepare` instead of `Driver`.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::config(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::driver(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => DbError::driver("No rows returned", None),
            sqlx::Error::Io(io_err) => DbError::connection_lost(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => {
                DbError::connection_lost(format!("TLS error: {}", tls_err))
            }
            sqlx::Error::Protocol(msg) => {
                DbError::connection_lost(format!("Protocol error: {}", msg))
            }
            sqlx::Error::WorkerCrashed => DbError::connection_lost("Database worker crashed"),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::FieldIndex {
                field: index,
                field_count: len,
            },
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::driver(format!("Failed to decode column {}: {}", index, source), None)
            }
            sqlx::Error::Decode(source) => DbError::driver(format!("Decode error: {}", source), None),
            sqlx::Error::Encode(source) => {
                DbError::driver(format!("Failed to bind parameter: {}", source), None)
            }
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
