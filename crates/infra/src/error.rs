//! Storage error model shared by the job, token and cursor stores.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Conflict` |
//! | Database (other) | Any other | `Database` |
//! | PoolClosed | N/A | `PoolClosed` |
//! | ColumnDecode / Decode | N/A | `Decode` |
//! | Other | N/A | `Database` |

use thiserror::Error;

/// Failure of a persistence operation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error in {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("conflict in {operation}: {message}")]
    Conflict { operation: String, message: String },

    #[error("connection pool closed in {operation}")]
    PoolClosed { operation: String },

    #[error("failed to decode row in {operation}: {message}")]
    Decode { operation: String, message: String },

    #[error("in-memory store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Transient errors are worth retrying; the rest indicate a bug or outage.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Database { .. })
    }
}

/// Map SQLx errors to `StoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") | Some("40P01") => StoreError::Conflict {
                    operation: operation.to_string(),
                    message,
                },
                _ => StoreError::Database {
                    operation: operation.to_string(),
                    message,
                },
            }
        }
        sqlx::Error::PoolClosed => StoreError::PoolClosed {
            operation: operation.to_string(),
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => StoreError::Decode {
            operation: operation.to_string(),
            message: err.to_string(),
        },
        _ => StoreError::Database {
            operation: operation.to_string(),
            message: err.to_string(),
        },
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StoreError::LockPoisoned
    }
}
