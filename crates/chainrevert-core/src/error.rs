//! Error types for the reversible write layer.

use thiserror::Error;

/// Errors that can occur while writing to, or rolling back, the index database.
#[derive(Debug, Error)]
pub enum DbError {
    /// The backend rejected a statement or the connection failed.
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid insert batch for table '{table}': all rows must have the same columns")]
    InvalidBatch { table: String },

    /// An update matched nothing, so the caller's view of the table is stale.
    #[error("Update on table '{table}' affected no rows (condition: {condition})")]
    NoRowsAffected { table: String, condition: String },

    #[error("Unknown rollback operation '{0}'")]
    UnknownRollbackOperation(String),

    #[error("Transaction is already {state}")]
    TransactionClosed { state: String },

    #[error("Reader '{0}' not found")]
    ReaderNotFound(String),

    #[error("Unsupported type '{type_name}' for column '{column}'")]
    UnsupportedColumnType { column: String, type_name: String },

    #[error("Statement on table '{table}' has no columns")]
    EmptyStatement { table: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DbError {
    /// Returns `true` if the error means in-memory state has diverged from the
    /// database. Retrying the same block will not help.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidBatch { .. }
                | Self::NoRowsAffected { .. }
                | Self::UnknownRollbackOperation(_)
        )
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divergence_errors_are_invariant_violations() {
        let e = DbError::NoRowsAffected {
            table: "assets".into(),
            condition: "\"id\" = ?".into(),
        };
        assert!(e.is_invariant_violation());
        assert!(DbError::UnknownRollbackOperation("upsert".into()).is_invariant_violation());
        assert!(!DbError::Database("connection reset".into()).is_invariant_violation());
    }
}
