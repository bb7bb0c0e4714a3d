//! Error types for ChronoDB

use crate::TxnId;
use thiserror::Error;

/// Result type alias for ChronoDB operations
pub type Result<T> = std::result::Result<T, ChronoError>;

/// ChronoDB error types
#[derive(Error, Debug)]
pub enum ChronoError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Durable write to the sequencer log failed; the commit did not happen
    #[error("Sequencer IO error on table {table}: {source}")]
    SequencerIo {
        table: String,
        #[source]
        source: std::io::Error,
    },

    /// Structural change or value conflicts with the table definition
    #[error("table: {table}{}; {message}", .column.as_ref().map(|c| format!(", column: {c}")).unwrap_or_default())]
    Schema {
        table: String,
        column: Option<String>,
        message: String,
    },

    /// Partition write failed while merging a transaction
    #[error("Merge IO error on table {table} at txn {txn}: {source}")]
    MergeIo {
        table: String,
        txn: TxnId,
        #[source]
        source: std::io::Error,
    },

    /// Transaction ids observed out of sequence
    #[error("Ordering violation on table {table}: expected txn {expected}, found {found}")]
    OrderingViolation {
        table: String,
        expected: TxnId,
        found: TxnId,
    },

    /// Purge found a segment that is still required
    #[error("Purge race on {segment}: segment holds txn {max_txn} above applied watermark {watermark}")]
    PurgeRace {
        segment: String,
        max_txn: TxnId,
        watermark: TxnId,
    },

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Table not found
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Table already exists
    #[error("Table already exists: {0}")]
    TableExists(String),

    /// Table is suspended or quarantined and will not accept apply work
    #[error("Table {table} is not active: {reason}")]
    TableSuspended { table: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChronoError {
    /// Build a schema error without a column reference
    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        ChronoError::Schema {
            table: table.into(),
            column: None,
            message: message.into(),
        }
    }

    /// Build a schema error pointing at a column
    pub fn column(
        table: impl Into<String>,
        column: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ChronoError::Schema {
            table: table.into(),
            column: Some(column.into()),
            message: message.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChronoError::Io(_) | ChronoError::MergeIo { .. } | ChronoError::SequencerIo { .. }
        )
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ChronoError::Corruption(_)
                | ChronoError::ChecksumMismatch { .. }
                | ChronoError::OrderingViolation { .. }
        )
    }

    /// Errors caused by the caller's input rather than the server
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ChronoError::Schema { .. }
                | ChronoError::TableNotFound(_)
                | ChronoError::TableExists(_)
                | ChronoError::InvalidFormat(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_message_matches_ingestion_format() {
        let err = ChronoError::column(
            "ex_tbl",
            "b",
            "cast error from protocol type: FLOAT to column type: BYTE",
        );
        assert_eq!(
            err.to_string(),
            "table: ex_tbl, column: b; cast error from protocol type: FLOAT to column type: BYTE"
        );

        let err = ChronoError::schema(
            "ex_tbl2",
            "table does not exist, cannot create table, creating new columns is disabled",
        );
        assert!(err.to_string().starts_with("table: ex_tbl2; table does not exist"));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_classification() {
        let io = ChronoError::MergeIo {
            table: "t".into(),
            txn: 3,
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk"),
        };
        assert!(io.is_retryable());
        assert!(!io.is_corruption());

        let gap = ChronoError::OrderingViolation {
            table: "t".into(),
            expected: 4,
            found: 6,
        };
        assert!(gap.is_corruption());
        assert!(!gap.is_retryable());
    }
}
