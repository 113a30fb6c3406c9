//! Error types for Meridian operations

use thiserror::Error;

/// Wire codec errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Varint does not fit in {bits} bits")]
    VarintOverflow { bits: u32 },

    #[error("Invalid boolean byte {0:#04x}")]
    InvalidBool(u8),

    #[error("Negative length prefix {0}")]
    NegativeLength(i32),

    #[error("Length {len} exceeds maximum of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("String field is not valid UTF-8")]
    InvalidUtf8,
}

impl WireError {
    /// Whether the peer went away rather than sending garbage.
    pub fn is_disconnect(&self) -> bool {
        match self {
            WireError::UnexpectedEof => true,
            WireError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Datastore errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },

    #[error("Query failed: {reason}")]
    Query { reason: String },

    #[error("Connection to {store} store failed: {reason}")]
    Connection { store: String, reason: String },

    #[error("Connection pool error: {reason}")]
    Pool { reason: String },

    #[error("Transaction already closed")]
    TransactionClosed,

    #[error("Commit failed on {store} store: {reason}")]
    CommitFailed { store: String, reason: String },

    #[error("Rollback failed on {store} store: {reason}")]
    RollbackFailed { store: String, reason: String },

    #[error("Cannot decode column {column}: {reason}")]
    Decode { column: String, reason: String },

    #[error("Cannot bind parameter ${position}: {reason}")]
    Bind { position: usize, reason: String },
}

impl StorageError {
    /// Faults caused by the link to the datastore rather than by the data.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            StorageError::Connection { .. } | StorageError::Pool { .. }
        )
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for Meridian library errors.
#[derive(Debug, Error)]
pub enum MeridianError {
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for wire codec operations.
pub type WireResult<T> = Result<T, WireError>;

/// Result type alias for datastore operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for Meridian operations.
pub type MeridianResult<T> = Result<T, MeridianError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_constraint() {
        let err = StorageError::ConstraintViolation {
            constraint: "mysql_databases_name_key".to_string(),
            reason: "duplicate".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("mysql_databases_name_key"));
        assert!(msg.contains("duplicate"));
    }

    #[test]
    fn test_storage_error_transport_classification() {
        assert!(StorageError::Pool {
            reason: "timeout".to_string()
        }
        .is_transport());
        assert!(!StorageError::TransactionClosed.is_transport());
    }

    #[test]
    fn test_wire_error_disconnect() {
        assert!(WireError::UnexpectedEof.is_disconnect());
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(WireError::Io(reset).is_disconnect());
        assert!(!WireError::InvalidBool(7).is_disconnect());
    }

    #[test]
    fn test_meridian_error_from_storage() {
        let err: MeridianError = StorageError::TransactionClosed.into();
        assert!(err.to_string().contains("Transaction already closed"));
    }
}
