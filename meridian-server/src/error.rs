//! Error Types for the Meridian Server
//!
//! Every failure that reaches a client is a [`ServerError`]: a fault
//! category, a human-readable message and a `fatal` flag. Non-fatal faults
//! fail only the current request; fatal faults are reported (when the
//! framing still allows it) and then close the connection.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use meridian_core::{status, ConfigError, MeridianError, StorageError, WireError};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::auth::AuthError;

// ============================================================================
// FAULT KIND
// ============================================================================

/// Fault categories reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultKind {
    /// Credentials rejected during the handshake
    Authentication,

    /// Authenticated principal may not touch the resource
    Authorization,

    /// Unknown opcode, unknown table id or malformed request
    Protocol,

    /// Data-layer failure; both datastores were rolled back
    Data,

    /// Link failure to a datastore or the client
    Transport,

    /// Anything else
    Internal,
}

impl FaultKind {
    /// Status byte that introduces this fault on the wire.
    pub fn status_byte(&self) -> u8 {
        match self {
            FaultKind::Transport => status::TRANSPORT_FAULT,
            _ => status::DATA_FAULT,
        }
    }

    /// Numeric fault code sent to clients whose version carries it.
    pub fn code(&self) -> i32 {
        match self {
            FaultKind::Authentication => 1,
            FaultKind::Authorization => 2,
            FaultKind::Protocol => 3,
            FaultKind::Data => 4,
            FaultKind::Transport => 5,
            FaultKind::Internal => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Authentication => "authentication",
            FaultKind::Authorization => "authorization",
            FaultKind::Protocol => "protocol",
            FaultKind::Data => "data",
            FaultKind::Transport => "transport",
            FaultKind::Internal => "internal",
        }
    }

    fn http_status(&self) -> StatusCode {
        match self {
            FaultKind::Authentication => StatusCode::UNAUTHORIZED,
            FaultKind::Authorization => StatusCode::FORBIDDEN,
            FaultKind::Protocol => StatusCode::BAD_REQUEST,
            FaultKind::Transport => StatusCode::SERVICE_UNAVAILABLE,
            FaultKind::Data | FaultKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SERVER ERROR
// ============================================================================

/// Structured fault carried to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub kind: FaultKind,
    pub message: String,
    /// The connection must close after this fault.
    #[serde(default)]
    pub fatal: bool,
}

impl ServerError {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn into_fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Authentication, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Authorization, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Protocol, message)
    }

    /// Protocol fault after which framing cannot be trusted.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Protocol, message).into_fatal()
    }

    pub fn unknown_opcode(opcode: impl fmt::Display) -> Self {
        Self::protocol(format!("Unsupported operation {}", opcode))
    }

    pub fn unsupported_table(client_table_id: i32) -> Self {
        Self::protocol(format!("Unsupported table id {}", client_table_id))
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Data, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Transport, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Internal, message)
    }

    pub fn status_byte(&self) -> u8 {
        self.kind.status_byte()
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fault: {}", self.kind, self.message)
    }
}

impl std::error::Error for ServerError {}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.kind.http_status();
        (status, Json(self)).into_response()
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        if err.is_transport() {
            ServerError::transport(err.to_string())
        } else {
            ServerError::data(err.to_string())
        }
    }
}

/// Codec failures mean the stream position is lost.
impl From<WireError> for ServerError {
    fn from(err: WireError) -> Self {
        if err.is_disconnect() {
            ServerError::transport(err.to_string()).into_fatal()
        } else {
            ServerError::malformed(err.to_string())
        }
    }
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Directory(storage) => ServerError::from(storage),
            other => ServerError::authentication(other.to_string()),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        ServerError::internal(err.to_string()).into_fatal()
    }
}

impl From<MeridianError> for ServerError {
    fn from(err: MeridianError) -> Self {
        match err {
            MeridianError::Wire(err) => err.into(),
            MeridianError::Storage(err) => err.into(),
            MeridianError::Config(err) => err.into(),
        }
    }
}

impl From<tokio_postgres::Error> for ServerError {
    fn from(err: tokio_postgres::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        if err.is_closed() {
            ServerError::transport("Database connection closed")
        } else {
            ServerError::data("Database operation failed")
        }
    }
}

impl From<deadpool_postgres::PoolError> for ServerError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        tracing::error!("Connection pool error: {:?}", err);
        match err {
            deadpool_postgres::PoolError::Timeout(_) => {
                ServerError::transport("Database connection pool exhausted")
            }
            deadpool_postgres::PoolError::Closed => {
                ServerError::transport("Database connection pool is closed")
            }
            _ => ServerError::transport("Failed to acquire database connection"),
        }
    }
}

/// Result type alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bytes() {
        assert_eq!(ServerError::data("x").status_byte(), status::DATA_FAULT);
        assert_eq!(
            ServerError::transport("x").status_byte(),
            status::TRANSPORT_FAULT
        );
        assert_eq!(ServerError::protocol("x").status_byte(), status::DATA_FAULT);
    }

    #[test]
    fn test_storage_conversion() {
        let err: ServerError = StorageError::ConstraintViolation {
            constraint: "mysql_databases_name_key".to_string(),
            reason: "duplicate".to_string(),
        }
        .into();
        assert_eq!(err.kind, FaultKind::Data);
        assert!(!err.fatal);

        let err: ServerError = StorageError::Pool {
            reason: "timeout".to_string(),
        }
        .into();
        assert_eq!(err.kind, FaultKind::Transport);
    }

    #[test]
    fn test_wire_errors_are_fatal() {
        let err: ServerError = WireError::InvalidBool(3).into();
        assert!(err.fatal);
        assert_eq!(err.kind, FaultKind::Protocol);

        let err: ServerError = WireError::UnexpectedEof.into();
        assert!(err.fatal);
        assert_eq!(err.kind, FaultKind::Transport);
    }

    #[test]
    fn test_unsupported_table_is_recoverable() {
        let err = ServerError::unsupported_table(99);
        assert!(!err.fatal);
        assert!(err.message.contains("99"));
    }

    #[test]
    fn test_fault_codes_distinct() {
        let kinds = [
            FaultKind::Authentication,
            FaultKind::Authorization,
            FaultKind::Protocol,
            FaultKind::Data,
            FaultKind::Transport,
            FaultKind::Internal,
        ];
        for a in kinds {
            for b in kinds {
                assert_eq!(a == b, a.code() == b.code());
            }
        }
    }

    #[test]
    fn test_error_serialization() -> Result<(), serde_json::Error> {
        let err = ServerError::authorization("not yours");
        let json = serde_json::to_string(&err)?;
        assert!(json.contains("AUTHORIZATION"));
        let back: ServerError = serde_json::from_str(&json)?;
        assert_eq!(back, err);
        Ok(())
    }
}
