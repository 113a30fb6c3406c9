//! Meridian Core - Shared Types
//!
//! Identity types, table metadata, invalidation scopes, protocol constants
//! and the compact wire codec. Every other Meridian crate depends on this.
//! Nothing in here touches a datastore or a socket directly.

pub mod error;
pub mod identity;
pub mod protocol;
pub mod scope;
pub mod table;
pub mod wire;

pub use error::{
    ConfigError, MeridianError, MeridianResult, StorageError, StorageResult, WireError,
    WireResult,
};
pub use identity::{BusinessId, ConnectorId, ServerId, Timestamp, UserId};
pub use protocol::{
    status, CodecTable, FieldGate, GateDefault, Opcode, ProtocolVersion, WireField,
    FIELD_GATES, INVALIDATION_SENTINEL,
};
pub use scope::ScopeSet;
pub use table::{TableId, Visibility};
pub use wire::{WireKind, WireReader, WireValue, WireWriter, MAX_STRING_LEN};
