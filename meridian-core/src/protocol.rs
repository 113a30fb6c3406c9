//! Wire protocol constants and the version compatibility table.
//!
//! Every optional field whose presence depends on the negotiated protocol
//! version is listed in [`FIELD_GATES`]. Code that reads or writes such a
//! field asks the [`CodecTable`] instead of comparing versions inline, so the
//! whole compatibility matrix lives in one place and can be tested on its own.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::wire::WireValue;

// ============================================================================
// PROTOCOL VERSIONS
// ============================================================================

/// Protocol versions understood by this server, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V1_0,
    V1_30,
    V1_44,
    V1_62,
    V1_80,
    V1_83,
}

impl ProtocolVersion {
    /// All supported versions, oldest first.
    pub const ALL: &'static [ProtocolVersion] = &[
        ProtocolVersion::V1_0,
        ProtocolVersion::V1_30,
        ProtocolVersion::V1_44,
        ProtocolVersion::V1_62,
        ProtocolVersion::V1_80,
        ProtocolVersion::V1_83,
    ];

    /// The newest version; what this server speaks natively.
    pub const CURRENT: ProtocolVersion = ProtocolVersion::V1_83;

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V1_0 => "1.0",
            ProtocolVersion::V1_30 => "1.30",
            ProtocolVersion::V1_44 => "1.44",
            ProtocolVersion::V1_62 => "1.62",
            ProtocolVersion::V1_80 => "1.80",
            ProtocolVersion::V1_83 => "1.83",
        }
    }

    /// Parse the version string a client sends in its handshake.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|version| version.as_str() == value.trim())
    }

    pub fn is_at_least(&self, other: ProtocolVersion) -> bool {
        *self >= other
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// OPCODES
// ============================================================================

/// Integer identifying a requested operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Opcode(pub i32);

impl Opcode {
    /// Close the connection. No response is written.
    pub const QUIT: Opcode = Opcode(0);
    /// No-op round trip used by clients to test a pooled connection.
    pub const TEST_CONNECTION: Opcode = Opcode(1);
    /// Liveness check.
    pub const PING: Opcode = Opcode(2);
    /// Enter the invalidation long-poll loop; never returns to the command loop.
    pub const LISTEN_CACHES: Opcode = Opcode(3);
    /// Live concurrency and throughput counters.
    pub const GET_SERVER_STATS: Opcode = Opcode(4);
    /// Recently completed commands.
    pub const GET_COMMAND_HISTORY: Opcode = Opcode(5);

    // Generic opcodes routed by table id.
    pub const ADD: Opcode = Opcode(10);
    pub const REMOVE: Opcode = Opcode(11);
    pub const DISABLE: Opcode = Opcode(12);
    pub const ENABLE: Opcode = Opcode(13);
    pub const SET_BACKUP_RETENTION: Opcode = Opcode(14);

    /// First opcode available to domain operations.
    pub const FIRST_DOMAIN: Opcode = Opcode(100);

    /// Control opcodes bypass the transactional executor.
    pub fn is_control(&self) -> bool {
        matches!(
            *self,
            Opcode::QUIT | Opcode::TEST_CONNECTION | Opcode::PING | Opcode::LISTEN_CACHES
        )
    }

    /// Generic opcodes carry a client table id right after the opcode.
    pub fn is_table_keyed(&self) -> bool {
        matches!(
            *self,
            Opcode::ADD
                | Opcode::REMOVE
                | Opcode::DISABLE
                | Opcode::ENABLE
                | Opcode::SET_BACKUP_RETENTION
        )
    }

    pub fn name(&self) -> Option<&'static str> {
        Some(match *self {
            Opcode::QUIT => "quit",
            Opcode::TEST_CONNECTION => "test_connection",
            Opcode::PING => "ping",
            Opcode::LISTEN_CACHES => "listen_caches",
            Opcode::GET_SERVER_STATS => "get_server_stats",
            Opcode::GET_COMMAND_HISTORY => "get_command_history",
            Opcode::ADD => "add",
            Opcode::REMOVE => "remove",
            Opcode::DISABLE => "disable",
            Opcode::ENABLE => "enable",
            Opcode::SET_BACKUP_RETENTION => "set_backup_retention",
            _ => return None,
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "opcode({})", self.0),
        }
    }
}

// ============================================================================
// STATUS BYTES
// ============================================================================

/// Response status bytes.
pub mod status {
    /// Request completed; status-specific payload follows.
    pub const SUCCESS: u8 = 0;
    /// One result row follows.
    pub const NEXT: u8 = 1;
    /// End of a row stream.
    pub const NO_MORE_ROWS: u8 = 2;
    /// Data-layer fault; a message follows.
    pub const DATA_FAULT: u8 = 3;
    /// Transport-layer fault; a message follows.
    pub const TRANSPORT_FAULT: u8 = 4;
    /// Handshake rejected the client's protocol version; the server version follows.
    pub const UNSUPPORTED_VERSION: u8 = 5;
    /// Sent by a listening client after each non-empty invalidation batch.
    pub const LISTEN_ACK: u8 = 6;
}

/// Terminates every list of client table ids.
pub const INVALIDATION_SENTINEL: i32 = -1;

// ============================================================================
// VERSION-GATED FIELDS
// ============================================================================

/// Optional wire fields whose presence depends on the protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireField {
    /// Server → client: connector id after a successful handshake.
    HandshakeConnectorId,
    /// Client → server: free-form client label after the password.
    HandshakeClientLabel,
    /// Server → client: numeric fault category before the fault message.
    FaultCode,
    /// Server → client: empty invalidation list sent on long-poll timeout.
    ListenKeepalive,
    /// Server → client: effective user column in command history rows.
    HistoryEffectiveUser,
    /// Server → client: secure flag column in command history rows.
    HistorySecureFlag,
    /// Server → client: accumulated processing time in server stats.
    StatsTotalTime,
}

/// Default substituted when a field is absent for the negotiated version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDefault {
    /// Nothing is substituted; the field is simply omitted.
    Omitted,
    Int(i32),
    Long(i64),
    Bool(bool),
    Str(&'static str),
}

impl GateDefault {
    pub fn to_value(self) -> Option<WireValue> {
        match self {
            GateDefault::Omitted => None,
            GateDefault::Int(v) => Some(WireValue::Int(v)),
            GateDefault::Long(v) => Some(WireValue::Long(v)),
            GateDefault::Bool(v) => Some(WireValue::Bool(v)),
            GateDefault::Str(v) => Some(WireValue::Str(v.to_string())),
        }
    }
}

/// One row of the compatibility matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldGate {
    pub field: WireField,
    pub since: ProtocolVersion,
    pub default: GateDefault,
}

/// The compatibility matrix.
pub const FIELD_GATES: &[FieldGate] = &[
    FieldGate {
        field: WireField::HistoryEffectiveUser,
        since: ProtocolVersion::V1_30,
        default: GateDefault::Omitted,
    },
    FieldGate {
        field: WireField::HandshakeConnectorId,
        since: ProtocolVersion::V1_44,
        default: GateDefault::Omitted,
    },
    FieldGate {
        field: WireField::ListenKeepalive,
        since: ProtocolVersion::V1_44,
        default: GateDefault::Omitted,
    },
    FieldGate {
        field: WireField::FaultCode,
        since: ProtocolVersion::V1_62,
        default: GateDefault::Omitted,
    },
    FieldGate {
        field: WireField::StatsTotalTime,
        since: ProtocolVersion::V1_62,
        default: GateDefault::Omitted,
    },
    FieldGate {
        field: WireField::HandshakeClientLabel,
        since: ProtocolVersion::V1_80,
        default: GateDefault::Str(""),
    },
    FieldGate {
        field: WireField::HistorySecureFlag,
        since: ProtocolVersion::V1_80,
        default: GateDefault::Omitted,
    },
];

/// Lookup view over [`FIELD_GATES`] for one negotiated version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecTable {
    version: ProtocolVersion,
}

impl CodecTable {
    pub fn for_version(version: ProtocolVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    fn gate(field: WireField) -> Option<&'static FieldGate> {
        FIELD_GATES.iter().find(|gate| gate.field == field)
    }

    /// Whether `field` is present on the wire for this version.
    ///
    /// Fields missing from the matrix are always present.
    pub fn includes(&self, field: WireField) -> bool {
        match Self::gate(field) {
            Some(gate) => self.version >= gate.since,
            None => true,
        }
    }

    /// Value to use when `field` is absent for this version.
    pub fn default_for(&self, field: WireField) -> Option<WireValue> {
        Self::gate(field).and_then(|gate| gate.default.to_value())
    }
}
