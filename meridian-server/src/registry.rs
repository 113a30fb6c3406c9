//! Operation registry.
//!
//! Every non-control opcode is served by an [`OperationHandler`] registered
//! under `(opcode, table)`: generic opcodes such as ADD or REMOVE are keyed by
//! the table they act on, every other opcode by itself alone.
//!
//! Handlers describe their arguments with [`ArgSpec`]s. A spec carries the
//! protocol version that introduced the argument and the default used for
//! older clients, so handlers never compare versions themselves.

use async_trait::async_trait;
use meridian_core::{
    BusinessId, GateDefault, Opcode, ProtocolVersion, ServerId, TableId, WireKind, WireReader,
    WireValue,
};
use meridian_storage::DatastoreConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncRead;

use crate::auth::{AccessControl, Principal};
use crate::catalog::TableCatalog;
use crate::error::{ServerError, ServerResult};
use crate::ledger::InvalidationLedger;
use crate::scheduling::SchedulingClass;
use crate::session::Session;

// ============================================================================
// ARGUMENTS
// ============================================================================

/// One request argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: WireKind,
    /// First protocol version that sends this argument.
    pub since: ProtocolVersion,
    /// Substituted for clients older than `since`.
    pub default: GateDefault,
}

impl ArgSpec {
    pub const fn new(name: &'static str, kind: WireKind) -> Self {
        Self {
            name,
            kind,
            since: ProtocolVersion::V1_0,
            default: GateDefault::Omitted,
        }
    }

    pub const fn int(name: &'static str) -> Self {
        Self::new(name, WireKind::Int)
    }

    pub const fn long(name: &'static str) -> Self {
        Self::new(name, WireKind::Long)
    }

    pub const fn boolean(name: &'static str) -> Self {
        Self::new(name, WireKind::Bool)
    }

    pub const fn string(name: &'static str) -> Self {
        Self::new(name, WireKind::Str)
    }

    pub const fn nullable_string(name: &'static str) -> Self {
        Self::new(name, WireKind::NullableStr)
    }

    /// Only sent from `version` on; older clients get `default`.
    pub const fn since(self, version: ProtocolVersion, default: GateDefault) -> Self {
        Self {
            since: version,
            default,
            ..self
        }
    }
}

/// Decoded arguments of one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    values: Vec<(&'static str, Option<WireValue>)>,
}

impl Arguments {
    /// Read `specs` in order, substituting defaults for fields `version` lacks.
    pub async fn read<R: AsyncRead + Unpin>(
        reader: &mut WireReader<R>,
        specs: &[ArgSpec],
        version: ProtocolVersion,
    ) -> ServerResult<Self> {
        let mut values = Vec::with_capacity(specs.len());
        for spec in specs {
            let value = if version >= spec.since {
                Some(reader.read_value(spec.kind).await?)
            } else {
                spec.default.to_value()
            };
            values.push((spec.name, value));
        }
        Ok(Self { values })
    }

    pub fn from_values(values: impl IntoIterator<Item = (&'static str, WireValue)>) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|(name, value)| (name, Some(value)))
                .collect(),
        }
    }

    /// `None` when the argument is unknown or omitted for this version.
    pub fn get(&self, name: &str) -> Option<&WireValue> {
        self.values
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .and_then(|(_, value)| value.as_ref())
    }

    fn require(&self, name: &str) -> ServerResult<&WireValue> {
        self.get(name)
            .ok_or_else(|| ServerError::protocol(format!("Missing argument {}", name)))
    }

    fn mismatch(name: &str, expected: &str) -> ServerError {
        ServerError::protocol(format!("Argument {} is not {}", name, expected))
    }

    pub fn int(&self, name: &str) -> ServerResult<i32> {
        self.require(name)?
            .as_int()
            .ok_or_else(|| Self::mismatch(name, "an int"))
    }

    pub fn long(&self, name: &str) -> ServerResult<i64> {
        self.require(name)?
            .as_long()
            .ok_or_else(|| Self::mismatch(name, "a long"))
    }

    pub fn boolean(&self, name: &str) -> ServerResult<bool> {
        self.require(name)?
            .as_bool()
            .ok_or_else(|| Self::mismatch(name, "a bool"))
    }

    pub fn string(&self, name: &str) -> ServerResult<&str> {
        self.require(name)?
            .as_str()
            .ok_or_else(|| Self::mismatch(name, "a string"))
    }

    pub fn nullable_string(&self, name: &str) -> ServerResult<Option<&str>> {
        match self.require(name)? {
            WireValue::NullableStr(value) => Ok(value.as_deref()),
            WireValue::Str(value) => Ok(Some(value)),
            _ => Err(Self::mismatch(name, "a nullable string")),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ============================================================================
// REPLIES
// ============================================================================

/// Typed result of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `SUCCESS` with no payload.
    Done,
    /// `SUCCESS` followed by one value.
    Value(WireValue),
    /// `SUCCESS` followed by several values.
    Values(Vec<WireValue>),
    /// A `NEXT` + row for each row, then `NO_MORE_ROWS`.
    Rows(Vec<Vec<WireValue>>),
}

// ============================================================================
// OPERATION CONTEXT
// ============================================================================

/// Everything a handler may touch while its request runs.
pub struct OperationContext<'a> {
    pub primary: &'a mut dyn DatastoreConnection,
    pub secondary: &'a mut dyn DatastoreConnection,
    pub session: &'a Session,
    pub ledger: &'a mut InvalidationLedger,
    pub access: &'a AccessControl,
    pub catalog: &'a TableCatalog,
    /// Table the request was routed by, for table-keyed opcodes.
    pub table: Option<TableId>,
    principal: Option<Principal>,
}

impl<'a> OperationContext<'a> {
    pub fn new(
        primary: &'a mut dyn DatastoreConnection,
        secondary: &'a mut dyn DatastoreConnection,
        session: &'a Session,
        ledger: &'a mut InvalidationLedger,
        access: &'a AccessControl,
        catalog: &'a TableCatalog,
        table: Option<TableId>,
    ) -> Self {
        Self {
            primary,
            secondary,
            session,
            ledger,
            access,
            catalog,
            table,
            principal: None,
        }
    }

    /// The effective user, resolved once per request.
    pub async fn principal(&mut self) -> ServerResult<&Principal> {
        if self.principal.is_none() {
            let principal = self
                .access
                .principal(&self.session.effective_user)
                .await?
                .ok_or_else(|| {
                    ServerError::authorization(format!(
                        "Unknown user {}",
                        self.session.effective_user
                    ))
                })?;
            self.principal = Some(principal);
        }
        self.principal
            .as_ref()
            .ok_or_else(|| ServerError::internal("Principal not resolved"))
    }

    pub async fn require_master(&mut self) -> ServerResult<()> {
        if self.principal().await?.is_master() {
            Ok(())
        } else {
            Err(ServerError::authorization("Master user required"))
        }
    }

    pub async fn require_business(&mut self, business: &BusinessId) -> ServerResult<()> {
        let principal = self.principal().await?.clone();
        if self.access.can_access_business(&principal, business).await? {
            Ok(())
        } else {
            Err(ServerError::authorization(format!(
                "{} may not access business {}",
                principal.user, business
            )))
        }
    }

    pub async fn require_server(&mut self, server: ServerId) -> ServerResult<()> {
        let principal = self.principal().await?.clone();
        if self.access.can_access_server(&principal, server).await? {
            Ok(())
        } else {
            Err(ServerError::authorization(format!(
                "{} may not access server {}",
                principal.user, server
            )))
        }
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

/// One dispatchable operation.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Command label recorded in history and metrics.
    fn label(&self) -> &str;

    fn arguments(&self) -> &[ArgSpec] {
        &[]
    }

    fn scheduling_class(&self) -> SchedulingClass {
        SchedulingClass::Normal
    }

    /// Whether the request gets an invalidation footer and a broadcast.
    fn invalidates(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        ctx: &mut OperationContext<'_>,
        args: &Arguments,
    ) -> ServerResult<Reply>;
}

type HandlerKey = (Opcode, Option<TableId>);

/// Handlers by `(opcode, table)`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKey, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a non-table-keyed opcode.
    pub fn register(&mut self, opcode: Opcode, handler: Arc<dyn OperationHandler>) -> ServerResult<()> {
        if opcode.is_control() || opcode.is_table_keyed() {
            return Err(ServerError::internal(format!(
                "{} cannot be registered without a table",
                opcode
            )));
        }
        self.insert((opcode, None), handler)
    }

    /// Register a handler for a generic opcode acting on `table`.
    pub fn register_table(
        &mut self,
        opcode: Opcode,
        table: TableId,
        handler: Arc<dyn OperationHandler>,
    ) -> ServerResult<()> {
        if !opcode.is_table_keyed() {
            return Err(ServerError::internal(format!("{} is not table-keyed", opcode)));
        }
        self.insert((opcode, Some(table)), handler)
    }

    fn insert(&mut self, key: HandlerKey, handler: Arc<dyn OperationHandler>) -> ServerResult<()> {
        if self.handlers.contains_key(&key) {
            return Err(ServerError::internal(format!(
                "Duplicate handler for {} {:?}",
                key.0, key.1
            )));
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    pub fn lookup(&self, opcode: Opcode, table: Option<TableId>) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(&(opcode, table)).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
