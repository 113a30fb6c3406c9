//! Meridian Test Utilities
//!
//! Shared test infrastructure for the Meridian workspace:
//! - A standard account directory fixture (businesses, users, masters, grants)
//! - Sample operation handlers covering table-keyed writes, row streams and
//!   failing requests
//! - [`TestServer`], a fully wired server state whose connections run over
//!   in-memory duplex pipes
//! - [`TestClient`], a wire-level client for driving those connections

pub use meridian_core::{
    status, BusinessId, CodecTable, ConnectorId, Opcode, ProtocolVersion, ScopeSet, ServerId,
    TableId, UserId, WireField, WireKind, WireValue,
};
pub use meridian_server::{
    HandlerRegistry, ServerConfig, ServerError, ServerResult, ServerState,
};
pub use meridian_storage::{InMemoryDatastore, InMemoryDirectory};

use async_trait::async_trait;
use meridian_core::{WireReader, WireWriter, INVALIDATION_SENTINEL};
use meridian_server::{
    serve_connection, ArgSpec, Arguments, OperationContext, OperationHandler, Peer, Reply,
    TransportKind,
};
use meridian_storage::{AccountDirectory, Record};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

// ============================================================================
// FIXTURES
// ============================================================================

/// Password of every fixture account.
pub const PASSWORD: &str = "secret";

/// Host every in-memory connection reports.
pub const TEST_HOST: &str = "127.0.0.1";

/// Server granted to `acme`.
pub const ACME_SERVER: ServerId = ServerId(1);
/// Server granted to `other`.
pub const OTHER_SERVER: ServerId = ServerId(2);
/// Standby whose failover parent is [`ACME_SERVER`].
pub const STANDBY_SERVER: ServerId = ServerId(3);

fn fixture_hash() -> ServerResult<String> {
    // Minimum bcrypt cost keeps fixture setup fast.
    bcrypt::hash(PASSWORD, 4)
        .map_err(|e| ServerError::internal(format!("Failed to hash fixture password: {}", e)))
}

/// The standard directory:
///
/// | user  | business | notes                          |
/// |-------|----------|--------------------------------|
/// | alice | acme     |                                |
/// | carol | acme-sub | acme-sub is a child of acme    |
/// | bob   | other    |                                |
/// | root  | hq       | unrestricted master, may act as alice |
pub fn standard_directory() -> ServerResult<InMemoryDirectory> {
    let hash = fixture_hash()?;
    Ok(InMemoryDirectory::new()
        .with_business("hq", None)
        .with_business("acme", None)
        .with_business("acme-sub", Some(BusinessId::from("acme")))
        .with_business("other", None)
        .with_user("alice", "acme", Some(hash.clone()))
        .with_user("carol", "acme-sub", Some(hash.clone()))
        .with_user("bob", "other", Some(hash.clone()))
        .with_user("root", "hq", Some(hash))
        .with_master_user("root")
        .with_switch_grant("root", "alice")
        .with_business_server("acme", ACME_SERVER)
        .with_business_server("other", OTHER_SERVER)
        .with_failover_parent(STANDBY_SERVER, ACME_SERVER))
}

// ============================================================================
// SAMPLE HANDLERS
// ============================================================================

/// Streams every row of the `mysql_databases` fixture.
pub const LIST_DATABASES: Opcode = Opcode(100);
/// Writes to the primary, then fails.
pub const FAILING_OPERATION: Opcode = Opcode(101);

pub const INSERT_DATABASE: &str = "INSERT INTO mysql_databases (name, business) VALUES ($1, $2)";
pub const ARCHIVE_DATABASE: &str = "INSERT INTO archive_log (action, name) VALUES ($1, $2)";
pub const SELECT_DATABASES: &str = "SELECT name, business FROM mysql_databases ORDER BY name";
pub const DISABLE_USERNAME: &str = "UPDATE usernames SET disabled = true WHERE username = $1";

/// ADD on `mysql_databases`: `name`, `business`.
pub struct AddMysqlDatabase;

const ADD_DATABASE_ARGS: &[ArgSpec] = &[ArgSpec::string("name"), ArgSpec::string("business")];

#[async_trait]
impl OperationHandler for AddMysqlDatabase {
    fn label(&self) -> &str {
        "add_mysql_database"
    }

    fn arguments(&self) -> &[ArgSpec] {
        ADD_DATABASE_ARGS
    }

    async fn execute(
        &self,
        ctx: &mut OperationContext<'_>,
        args: &Arguments,
    ) -> ServerResult<Reply> {
        let name = args.string("name")?.to_string();
        let business = BusinessId::from(args.string("business")?);
        ctx.require_business(&business).await?;

        ctx.primary
            .execute(
                INSERT_DATABASE,
                &[Value::from(name.as_str()), Value::from(business.as_str())],
            )
            .await?;
        ctx.secondary
            .execute(ARCHIVE_DATABASE, &[Value::from("add"), Value::from(name.as_str())])
            .await?;
        ctx.ledger.invalidate(
            TableId::MysqlDatabases,
            ScopeSet::single(business),
            ScopeSet::everyone(),
        );
        Ok(Reply::Done)
    }
}

/// DISABLE on `usernames`: `username`. Master users only.
pub struct DisableUsername;

const DISABLE_USERNAME_ARGS: &[ArgSpec] = &[ArgSpec::string("username")];

#[async_trait]
impl OperationHandler for DisableUsername {
    fn label(&self) -> &str {
        "disable_username"
    }

    fn arguments(&self) -> &[ArgSpec] {
        DISABLE_USERNAME_ARGS
    }

    async fn execute(
        &self,
        ctx: &mut OperationContext<'_>,
        args: &Arguments,
    ) -> ServerResult<Reply> {
        ctx.require_master().await?;
        let username = args.string("username")?;
        ctx.primary
            .execute(DISABLE_USERNAME, &[Value::from(username)])
            .await?;
        ctx.ledger.invalidate_all(TableId::Usernames);
        Ok(Reply::Done)
    }
}

/// Rows of `name, business` from [`SELECT_DATABASES`].
pub struct ListMysqlDatabases;

fn text_column(record: &Record, column: &str) -> ServerResult<String> {
    record
        .get(column)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ServerError::data(format!("Column {} missing or not text", column)))
}

#[async_trait]
impl OperationHandler for ListMysqlDatabases {
    fn label(&self) -> &str {
        "list_mysql_databases"
    }

    fn invalidates(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        ctx: &mut OperationContext<'_>,
        _args: &Arguments,
    ) -> ServerResult<Reply> {
        let records = ctx.primary.query(SELECT_DATABASES, &[]).await?;
        let rows = records
            .iter()
            .map(|record| {
                Ok(vec![
                    WireValue::Str(text_column(record, "name")?),
                    WireValue::Str(text_column(record, "business")?),
                ])
            })
            .collect::<ServerResult<Vec<_>>>()?;
        Ok(Reply::Rows(rows))
    }
}

/// Writes and invalidates, then fails; nothing may survive it.
pub struct FailingOperation;

#[async_trait]
impl OperationHandler for FailingOperation {
    fn label(&self) -> &str {
        "failing_operation"
    }

    async fn execute(
        &self,
        ctx: &mut OperationContext<'_>,
        _args: &Arguments,
    ) -> ServerResult<Reply> {
        ctx.primary
            .execute(INSERT_DATABASE, &[Value::from("doomed"), Value::from("acme")])
            .await?;
        ctx.ledger.invalidate(
            TableId::MysqlDatabases,
            ScopeSet::single(BusinessId::from("acme")),
            ScopeSet::everyone(),
        );
        Err(ServerError::data("Operation rejected by the datastore"))
    }
}

/// Registry holding every sample handler.
pub fn sample_handlers() -> ServerResult<HandlerRegistry> {
    let mut handlers = HandlerRegistry::new();
    handlers.register_table(Opcode::ADD, TableId::MysqlDatabases, Arc::new(AddMysqlDatabase))?;
    handlers.register_table(Opcode::DISABLE, TableId::Usernames, Arc::new(DisableUsername))?;
    handlers.register(LIST_DATABASES, Arc::new(ListMysqlDatabases))?;
    handlers.register(FAILING_OPERATION, Arc::new(FailingOperation))?;
    Ok(handlers)
}

/// A `mysql_databases` fixture row.
pub fn database_record(name: &str, business: &str) -> Record {
    let mut record = Record::new();
    record.insert("name".to_string(), Value::from(name));
    record.insert("business".to_string(), Value::from(business));
    record
}

// ============================================================================
// TEST SERVER
// ============================================================================

/// Server state over in-memory stores; every connection is a duplex pipe.
pub struct TestServer {
    pub state: Arc<ServerState>,
    pub directory: Arc<InMemoryDirectory>,
    pub primary: InMemoryDatastore,
    pub secondary: InMemoryDatastore,
}

pub struct TestServerBuilder {
    config: ServerConfig,
    directory: Option<InMemoryDirectory>,
    handlers: Option<HandlerRegistry>,
}

impl TestServerBuilder {
    pub fn keepalive(mut self, keepalive: Duration) -> Self {
        self.config.keepalive = keepalive;
        self
    }

    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    pub fn max_login_attempts(mut self, attempts: u32) -> Self {
        self.config.max_login_attempts = attempts;
        self
    }

    pub fn directory(mut self, directory: InMemoryDirectory) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn build(self) -> ServerResult<TestServer> {
        let directory = Arc::new(match self.directory {
            Some(directory) => directory,
            None => standard_directory()?,
        });
        let handlers = match self.handlers {
            Some(handlers) => handlers,
            None => sample_handlers()?,
        };
        let primary = InMemoryDatastore::primary();
        let secondary = InMemoryDatastore::secondary();
        let state = ServerState::new(
            self.config,
            Arc::clone(&directory) as Arc<dyn AccountDirectory>,
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
            handlers,
        )?;
        Ok(TestServer {
            state: Arc::new(state),
            directory,
            primary,
            secondary,
        })
    }
}

impl TestServer {
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder {
            config: ServerConfig::default(),
            directory: None,
            handlers: None,
        }
    }

    /// Standard directory and sample handlers.
    pub fn start() -> ServerResult<Self> {
        Self::builder().build()
    }

    /// Open a raw connection; nothing has been sent yet.
    pub fn connect(&self) -> TestClient {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let state = Arc::clone(&self.state);
        let server_task = tokio::spawn(async move {
            let peer = Peer {
                remote_host: TEST_HOST.to_string(),
                transport: TransportKind::Memory,
            };
            serve_connection(state, server_io, peer).await
        });
        let (read_half, write_half) = tokio::io::split(client_io);
        TestClient {
            reader: WireReader::new(read_half),
            writer: WireWriter::new(write_half),
            codec: CodecTable::for_version(ProtocolVersion::CURRENT),
            server_task,
            connector_id: None,
        }
    }

    /// Connect and log in as `user` at the current protocol version.
    pub async fn login(&self, user: &str) -> ServerResult<TestClient> {
        self.login_with(ProtocolVersion::CURRENT, user, user).await
    }

    pub async fn login_with(
        &self,
        version: ProtocolVersion,
        connect_as: &str,
        authenticate_as: &str,
    ) -> ServerResult<TestClient> {
        let mut client = self.connect();
        client.send_version(version.as_str()).await?;
        client
            .send_credentials(connect_as, authenticate_as, PASSWORD)
            .await?;
        client.expect_login().await?;
        Ok(client)
    }

    /// Client table id of `table` for a viewer of the given version.
    pub fn client_table_id(
        &self,
        table: TableId,
        version: ProtocolVersion,
        is_master: bool,
    ) -> ServerResult<i32> {
        self.state
            .catalog
            .client_id_for(table, version, is_master)
            .ok_or_else(|| ServerError::unsupported_table(-1))
    }

    /// Wait until `count` sessions are in the long-poll loop.
    pub async fn wait_for_listeners(&self, count: usize) -> ServerResult<()> {
        let wait = async {
            while self.state.listeners.listener_count() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .map_err(|_| {
                ServerError::internal(format!(
                    "Expected {} listeners, have {}",
                    count,
                    self.state.listeners.listener_count()
                ))
            })
    }
}

// ============================================================================
// TEST CLIENT
// ============================================================================

/// Wire-level client for one in-memory connection.
pub struct TestClient {
    reader: WireReader<ReadHalf<DuplexStream>>,
    writer: WireWriter<WriteHalf<DuplexStream>>,
    codec: CodecTable,
    server_task: JoinHandle<ServerResult<()>>,
    pub connector_id: Option<ConnectorId>,
}

/// A fault as the client sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFault {
    pub status: u8,
    pub code: Option<i32>,
    pub message: String,
}

impl TestClient {
    pub fn codec(&self) -> &CodecTable {
        &self.codec
    }

    pub fn version(&self) -> ProtocolVersion {
        self.codec.version()
    }

    pub async fn send_version(&mut self, version: &str) -> ServerResult<()> {
        if let Some(parsed) = ProtocolVersion::parse(version) {
            self.codec = CodecTable::for_version(parsed);
        }
        self.writer.write_string(version).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send_credentials(
        &mut self,
        connect_as: &str,
        authenticate_as: &str,
        password: &str,
    ) -> ServerResult<()> {
        self.writer.write_string(connect_as).await?;
        self.writer.write_string(authenticate_as).await?;
        self.writer.write_string(password).await?;
        if self.codec.includes(WireField::HandshakeClientLabel) {
            self.writer.write_string("meridian-test-client").await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Read the handshake answer; a fault becomes an authentication error.
    pub async fn expect_login(&mut self) -> ServerResult<()> {
        let status = self.read_status().await?;
        if status != status::SUCCESS {
            let fault = self.read_fault(status).await?;
            return Err(ServerError::authentication(fault.message));
        }
        if self.codec.includes(WireField::HandshakeConnectorId) {
            self.connector_id = Some(ConnectorId(self.reader.read_long().await?));
        }
        Ok(())
    }

    pub async fn read_status(&mut self) -> ServerResult<u8> {
        Ok(self.reader.read_byte().await?)
    }

    /// The rest of a fault whose status byte was already read.
    pub async fn read_fault(&mut self, status: u8) -> ServerResult<ClientFault> {
        let code = if self.codec.includes(WireField::FaultCode) {
            Some(self.reader.read_compact_int().await?)
        } else {
            None
        };
        let message = self.reader.read_string().await?;
        Ok(ClientFault {
            status,
            code,
            message,
        })
    }

    /// Read a status byte that must introduce a fault.
    pub async fn expect_fault(&mut self) -> ServerResult<ClientFault> {
        let status = self.read_status().await?;
        if status != status::DATA_FAULT && status != status::TRANSPORT_FAULT {
            return Err(ServerError::protocol(format!(
                "Expected a fault, got status {}",
                status
            )));
        }
        self.read_fault(status).await
    }

    pub async fn expect_success(&mut self) -> ServerResult<()> {
        let status = self.read_status().await?;
        if status == status::SUCCESS {
            return Ok(());
        }
        if status == status::DATA_FAULT || status == status::TRANSPORT_FAULT {
            let fault = self.read_fault(status).await?;
            return Err(ServerError::data(fault.message));
        }
        Err(ServerError::protocol(format!(
            "Expected SUCCESS, got status {}",
            status
        )))
    }

    pub async fn read_string(&mut self) -> ServerResult<String> {
        Ok(self.reader.read_string().await?)
    }

    pub async fn read_value(&mut self, kind: WireKind) -> ServerResult<WireValue> {
        Ok(self.reader.read_value(kind).await?)
    }

    /// A `-1`-terminated table id list: a footer or an invalidation batch.
    pub async fn read_table_ids(&mut self) -> ServerResult<Vec<i32>> {
        Ok(self.reader.read_int_list(INVALIDATION_SENTINEL).await?)
    }

    /// Like [`read_table_ids`](Self::read_table_ids), but `None` when nothing
    /// arrives within `wait`. The connection is unusable after a `None`.
    pub async fn try_read_table_ids(&mut self, wait: Duration) -> ServerResult<Option<Vec<i32>>> {
        match tokio::time::timeout(wait, self.read_table_ids()).await {
            Ok(ids) => ids.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Read `NEXT` rows of `kinds` until `NO_MORE_ROWS` or a fault.
    ///
    /// Returns the rows and the fault that ended the stream, if any.
    pub async fn read_rows(
        &mut self,
        kinds: &[WireKind],
    ) -> ServerResult<(Vec<Vec<WireValue>>, Option<ClientFault>)> {
        let mut rows = Vec::new();
        loop {
            let status = self.read_status().await?;
            match status {
                status::NEXT => {
                    let mut row = Vec::with_capacity(kinds.len());
                    for kind in kinds {
                        row.push(self.reader.read_value(*kind).await?);
                    }
                    rows.push(row);
                }
                status::NO_MORE_ROWS => return Ok((rows, None)),
                status::DATA_FAULT | status::TRANSPORT_FAULT => {
                    let fault = self.read_fault(status).await?;
                    return Ok((rows, Some(fault)));
                }
                other => {
                    return Err(ServerError::protocol(format!(
                        "Unexpected status {} in row stream",
                        other
                    )))
                }
            }
        }
    }

    /// Send a request. `table` is the client table id for table-keyed opcodes.
    pub async fn send(
        &mut self,
        opcode: Opcode,
        table: Option<i32>,
        args: &[WireValue],
    ) -> ServerResult<()> {
        self.writer.write_compact_int(opcode.0).await?;
        if let Some(table) = table {
            self.writer.write_compact_int(table).await?;
        }
        for arg in args {
            self.writer.write_value(arg).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn ping(&mut self) -> ServerResult<()> {
        self.send(Opcode::PING, None, &[]).await?;
        self.expect_success().await
    }

    /// Enter the long-poll loop.
    pub async fn listen(&mut self) -> ServerResult<()> {
        self.send(Opcode::LISTEN_CACHES, None, &[]).await
    }

    pub async fn ack(&mut self) -> ServerResult<()> {
        self.writer.write_byte(status::LISTEN_ACK).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send QUIT and wait for the server side to finish.
    pub async fn quit(mut self) -> ServerResult<()> {
        self.send(Opcode::QUIT, None, &[]).await?;
        self.finish().await
    }

    /// Wait for the server side of the connection to end on its own.
    pub async fn finish(self) -> ServerResult<()> {
        let TestClient {
            reader,
            writer,
            server_task,
            ..
        } = self;
        let joined = tokio::time::timeout(Duration::from_secs(5), server_task)
            .await
            .map_err(|_| ServerError::internal("Server side of the connection did not finish"))?;
        drop(reader);
        drop(writer);
        joined.map_err(|e| ServerError::internal(format!("Connection task failed: {}", e)))?
    }

    /// Whether the server closes its end soon. Unread bytes are discarded.
    pub async fn at_eof(&mut self) -> bool {
        let drain = async { while self.reader.read_byte().await.is_ok() {} };
        tokio::time::timeout(Duration::from_secs(5), drain)
            .await
            .is_ok()
    }
}
