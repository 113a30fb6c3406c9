//! Request dispatch, transactional execution and introspection.

use meridian_test_utils::{
    database_record, status, Opcode, ProtocolVersion, ServerResult, TableId, TestServer,
    WireKind, WireValue, FAILING_OPERATION, LIST_DATABASES, SELECT_DATABASES,
};
use std::time::Duration;

fn add_args(name: &str, business: &str) -> [WireValue; 2] {
    [
        WireValue::Str(name.to_string()),
        WireValue::Str(business.to_string()),
    ]
}

const HISTORY_ROW: &[WireKind] = &[
    WireKind::Int,
    WireKind::Long,
    WireKind::Str,
    WireKind::Str,
    WireKind::Str,
    WireKind::Str,
    WireKind::Bool,
    WireKind::Long,
    WireKind::Long,
    WireKind::Str,
];

#[tokio::test]
async fn test_control_opcodes_answer_success() -> ServerResult<()> {
    let server = TestServer::start()?;
    let mut client = server.login("alice").await?;

    client.ping().await?;
    client.send(Opcode::TEST_CONNECTION, None, &[]).await?;
    client.expect_success().await?;

    // Control opcodes are not counted.
    assert_eq!(server.state.stats.snapshot().total_requests, 0);
    assert!(server.state.history.is_empty());
    client.quit().await
}

#[tokio::test]
async fn test_add_commits_both_stores_and_writes_footer() -> ServerResult<()> {
    let server = TestServer::start()?;
    let mut alice = server.login("alice").await?;
    let table = server.client_table_id(TableId::MysqlDatabases, ProtocolVersion::CURRENT, false)?;

    alice
        .send(Opcode::ADD, Some(table), &add_args("shop", "acme"))
        .await?;
    alice.expect_success().await?;
    assert_eq!(alice.read_table_ids().await?, vec![table]);

    assert_eq!(server.primary.committed().await.len(), 1);
    assert_eq!(server.secondary.committed().await.len(), 1);
    assert_eq!(server.primary.open_connections(), 0);
    assert_eq!(server.secondary.open_connections(), 0);
    alice.quit().await
}

#[tokio::test]
async fn test_unauthorized_request_fails_without_closing() -> ServerResult<()> {
    let server = TestServer::start()?;
    let mut bob = server.login("bob").await?;
    let table = server.client_table_id(TableId::MysqlDatabases, ProtocolVersion::CURRENT, false)?;

    bob.send(Opcode::ADD, Some(table), &add_args("stolen", "acme"))
        .await?;
    let fault = bob.expect_fault().await?;
    assert_eq!(fault.code, Some(2));
    assert!(fault.message.contains("bob may not access business acme"));
    assert!(server.primary.committed().await.is_empty());
    assert_eq!(server.primary.rollback_count(), 1);
    assert_eq!(server.secondary.rollback_count(), 1);

    bob.ping().await?;
    bob.quit().await
}

#[tokio::test]
async fn test_unknown_opcode_keeps_connection_open() -> ServerResult<()> {
    let server = TestServer::start()?;
    let mut client = server.login("alice").await?;

    client
        .send(Opcode(9_999), None, &[WireValue::Str("junk".to_string())])
        .await?;
    let fault = client.expect_fault().await?;
    assert_eq!(fault.status, status::DATA_FAULT);
    assert_eq!(fault.code, Some(3));
    assert_eq!(server.primary.acquired_count(), 0);

    client.ping().await?;
    client.quit().await
}

#[tokio::test]
async fn test_unknown_table_id_keeps_connection_open() -> ServerResult<()> {
    let server = TestServer::start()?;
    let mut client = server.login("alice").await?;

    client
        .send(Opcode::ADD, Some(10_000), &add_args("shop", "acme"))
        .await?;
    let fault = client.expect_fault().await?;
    assert!(fault.message.contains("Unsupported table id 10000"));

    // A table with no ADD handler is rejected the same way.
    let dns = server.client_table_id(TableId::DnsZones, ProtocolVersion::CURRENT, false)?;
    client.send(Opcode::ADD, Some(dns), &[]).await?;
    let fault = client.expect_fault().await?;
    assert_eq!(fault.code, Some(3));

    client.ping().await?;
    client.quit().await
}

#[tokio::test]
async fn test_administrative_table_hidden_from_regular_users() -> ServerResult<()> {
    let server = TestServer::start()?;
    let mut alice = server.login("alice").await?;
    let hosts = server.client_table_id(TableId::MasterHosts, ProtocolVersion::CURRENT, true)?;

    alice.send(Opcode::REMOVE, Some(hosts), &[]).await?;
    let fault = alice.expect_fault().await?;
    assert!(fault.message.contains("Unsupported table id"));
    alice.quit().await
}

#[tokio::test]
async fn test_handler_failure_rolls_back() -> ServerResult<()> {
    let server = TestServer::start()?;
    let mut alice = server.login("alice").await?;

    alice.send(FAILING_OPERATION, None, &[]).await?;
    let fault = alice.expect_fault().await?;
    assert_eq!(fault.code, Some(4));
    assert!(server.primary.committed().await.is_empty());
    assert_eq!(server.primary.rollback_count(), 1);
    assert_eq!(server.primary.commit_count(), 0);

    alice.ping().await?;
    alice.quit().await
}

#[tokio::test]
async fn test_secondary_commit_failure_commits_nothing() -> ServerResult<()> {
    let server = TestServer::start()?;
    let mut alice = server.login("alice").await?;
    let table = server.client_table_id(TableId::MysqlDatabases, ProtocolVersion::CURRENT, false)?;
    server.secondary.fail_next_commit("archive offline").await;

    alice
        .send(Opcode::ADD, Some(table), &add_args("shop", "acme"))
        .await?;
    let fault = alice.expect_fault().await?;
    assert!(fault.message.contains("archive offline"));
    assert!(server.primary.committed().await.is_empty());
    assert!(server.secondary.committed().await.is_empty());
    assert_eq!(server.primary.commit_count(), 0);

    alice.ping().await?;
    alice.quit().await
}

#[tokio::test]
async fn test_rows_stream_then_end() -> ServerResult<()> {
    let server = TestServer::start()?;
    server
        .primary
        .set_query_result(
            SELECT_DATABASES,
            vec![database_record("blog", "acme"), database_record("shop", "acme")],
        )
        .await;
    let mut alice = server.login("alice").await?;

    alice.send(LIST_DATABASES, None, &[]).await?;
    let (rows, fault) = alice.read_rows(&[WireKind::Str, WireKind::Str]).await?;
    assert_eq!(fault, None);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0], WireValue::Str("blog".to_string()));

    // No footer follows a non-invalidating request.
    alice.ping().await?;
    alice.quit().await
}

#[tokio::test]
async fn test_rows_then_fault_when_commit_fails() -> ServerResult<()> {
    let server = TestServer::start()?;
    server
        .primary
        .set_query_result(SELECT_DATABASES, vec![database_record("blog", "acme")])
        .await;
    server.secondary.fail_next_commit("archive offline").await;
    let mut alice = server.login("alice").await?;

    alice.send(LIST_DATABASES, None, &[]).await?;
    let (rows, fault) = alice.read_rows(&[WireKind::Str, WireKind::Str]).await?;
    assert_eq!(rows.len(), 1);
    let fault = fault.map(|f| f.message).unwrap_or_default();
    assert!(fault.contains("archive offline"));

    alice.ping().await?;
    alice.quit().await
}

#[tokio::test]
async fn test_history_keeps_newest_entries() -> ServerResult<()> {
    let server = TestServer::builder().history_capacity(4).build()?;
    let mut alice = server.login("alice").await?;
    for _ in 0..9 {
        alice.send(LIST_DATABASES, None, &[]).await?;
        alice.read_rows(&[]).await?;
    }
    assert_eq!(server.state.stats.snapshot().total_requests, 9);

    let mut root = server.login("root").await?;
    root.send(Opcode::GET_COMMAND_HISTORY, None, &[]).await?;
    let (rows, fault) = root.read_rows(HISTORY_ROW).await?;
    assert_eq!(fault, None);
    assert_eq!(rows.len(), 4);
    for row in &rows {
        assert_eq!(row[2], WireValue::Str("alice".to_string()));
        assert_eq!(row[4], WireValue::Str("127.0.0.1".to_string()));
        assert_eq!(row[9], WireValue::Str("list_mysql_databases".to_string()));
    }

    alice.quit().await?;
    root.quit().await
}

#[tokio::test]
async fn test_history_hides_users_outside_requester_scope() -> ServerResult<()> {
    let server = TestServer::start()?;
    let mut alice = server.login("alice").await?;
    alice.send(LIST_DATABASES, None, &[]).await?;
    alice.read_rows(&[]).await?;

    let mut bob = server.login("bob").await?;
    bob.send(Opcode::GET_COMMAND_HISTORY, None, &[]).await?;
    let (rows, _) = bob.read_rows(HISTORY_ROW).await?;
    assert!(rows.is_empty());

    alice.send(Opcode::GET_COMMAND_HISTORY, None, &[]).await?;
    let (rows, _) = alice.read_rows(HISTORY_ROW).await?;
    assert_eq!(rows.len(), 1);

    alice.quit().await?;
    bob.quit().await
}

#[tokio::test]
async fn test_history_columns_follow_version() -> ServerResult<()> {
    let server = TestServer::start()?;
    let mut root = server.login_with(ProtocolVersion::V1_0, "root", "root").await?;
    root.send(LIST_DATABASES, None, &[]).await?;
    root.read_rows(&[]).await?;

    // No effective user and no secure flag before 1.30 / 1.80.
    root.send(Opcode::GET_COMMAND_HISTORY, None, &[]).await?;
    let old_row = [
        WireKind::Int,
        WireKind::Long,
        WireKind::Str,
        WireKind::Str,
        WireKind::Str,
        WireKind::Long,
        WireKind::Long,
        WireKind::Str,
    ];
    let (rows, fault) = root.read_rows(&old_row).await?;
    assert_eq!(fault, None);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][4], WireValue::Str("1.0".to_string()));
    root.quit().await
}

#[tokio::test]
async fn test_server_stats_require_master() -> ServerResult<()> {
    let server = TestServer::start()?;
    let mut root = server.login("root").await?;

    root.send(Opcode::GET_SERVER_STATS, None, &[]).await?;
    root.expect_success().await?;
    let concurrency = root.read_value(WireKind::Long).await?;
    let peak = root.read_value(WireKind::Long).await?;
    let total = root.read_value(WireKind::Long).await?;
    root.read_value(WireKind::Long).await?;
    assert_eq!(concurrency, WireValue::Long(1));
    assert_eq!(peak, WireValue::Long(1));
    assert_eq!(total, WireValue::Long(1));

    let mut alice = server.login("alice").await?;
    alice.send(Opcode::GET_SERVER_STATS, None, &[]).await?;
    let fault = alice.expect_fault().await?;
    assert_eq!(fault.code, Some(2));

    root.quit().await?;
    alice.quit().await
}

#[tokio::test]
async fn test_footer_lists_tables_filtered_for_other_listeners() -> ServerResult<()> {
    let server = TestServer::start()?;
    let root_table = server.client_table_id(TableId::MysqlDatabases, ProtocolVersion::CURRENT, true)?;
    let user_table =
        server.client_table_id(TableId::MysqlDatabases, ProtocolVersion::CURRENT, false)?;

    let mut alice_listener = server.login("alice").await?;
    let mut bob_listener = server.login("bob").await?;
    alice_listener.listen().await?;
    bob_listener.listen().await?;
    server.wait_for_listeners(2).await?;

    let mut root = server.login("root").await?;
    root.send(Opcode::ADD, Some(root_table), &add_args("ledger", "other"))
        .await?;
    root.expect_success().await?;
    assert_eq!(root.read_table_ids().await?, vec![root_table]);

    assert_eq!(
        bob_listener.try_read_table_ids(Duration::from_secs(2)).await?,
        Some(vec![user_table])
    );
    assert_eq!(
        alice_listener.try_read_table_ids(Duration::from_millis(200)).await?,
        None
    );
    root.quit().await
}
