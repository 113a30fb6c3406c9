//! Cache invalidation delivery across connections.

use meridian_test_utils::{
    Opcode, ProtocolVersion, ServerResult, TableId, TestServer, WireValue, FAILING_OPERATION,
};
use std::time::Duration;

const DELIVERY: Duration = Duration::from_secs(2);
const SILENCE: Duration = Duration::from_millis(200);

fn add_args(name: &str, business: &str) -> [WireValue; 2] {
    [
        WireValue::Str(name.to_string()),
        WireValue::Str(business.to_string()),
    ]
}

fn mysql_id(server: &TestServer) -> ServerResult<i32> {
    server.client_table_id(TableId::MysqlDatabases, ProtocolVersion::CURRENT, false)
}

#[tokio::test]
async fn test_delivers_only_to_listeners_in_scope() -> ServerResult<()> {
    let server = TestServer::start()?;
    let table = mysql_id(&server)?;

    let mut alice_listener = server.login("alice").await?;
    let mut bob_listener = server.login("bob").await?;
    let mut root_listener = server.login("root").await?;
    alice_listener.listen().await?;
    bob_listener.listen().await?;
    root_listener.listen().await?;
    server.wait_for_listeners(3).await?;

    let mut writer = server.login("alice").await?;
    writer
        .send(Opcode::ADD, Some(table), &add_args("shop", "acme"))
        .await?;
    writer.expect_success().await?;
    assert_eq!(writer.read_table_ids().await?, vec![table]);

    assert_eq!(alice_listener.try_read_table_ids(DELIVERY).await?, Some(vec![table]));
    alice_listener.ack().await?;
    assert_eq!(root_listener.try_read_table_ids(DELIVERY).await?, Some(vec![table]));
    root_listener.ack().await?;
    assert_eq!(bob_listener.try_read_table_ids(SILENCE).await?, None);

    writer.quit().await
}

#[tokio::test]
async fn test_child_business_changes_reach_parent_but_not_sibling() -> ServerResult<()> {
    let server = TestServer::start()?;
    let table = mysql_id(&server)?;

    let mut alice_listener = server.login("alice").await?;
    let mut carol_listener = server.login("carol").await?;
    alice_listener.listen().await?;
    carol_listener.listen().await?;
    server.wait_for_listeners(2).await?;

    let mut writer = server.login("alice").await?;
    writer
        .send(Opcode::ADD, Some(table), &add_args("blog", "acme-sub"))
        .await?;
    writer.expect_success().await?;
    writer.read_table_ids().await?;

    assert_eq!(alice_listener.try_read_table_ids(DELIVERY).await?, Some(vec![table]));
    assert_eq!(carol_listener.try_read_table_ids(DELIVERY).await?, Some(vec![table]));

    // carol's business sits below acme, so acme's own changes stay hidden.
    alice_listener.ack().await?;
    carol_listener.ack().await?;
    writer
        .send(Opcode::ADD, Some(table), &add_args("shop", "acme"))
        .await?;
    writer.expect_success().await?;
    writer.read_table_ids().await?;

    assert_eq!(alice_listener.try_read_table_ids(DELIVERY).await?, Some(vec![table]));
    assert_eq!(carol_listener.try_read_table_ids(SILENCE).await?, None);
    writer.quit().await
}

#[tokio::test]
async fn test_ids_are_translated_per_listener_version() -> ServerResult<()> {
    let server = TestServer::start()?;
    let current = mysql_id(&server)?;
    let old = server.client_table_id(TableId::MysqlDatabases, ProtocolVersion::V1_30, false)?;
    assert_ne!(current, old);

    let mut listener = server
        .login_with(ProtocolVersion::V1_30, "alice", "alice")
        .await?;
    listener.listen().await?;
    server.wait_for_listeners(1).await?;

    let mut writer = server.login("alice").await?;
    writer
        .send(Opcode::ADD, Some(current), &add_args("shop", "acme"))
        .await?;
    writer.expect_success().await?;
    assert_eq!(writer.read_table_ids().await?, vec![current]);

    assert_eq!(listener.try_read_table_ids(DELIVERY).await?, Some(vec![old]));
    writer.quit().await
}

#[tokio::test]
async fn test_failed_request_broadcasts_nothing() -> ServerResult<()> {
    let server = TestServer::start()?;
    let mut listener = server.login("alice").await?;
    listener.listen().await?;
    server.wait_for_listeners(1).await?;

    let mut writer = server.login("alice").await?;
    writer.send(FAILING_OPERATION, None, &[]).await?;
    writer.expect_fault().await?;

    assert_eq!(listener.try_read_table_ids(SILENCE).await?, None);
    writer.quit().await
}

#[tokio::test]
async fn test_commit_failure_broadcasts_nothing() -> ServerResult<()> {
    let server = TestServer::start()?;
    let table = mysql_id(&server)?;
    let mut listener = server.login("alice").await?;
    listener.listen().await?;
    server.wait_for_listeners(1).await?;

    server.secondary.fail_next_commit("archive offline").await;
    let mut writer = server.login("alice").await?;
    writer
        .send(Opcode::ADD, Some(table), &add_args("shop", "acme"))
        .await?;
    writer.expect_fault().await?;

    assert_eq!(listener.try_read_table_ids(SILENCE).await?, None);
    assert!(server.primary.committed().await.is_empty());
    writer.quit().await
}

#[tokio::test]
async fn test_listener_is_unregistered_when_connection_ends() -> ServerResult<()> {
    let server = TestServer::start()?;
    let table = mysql_id(&server)?;
    let mut listener = server.login("alice").await?;
    listener.listen().await?;
    server.wait_for_listeners(1).await?;

    let mut writer = server.login("alice").await?;
    writer
        .send(Opcode::ADD, Some(table), &add_args("shop", "acme"))
        .await?;
    writer.expect_success().await?;
    writer.read_table_ids().await?;

    // A wrong acknowledgement ends the loop with a protocol fault.
    assert_eq!(listener.try_read_table_ids(DELIVERY).await?, Some(vec![table]));
    listener.send(Opcode(42), None, &[]).await?;
    let result = listener.finish().await;
    assert!(result.is_err_and(|e| e.fatal));
    server.wait_for_listeners(0).await?;

    writer.quit().await
}
