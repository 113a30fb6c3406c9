//! Long-poll keepalives and account rechecks.

use meridian_test_utils::{
    Opcode, ProtocolVersion, ServerResult, TableId, TestServer, UserId, WireValue,
};
use std::time::Duration;

const KEEPALIVE: Duration = Duration::from_millis(50);

#[tokio::test]
async fn test_keepalive_sent_to_current_clients() -> ServerResult<()> {
    let server = TestServer::builder().keepalive(KEEPALIVE).build()?;
    let mut listener = server.login("alice").await?;
    listener.listen().await?;

    let keepalive = listener.try_read_table_ids(Duration::from_secs(2)).await?;
    assert_eq!(keepalive, Some(vec![]));
    // Keepalives are not acknowledged; the next one follows on its own.
    let keepalive = listener.try_read_table_ids(Duration::from_secs(2)).await?;
    assert_eq!(keepalive, Some(vec![]));
    Ok(())
}

#[tokio::test]
async fn test_no_keepalive_before_1_44() -> ServerResult<()> {
    let server = TestServer::builder().keepalive(KEEPALIVE).build()?;
    let mut listener = server
        .login_with(ProtocolVersion::V1_30, "alice", "alice")
        .await?;
    listener.listen().await?;
    server.wait_for_listeners(1).await?;

    assert_eq!(listener.try_read_table_ids(KEEPALIVE * 6).await?, None);
    assert_eq!(server.state.listeners.listener_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_disabled_account_ends_loop_on_timeout() -> ServerResult<()> {
    let server = TestServer::builder().keepalive(KEEPALIVE).build()?;
    let mut listener = server.login("alice").await?;
    listener.listen().await?;
    server.wait_for_listeners(1).await?;

    server
        .directory
        .set_disabled(&UserId::from("alice"), true)
        .await;
    // Possibly one keepalive raced the change; the loop then ends.
    while let Some(ids) = listener.try_read_table_ids(Duration::from_secs(2)).await.ok().flatten() {
        assert!(ids.is_empty());
    }
    server.wait_for_listeners(0).await?;
    listener.finish().await
}

#[tokio::test]
async fn test_disabling_switched_target_ends_loop() -> ServerResult<()> {
    let server = TestServer::builder().keepalive(KEEPALIVE).build()?;
    let mut listener = server
        .login_with(ProtocolVersion::CURRENT, "alice", "root")
        .await?;
    listener.listen().await?;
    server.wait_for_listeners(1).await?;

    server
        .directory
        .set_disabled(&UserId::from("alice"), true)
        .await;
    server.wait_for_listeners(0).await?;
    assert!(listener.at_eof().await);
    Ok(())
}

#[tokio::test]
async fn test_account_table_change_triggers_recheck() -> ServerResult<()> {
    // Long keepalive: only the invalidation can end the loop in time.
    let server = TestServer::builder()
        .keepalive(Duration::from_secs(600))
        .build()?;
    let usernames = server.client_table_id(TableId::Usernames, ProtocolVersion::CURRENT, false)?;

    let mut listener = server.login("alice").await?;
    listener.listen().await?;
    server.wait_for_listeners(1).await?;

    server
        .directory
        .set_disabled(&UserId::from("alice"), true)
        .await;
    let mut root = server.login("root").await?;
    let root_usernames =
        server.client_table_id(TableId::Usernames, ProtocolVersion::CURRENT, true)?;
    root.send(
        Opcode::DISABLE,
        Some(root_usernames),
        &[WireValue::Str("alice".to_string())],
    )
    .await?;
    root.expect_success().await?;
    assert_eq!(root.read_table_ids().await?, vec![root_usernames]);

    assert_eq!(
        listener.try_read_table_ids(Duration::from_secs(2)).await?,
        Some(vec![usernames])
    );
    listener.ack().await?;
    listener.finish().await?;
    assert_eq!(server.state.listeners.listener_count(), 0);

    root.quit().await
}

#[tokio::test]
async fn test_unacknowledged_batch_ends_when_account_disabled() -> ServerResult<()> {
    let server = TestServer::builder().keepalive(KEEPALIVE).build()?;
    let table = server.client_table_id(TableId::MysqlDatabases, ProtocolVersion::CURRENT, false)?;
    let mut listener = server.login("alice").await?;
    listener.listen().await?;
    server.wait_for_listeners(1).await?;

    let mut writer = server.login("alice").await?;
    writer
        .send(
            Opcode::ADD,
            Some(table),
            &[
                WireValue::Str("shop".to_string()),
                WireValue::Str("acme".to_string()),
            ],
        )
        .await?;
    writer.expect_success().await?;
    assert_eq!(writer.read_table_ids().await?, vec![table]);
    writer.quit().await?;

    // Skip keepalives sent before the batch.
    let batch = loop {
        match listener.try_read_table_ids(Duration::from_secs(2)).await? {
            Some(ids) if ids.is_empty() => continue,
            other => break other,
        }
    };
    assert_eq!(batch, Some(vec![table]));

    // No ack: the server keeps waiting and writes nothing meanwhile.
    assert_eq!(listener.try_read_table_ids(KEEPALIVE * 4).await?, None);
    assert_eq!(server.state.listeners.listener_count(), 1);

    server
        .directory
        .set_disabled(&UserId::from("alice"), true)
        .await;
    server.wait_for_listeners(0).await?;
    assert!(listener.at_eof().await);
    Ok(())
}
