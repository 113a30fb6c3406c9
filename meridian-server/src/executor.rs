//! Transactional Executor
//!
//! Runs one handler against a primary and a secondary connection, each with
//! its own open transaction. On handler failure both are rolled back and the
//! ledger is thrown away. On success the secondary commits first, then the
//! primary; a failed secondary commit rolls the primary back. The two commits
//! are independent, so a primary commit failure after the secondary committed
//! leaves the stores inconsistent; that case is logged, not repaired.
//!
//! Row results are streamed to the client inside the transaction. A write
//! failure while streaming rolls both connections back like any other error.

use meridian_core::{TableId, WireValue, WireWriter};
use meridian_storage::{Datastore, DatastoreConnection};
use std::sync::Arc;
use tokio::io::AsyncWrite;

use crate::auth::AccessControl;
use crate::catalog::TableCatalog;
use crate::error::ServerResult;
use crate::ledger::InvalidationLedger;
use crate::registry::{Arguments, OperationContext, OperationHandler, Reply};
use crate::response::write_row;
use crate::scheduling::SchedulingLanes;
use crate::session::Session;
use crate::telemetry::metrics::with_metrics;

/// Outcome of a committed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub ledger: InvalidationLedger,
    /// `Rows` replies come back empty; their rows were already written.
    pub reply: Reply,
    pub rows_streamed: usize,
}

#[derive(Clone)]
pub struct TransactionalExecutor {
    primary: Arc<dyn Datastore>,
    secondary: Arc<dyn Datastore>,
    access: AccessControl,
    catalog: TableCatalog,
    lanes: SchedulingLanes,
}

impl TransactionalExecutor {
    pub fn new(
        primary: Arc<dyn Datastore>,
        secondary: Arc<dyn Datastore>,
        access: AccessControl,
        catalog: TableCatalog,
        lanes: SchedulingLanes,
    ) -> Self {
        Self {
            primary,
            secondary,
            access,
            catalog,
            lanes,
        }
    }

    pub fn lanes(&self) -> &SchedulingLanes {
        &self.lanes
    }

    /// Open and roll back one transaction on each store.
    pub async fn check_stores(&self) -> ServerResult<()> {
        for store in [&self.primary, &self.secondary] {
            let mut connection = store.acquire().await?;
            connection.rollback().await?;
            tracing::debug!(store = %store.role(), "Datastore reachable");
        }
        Ok(())
    }

    pub async fn execute<W: AsyncWrite + Unpin>(
        &self,
        handler: &dyn OperationHandler,
        session: &Session,
        table: Option<TableId>,
        args: &Arguments,
        writer: &mut WireWriter<W>,
    ) -> ServerResult<Execution> {
        // Queued background work must not sit on pooled connections.
        let lane = self.lanes.admit(handler.scheduling_class()).await?;

        // Both connections are released by drop on every path below.
        let mut primary = self.primary.acquire().await?;
        let mut secondary = self.secondary.acquire().await?;
        let mut ledger = InvalidationLedger::new();

        let result = {
            let mut ctx = OperationContext::new(
                primary.as_mut(),
                secondary.as_mut(),
                session,
                &mut ledger,
                &self.access,
                &self.catalog,
                table,
            );
            lane.scope(handler.execute(&mut ctx, args)).await
        };

        let result = match result {
            Ok(Reply::Rows(rows)) => stream_rows(writer, rows).await,
            Ok(reply) => Ok((reply, 0)),
            Err(err) => Err(err),
        };

        let (reply, rows_streamed) = match result {
            Ok(done) => done,
            Err(err) => {
                tracing::debug!(
                    connector_id = %session.connector_id,
                    command = handler.label(),
                    error = %err,
                    "Rolling back"
                );
                rollback(primary.as_mut()).await;
                rollback(secondary.as_mut()).await;
                return Err(err);
            }
        };

        if !secondary.is_closed() {
            if let Err(err) = secondary.commit().await {
                with_metrics(|m| m.record_commit_failure(secondary.role().as_str()));
                tracing::error!(
                    connector_id = %session.connector_id,
                    command = handler.label(),
                    error = %err,
                    "Secondary commit failed, rolling back primary"
                );
                rollback(primary.as_mut()).await;
                return Err(err.into());
            }
        }

        if !primary.is_closed() {
            if let Err(err) = primary.commit().await {
                with_metrics(|m| m.record_commit_failure(primary.role().as_str()));
                tracing::error!(
                    connector_id = %session.connector_id,
                    command = handler.label(),
                    error = %err,
                    "Primary commit failed after secondary committed; stores are inconsistent"
                );
                return Err(err.into());
            }
        }

        Ok(Execution {
            ledger,
            reply,
            rows_streamed,
        })
    }
}

async fn stream_rows<W: AsyncWrite + Unpin>(
    writer: &mut WireWriter<W>,
    rows: Vec<Vec<WireValue>>,
) -> ServerResult<(Reply, usize)> {
    let count = rows.len();
    for row in &rows {
        write_row(writer, row).await?;
    }
    Ok((Reply::Rows(Vec::new()), count))
}

async fn rollback(connection: &mut dyn DatastoreConnection) {
    if connection.is_closed() {
        return;
    }
    if let Err(err) = connection.rollback().await {
        tracing::warn!(store = %connection.role(), error = %err, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caches::ProcessCaches;
    use crate::registry::ArgSpec;
    use crate::scheduling::SchedulingClass;
    use crate::session::{SessionInit, TransportKind};
    use async_trait::async_trait;
    use meridian_core::{BusinessId, ConnectorId, ProtocolVersion, ScopeSet, StorageError};
    use meridian_storage::{InMemoryDatastore, InMemoryDirectory};
    use serde_json::json;
    use std::time::Duration;

    const INSERT: &str = "INSERT INTO mysql_databases (name, business) VALUES ($1, $2)";
    const ARCHIVE: &str = "INSERT INTO archive (entry) VALUES ($1)";

    struct AddDatabase;

    #[async_trait]
    impl OperationHandler for AddDatabase {
        fn label(&self) -> &str {
            "add_mysql_database"
        }

        fn arguments(&self) -> &[ArgSpec] {
            &[]
        }

        async fn execute(
            &self,
            ctx: &mut OperationContext<'_>,
            _: &Arguments,
        ) -> ServerResult<Reply> {
            ctx.primary.execute(INSERT, &[json!("db1"), json!("acme")]).await?;
            ctx.secondary.execute(ARCHIVE, &[json!("db1")]).await?;
            ctx.ledger.invalidate(
                TableId::MysqlDatabases,
                ScopeSet::single(BusinessId::from("acme")),
                ScopeSet::Everyone,
            );
            Ok(Reply::Value(WireValue::Int(1)))
        }
    }

    struct NightlyBackup;

    #[async_trait]
    impl OperationHandler for NightlyBackup {
        fn label(&self) -> &str {
            "nightly_backup"
        }

        fn arguments(&self) -> &[ArgSpec] {
            &[]
        }

        fn scheduling_class(&self) -> SchedulingClass {
            SchedulingClass::Background
        }

        async fn execute(
            &self,
            ctx: &mut OperationContext<'_>,
            _: &Arguments,
        ) -> ServerResult<Reply> {
            ctx.primary.execute(INSERT, &[json!("dump"), json!("acme")]).await?;
            Ok(Reply::Done)
        }
    }

    struct Harness {
        primary: InMemoryDatastore,
        secondary: InMemoryDatastore,
        executor: TransactionalExecutor,
        session: Session,
    }

    fn harness() -> Harness {
        let primary = InMemoryDatastore::primary();
        let secondary = InMemoryDatastore::secondary();
        let directory = Arc::new(InMemoryDirectory::new().with_user("alice", "acme", None));
        let access = AccessControl::new(Arc::new(ProcessCaches::new(directory)));
        let executor = TransactionalExecutor::new(
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
            access.clone(),
            TableCatalog::new(access),
            SchedulingLanes::new(1),
        );
        let session = Session::new(SessionInit {
            connector_id: ConnectorId(1),
            authenticated_user: "alice".into(),
            effective_user: "alice".into(),
            remote_host: "127.0.0.1".to_string(),
            version: ProtocolVersion::CURRENT,
            transport: TransportKind::Memory,
            secure: false,
            client_label: String::new(),
        });
        Harness {
            primary,
            secondary,
            executor,
            session,
        }
    }

    async fn run(h: &Harness) -> ServerResult<Execution> {
        let (a, _b) = tokio::io::duplex(4096);
        let mut writer = WireWriter::new(a);
        h.executor
            .execute(&AddDatabase, &h.session, None, &Arguments::default(), &mut writer)
            .await
    }

    #[tokio::test]
    async fn test_commits_both_and_returns_ledger() -> ServerResult<()> {
        let h = harness();
        let execution = run(&h).await?;
        assert!(execution.ledger.contains(TableId::MysqlDatabases));
        assert_eq!(execution.reply, Reply::Value(WireValue::Int(1)));
        assert_eq!(h.primary.committed().await.len(), 1);
        assert_eq!(h.secondary.committed().await.len(), 1);
        assert_eq!(h.primary.open_connections(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_handler_error_rolls_back_both() {
        let h = harness();
        h.secondary
            .fail_statement(ARCHIVE, StorageError::Query { reason: "archive full".to_string() })
            .await;
        let err = run(&h).await.err();
        assert!(err.map_or(false, |e| e.message.contains("archive full")));
        assert!(h.primary.committed().await.is_empty());
        assert_eq!(h.primary.rollback_count(), 1);
        assert_eq!(h.secondary.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_secondary_commit_failure_rolls_back_primary() {
        let h = harness();
        h.secondary.fail_next_commit("disk full").await;
        assert!(run(&h).await.is_err());
        assert!(h.primary.committed().await.is_empty());
        assert_eq!(h.primary.commit_count(), 0);
        assert_eq!(h.primary.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_primary_commit_failure_is_reported() {
        let h = harness();
        h.primary.fail_next_commit("lost").await;
        assert!(run(&h).await.is_err());
        assert_eq!(h.secondary.committed().await.len(), 1);
        assert!(h.primary.committed().await.is_empty());
    }

    #[tokio::test]
    async fn test_check_stores_reports_unreachable_secondary() -> ServerResult<()> {
        let h = harness();
        h.executor.check_stores().await?;
        assert_eq!(h.primary.open_connections(), 0);
        assert_eq!(h.secondary.rollback_count(), 1);

        h.secondary
            .fail_next_acquire(StorageError::Connection {
                store: "secondary".to_string(),
                reason: "connection refused".to_string(),
            })
            .await;
        let err = h.executor.check_stores().await.err();
        assert!(err.map_or(false, |e| e.message.contains("connection refused")));
        Ok(())
    }

    #[tokio::test]
    async fn test_queued_background_request_holds_no_connections() -> ServerResult<()> {
        let h = harness();
        let held = h.executor.lanes().admit(SchedulingClass::Background).await?;

        let (a, _b) = tokio::io::duplex(4096);
        let mut writer = WireWriter::new(a);
        let args = Arguments::default();
        let queued = h.executor.execute(
            &NightlyBackup,
            &h.session,
            None,
            &args,
            &mut writer,
        );
        let observe = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let open = (
                h.primary.acquired_count(),
                h.primary.open_connections(),
                h.secondary.open_connections(),
            );
            drop(held);
            open
        };
        let (result, while_queued) = tokio::join!(queued, observe);
        assert_eq!(while_queued, (0, 0, 0));
        result?;
        assert_eq!(h.primary.committed().await.len(), 1);
        assert_eq!(h.executor.lanes().background_available(), 1);
        Ok(())
    }
}
