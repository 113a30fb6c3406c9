//! In-memory datastore for tests and local development.
//!
//! Executed statements are journaled per connection and only become visible
//! in [`InMemoryDatastore::committed`] after a successful commit. Query
//! results are served from fixtures registered by statement text. Commit and
//! statement failures can be injected to exercise rollback paths.

use async_trait::async_trait;
use meridian_core::{StorageError, StorageResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{Datastore, DatastoreConnection, Record, StoreRole};

/// A statement that reached the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub statement: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Default)]
struct MemoryState {
    committed: Vec<ExecutedStatement>,
    fixtures: HashMap<String, Vec<Record>>,
    failing_statements: HashMap<String, StorageError>,
    fail_next_commit: Option<String>,
    fail_next_acquire: Option<StorageError>,
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicUsize,
    open: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// In-memory store. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryDatastore {
    role: StoreRole,
    state: Arc<Mutex<MemoryState>>,
    counters: Arc<Counters>,
}

impl InMemoryDatastore {
    pub fn new(role: StoreRole) -> Self {
        Self {
            role,
            state: Arc::new(Mutex::new(MemoryState::default())),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn primary() -> Self {
        Self::new(StoreRole::Primary)
    }

    pub fn secondary() -> Self {
        Self::new(StoreRole::Secondary)
    }

    /// Serve `rows` for every query whose text equals `statement`.
    pub async fn set_query_result(&self, statement: impl Into<String>, rows: Vec<Record>) {
        self.state.lock().await.fixtures.insert(statement.into(), rows);
    }

    /// Make every execution of `statement` fail with `error`.
    pub async fn fail_statement(&self, statement: impl Into<String>, error: StorageError) {
        self.state
            .lock()
            .await
            .failing_statements
            .insert(statement.into(), error);
    }

    /// Make the next commit on any connection fail.
    pub async fn fail_next_commit(&self, reason: impl Into<String>) {
        self.state.lock().await.fail_next_commit = Some(reason.into());
    }

    /// Make the next acquire fail.
    pub async fn fail_next_acquire(&self, error: StorageError) {
        self.state.lock().await.fail_next_acquire = Some(error);
    }

    /// Statements from committed transactions, in commit order.
    pub async fn committed(&self) -> Vec<ExecutedStatement> {
        self.state.lock().await.committed.clone()
    }

    pub fn acquired_count(&self) -> usize {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    /// Connections checked out and not yet dropped.
    pub fn open_connections(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.counters.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.counters.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    fn role(&self) -> StoreRole {
        self.role
    }

    async fn acquire(&self) -> StorageResult<Box<dyn DatastoreConnection>> {
        if let Some(err) = self.state.lock().await.fail_next_acquire.take() {
            return Err(err);
        }
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        self.counters.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryConnection {
            role: self.role,
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
            pending: Vec::new(),
            open: true,
        }))
    }
}

struct InMemoryConnection {
    role: StoreRole,
    state: Arc<Mutex<MemoryState>>,
    counters: Arc<Counters>,
    pending: Vec<ExecutedStatement>,
    open: bool,
}

impl InMemoryConnection {
    async fn check(&self, statement: &str) -> StorageResult<()> {
        if !self.open {
            return Err(StorageError::TransactionClosed);
        }
        match self.state.lock().await.failing_statements.get(statement) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DatastoreConnection for InMemoryConnection {
    fn role(&self) -> StoreRole {
        self.role
    }

    async fn query(&mut self, statement: &str, _params: &[Value]) -> StorageResult<Vec<Record>> {
        self.check(statement).await?;
        let state = self.state.lock().await;
        Ok(state.fixtures.get(statement).cloned().unwrap_or_default())
    }

    async fn execute(&mut self, statement: &str, params: &[Value]) -> StorageResult<u64> {
        self.check(statement).await?;
        self.pending.push(ExecutedStatement {
            statement: statement.to_string(),
            params: params.to_vec(),
        });
        Ok(1)
    }

    async fn commit(&mut self) -> StorageResult<()> {
        if !self.open {
            return Err(StorageError::TransactionClosed);
        }
        self.open = false;
        let mut state = self.state.lock().await;
        if let Some(reason) = state.fail_next_commit.take() {
            self.pending.clear();
            self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::CommitFailed {
                store: self.role.to_string(),
                reason,
            });
        }
        state.committed.append(&mut self.pending);
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        if !self.open {
            return Err(StorageError::TransactionClosed);
        }
        self.open = false;
        self.pending.clear();
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        !self.open
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        if self.open {
            self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_publishes_pending_statements() -> StorageResult<()> {
        let store = InMemoryDatastore::primary();
        let mut conn = store.acquire().await?;
        conn.execute("INSERT INTO mysql_databases VALUES ($1)", &[Value::from("shop")])
            .await?;
        assert!(store.committed().await.is_empty());
        conn.commit().await?;
        assert_eq!(store.committed().await.len(), 1);
        assert_eq!(store.commit_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_rollback_discards() -> StorageResult<()> {
        let store = InMemoryDatastore::secondary();
        let mut conn = store.acquire().await?;
        conn.execute("DELETE FROM tickets", &[]).await?;
        conn.rollback().await?;
        assert!(conn.is_closed());
        assert!(store.committed().await.is_empty());
        assert_eq!(store.rollback_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_commit_failure() -> StorageResult<()> {
        let store = InMemoryDatastore::secondary();
        store.fail_next_commit("disk full").await;
        let mut conn = store.acquire().await?;
        conn.execute("UPDATE x", &[]).await?;
        let err = conn.commit().await.unwrap_err();
        assert!(matches!(err, StorageError::CommitFailed { .. }));
        assert!(store.committed().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_drop_releases_connection() -> StorageResult<()> {
        let store = InMemoryDatastore::primary();
        {
            let _conn = store.acquire().await?;
            assert_eq!(store.open_connections(), 1);
        }
        assert_eq!(store.open_connections(), 0);
        assert_eq!(store.rollback_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_query_fixture() -> StorageResult<()> {
        let store = InMemoryDatastore::primary();
        let mut row = Record::new();
        row.insert("name".to_string(), Value::from("shop"));
        store.set_query_result("SELECT name FROM mysql_databases", vec![row]).await;

        let mut conn = store.acquire().await?;
        let rows = conn.query("SELECT name FROM mysql_databases", &[]).await?;
        assert_eq!(rows.len(), 1);
        assert!(conn.query_opt("SELECT 1", &[]).await?.is_none());
        Ok(())
    }
}
