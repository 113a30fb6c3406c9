//! Transactional datastore abstraction.
//!
//! Every request runs against two independent stores: the primary operational
//! database and a secondary archival database. A [`DatastoreConnection`] is a
//! pooled connection with a transaction already open; it is finished with
//! exactly one of [`commit`](DatastoreConnection::commit) or
//! [`rollback`](DatastoreConnection::rollback). Dropping a connection that is
//! still open abandons its transaction.

mod memory;
mod postgres;

pub use memory::{ExecutedStatement, InMemoryDatastore};
pub use postgres::{map_pg_error, map_pool_error, PgConnection, PgDatastore};

use async_trait::async_trait;
use meridian_core::StorageResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A result row keyed by column name.
pub type Record = serde_json::Map<String, Value>;

/// Which of the two stores a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreRole {
    Primary,
    Secondary,
}

impl StoreRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreRole::Primary => "primary",
            StoreRole::Secondary => "secondary",
        }
    }
}

impl fmt::Display for StoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of transactional connections.
#[async_trait]
pub trait Datastore: Send + Sync {
    fn role(&self) -> StoreRole;

    /// Check out a connection with a fresh transaction open.
    async fn acquire(&self) -> StorageResult<Box<dyn DatastoreConnection>>;
}

/// A pooled connection holding one open transaction.
#[async_trait]
pub trait DatastoreConnection: Send {
    fn role(&self) -> StoreRole;

    async fn query(&mut self, statement: &str, params: &[Value]) -> StorageResult<Vec<Record>>;

    /// Run a statement and return the number of affected rows.
    async fn execute(&mut self, statement: &str, params: &[Value]) -> StorageResult<u64>;

    async fn commit(&mut self) -> StorageResult<()>;

    async fn rollback(&mut self) -> StorageResult<()>;

    /// True once the transaction has been committed or rolled back.
    fn is_closed(&self) -> bool;

    async fn query_opt(&mut self, statement: &str, params: &[Value]) -> StorageResult<Option<Record>> {
        Ok(self.query(statement, params).await?.into_iter().next())
    }
}
