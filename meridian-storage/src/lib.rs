//! Meridian Storage - Datastores and Account Directory
//!
//! Defines the transactional datastore abstraction used by the request
//! executor, its PostgreSQL and in-memory implementations, and the account
//! directory the server's access control caches are loaded from.

pub mod config;
pub mod datastore;
pub mod directory;

pub use config::DbConfig;
pub use datastore::{
    map_pg_error, map_pool_error, Datastore, DatastoreConnection, ExecutedStatement,
    InMemoryDatastore, PgConnection, PgDatastore, Record, StoreRole,
};
pub use directory::{
    AccountDirectory, BusinessRecord, BusinessServerRecord, FailoverRecord, InMemoryDirectory,
    MasterHostRecord, MasterServerRecord, MasterUserRecord, PgDirectory, SwitchGrantRecord,
    UserRecord,
};
