//! Account directory: the credential and access-control source tables.
//!
//! The server's access control caches are loaded from an [`AccountDirectory`].
//! Each `load_*` method reads one whole source table; the table it reads is
//! noted so cache invalidation can be keyed on it.

mod memory;
mod postgres;

pub use memory::InMemoryDirectory;
pub use postgres::PgDirectory;

use async_trait::async_trait;
use meridian_core::{BusinessId, ServerId, StorageResult, UserId};

/// A login account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: UserId,
    pub business: BusinessId,
    pub disabled: bool,
    /// bcrypt hash; `None` means the account cannot log in with a password.
    pub password_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterUserRecord {
    pub username: UserId,
    pub active: bool,
}

/// Host allow-list entry of a master user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterHostRecord {
    pub username: UserId,
    pub host: String,
}

/// Server restriction of a master user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterServerRecord {
    pub username: UserId,
    pub server: ServerId,
}

/// `from` may connect as `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchGrantRecord {
    pub from: UserId,
    pub to: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessRecord {
    pub business: BusinessId,
    pub parent: Option<BusinessId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessServerRecord {
    pub business: BusinessId,
    pub server: ServerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverRecord {
    pub server: ServerId,
    pub parent: ServerId,
}

/// Read access to accounts and access-control tables.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Look up one account. Login and disabled checks always come here.
    async fn find_user(&self, username: &UserId) -> StorageResult<Option<UserRecord>>;

    /// Source: `master_users`.
    async fn load_master_users(&self) -> StorageResult<Vec<MasterUserRecord>>;

    /// Source: `master_hosts`.
    async fn load_master_hosts(&self) -> StorageResult<Vec<MasterHostRecord>>;

    /// Source: `master_servers`.
    async fn load_master_servers(&self) -> StorageResult<Vec<MasterServerRecord>>;

    /// Source: `switch_user_grants`.
    async fn load_switch_grants(&self) -> StorageResult<Vec<SwitchGrantRecord>>;

    /// Source: `businesses`.
    async fn load_business_tree(&self) -> StorageResult<Vec<BusinessRecord>>;

    /// Source: `business_servers`.
    async fn load_business_servers(&self) -> StorageResult<Vec<BusinessServerRecord>>;

    /// Source: `failover_file_replications`.
    async fn load_failover_parents(&self) -> StorageResult<Vec<FailoverRecord>>;
}
