//! Account directory read from the primary PostgreSQL store.

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use meridian_core::{BusinessId, ServerId, StorageResult, UserId};
use tokio_postgres::Row;

use super::{
    AccountDirectory, BusinessRecord, BusinessServerRecord, FailoverRecord, MasterHostRecord,
    MasterServerRecord, MasterUserRecord, SwitchGrantRecord, UserRecord,
};
use crate::datastore::{map_pg_error, map_pool_error, StoreRole};

const FIND_USER: &str =
    "SELECT username, business, disabled, password_hash FROM usernames WHERE username = $1";
const MASTER_USERS: &str = "SELECT username, active FROM master_users";
const MASTER_HOSTS: &str = "SELECT username, host FROM master_hosts";
const MASTER_SERVERS: &str = "SELECT username, server FROM master_servers";
const SWITCH_GRANTS: &str = "SELECT from_user, to_user FROM switch_user_grants";
const BUSINESSES: &str = "SELECT accounting, parent FROM businesses";
const BUSINESS_SERVERS: &str = "SELECT business, server FROM business_servers";
const FAILOVER: &str = "SELECT from_server, to_server FROM failover_file_replications";

/// Directory backed by the primary store's pool.
///
/// Reads run outside any request transaction.
#[derive(Clone)]
pub struct PgDirectory {
    pool: Pool,
}

impl PgDirectory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> StorageResult<Object> {
        self.pool.get().await.map_err(map_pool_error)
    }

    async fn load<T: Send>(
        &self,
        statement: &str,
        map: fn(&Row) -> Result<T, tokio_postgres::Error>,
    ) -> StorageResult<Vec<T>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(statement, &[])
            .await
            .map_err(|err| map_pg_error(StoreRole::Primary, err))?;
        rows.iter()
            .map(|row| map(row).map_err(|err| map_pg_error(StoreRole::Primary, err)))
            .collect()
    }
}

#[async_trait]
impl AccountDirectory for PgDirectory {
    async fn find_user(&self, username: &UserId) -> StorageResult<Option<UserRecord>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(FIND_USER, &[&username.as_str()])
            .await
            .map_err(|err| map_pg_error(StoreRole::Primary, err))?;
        row.map(|row| -> Result<UserRecord, tokio_postgres::Error> {
            Ok(UserRecord {
                username: UserId::new(row.try_get::<_, String>(0)?),
                business: BusinessId::new(row.try_get::<_, String>(1)?),
                disabled: row.try_get(2)?,
                password_hash: row.try_get(3)?,
            })
        })
        .transpose()
        .map_err(|err| map_pg_error(StoreRole::Primary, err))
    }

    async fn load_master_users(&self) -> StorageResult<Vec<MasterUserRecord>> {
        self.load(MASTER_USERS, |row| {
            Ok(MasterUserRecord {
                username: UserId::new(row.try_get::<_, String>(0)?),
                active: row.try_get(1)?,
            })
        })
        .await
    }

    async fn load_master_hosts(&self) -> StorageResult<Vec<MasterHostRecord>> {
        self.load(MASTER_HOSTS, |row| {
            Ok(MasterHostRecord {
                username: UserId::new(row.try_get::<_, String>(0)?),
                host: row.try_get(1)?,
            })
        })
        .await
    }

    async fn load_master_servers(&self) -> StorageResult<Vec<MasterServerRecord>> {
        self.load(MASTER_SERVERS, |row| {
            Ok(MasterServerRecord {
                username: UserId::new(row.try_get::<_, String>(0)?),
                server: ServerId(row.try_get(1)?),
            })
        })
        .await
    }

    async fn load_switch_grants(&self) -> StorageResult<Vec<SwitchGrantRecord>> {
        self.load(SWITCH_GRANTS, |row| {
            Ok(SwitchGrantRecord {
                from: UserId::new(row.try_get::<_, String>(0)?),
                to: UserId::new(row.try_get::<_, String>(1)?),
            })
        })
        .await
    }

    async fn load_business_tree(&self) -> StorageResult<Vec<BusinessRecord>> {
        self.load(BUSINESSES, |row| {
            Ok(BusinessRecord {
                business: BusinessId::new(row.try_get::<_, String>(0)?),
                parent: row.try_get::<_, Option<String>>(1)?.map(BusinessId::new),
            })
        })
        .await
    }

    async fn load_business_servers(&self) -> StorageResult<Vec<BusinessServerRecord>> {
        self.load(BUSINESS_SERVERS, |row| {
            Ok(BusinessServerRecord {
                business: BusinessId::new(row.try_get::<_, String>(0)?),
                server: ServerId(row.try_get(1)?),
            })
        })
        .await
    }

    async fn load_failover_parents(&self) -> StorageResult<Vec<FailoverRecord>> {
        self.load(FAILOVER, |row| {
            Ok(FailoverRecord {
                server: ServerId(row.try_get(0)?),
                parent: ServerId(row.try_get(1)?),
            })
        })
        .await
    }
}
