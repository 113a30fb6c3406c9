//! In-memory account directory for tests.

use async_trait::async_trait;
use meridian_core::{BusinessId, ServerId, StorageResult, TableId, UserId};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use tokio::sync::RwLock;

use super::{
    AccountDirectory, BusinessRecord, BusinessServerRecord, FailoverRecord, MasterHostRecord,
    MasterServerRecord, MasterUserRecord, SwitchGrantRecord, UserRecord,
};

#[derive(Debug, Default)]
struct DirectoryData {
    users: HashMap<UserId, UserRecord>,
    master_users: Vec<MasterUserRecord>,
    master_hosts: Vec<MasterHostRecord>,
    master_servers: Vec<MasterServerRecord>,
    switch_grants: Vec<SwitchGrantRecord>,
    businesses: Vec<BusinessRecord>,
    business_servers: Vec<BusinessServerRecord>,
    failover: Vec<FailoverRecord>,
}

/// Directory held in memory. Counts table loads so cache behavior can be
/// asserted.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    data: RwLock<DirectoryData>,
    loads: StdMutex<HashMap<TableId, usize>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(
        mut self,
        username: impl Into<UserId>,
        business: impl Into<BusinessId>,
        password_hash: Option<String>,
    ) -> Self {
        let username = username.into();
        self.data.get_mut().users.insert(
            username.clone(),
            UserRecord {
                username,
                business: business.into(),
                disabled: false,
                password_hash,
            },
        );
        self
    }

    pub fn with_master_user(mut self, username: impl Into<UserId>) -> Self {
        self.data.get_mut().master_users.push(MasterUserRecord {
            username: username.into(),
            active: true,
        });
        self
    }

    pub fn with_master_host(mut self, username: impl Into<UserId>, host: &str) -> Self {
        self.data.get_mut().master_hosts.push(MasterHostRecord {
            username: username.into(),
            host: host.to_string(),
        });
        self
    }

    pub fn with_master_server(mut self, username: impl Into<UserId>, server: ServerId) -> Self {
        self.data.get_mut().master_servers.push(MasterServerRecord {
            username: username.into(),
            server,
        });
        self
    }

    pub fn with_switch_grant(mut self, from: impl Into<UserId>, to: impl Into<UserId>) -> Self {
        self.data.get_mut().switch_grants.push(SwitchGrantRecord {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    pub fn with_business(
        mut self,
        business: impl Into<BusinessId>,
        parent: Option<BusinessId>,
    ) -> Self {
        self.data.get_mut().businesses.push(BusinessRecord {
            business: business.into(),
            parent,
        });
        self
    }

    pub fn with_business_server(mut self, business: impl Into<BusinessId>, server: ServerId) -> Self {
        self.data.get_mut().business_servers.push(BusinessServerRecord {
            business: business.into(),
            server,
        });
        self
    }

    pub fn with_failover_parent(mut self, server: ServerId, parent: ServerId) -> Self {
        self.data
            .get_mut()
            .failover
            .push(FailoverRecord { server, parent });
        self
    }

    /// Enable or disable an account in place.
    pub async fn set_disabled(&self, username: &UserId, disabled: bool) {
        if let Some(user) = self.data.write().await.users.get_mut(username) {
            user.disabled = disabled;
        }
    }

    pub async fn add_master_host(&self, username: impl Into<UserId>, host: &str) {
        self.data.write().await.master_hosts.push(MasterHostRecord {
            username: username.into(),
            host: host.to_string(),
        });
    }

    pub async fn add_business_server(&self, business: impl Into<BusinessId>, server: ServerId) {
        self.data
            .write()
            .await
            .business_servers
            .push(BusinessServerRecord {
                business: business.into(),
                server,
            });
    }

    /// How many times the given source table has been loaded.
    pub fn load_count(&self, table: TableId) -> usize {
        self.loads
            .lock()
            .map(|loads| loads.get(&table).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn record_load(&self, table: TableId) {
        if let Ok(mut loads) = self.loads.lock() {
            *loads.entry(table).or_insert(0) += 1;
        }
    }
}

#[async_trait]
impl AccountDirectory for InMemoryDirectory {
    async fn find_user(&self, username: &UserId) -> StorageResult<Option<UserRecord>> {
        self.record_load(TableId::Usernames);
        Ok(self.data.read().await.users.get(username).cloned())
    }

    async fn load_master_users(&self) -> StorageResult<Vec<MasterUserRecord>> {
        self.record_load(TableId::MasterUsers);
        Ok(self.data.read().await.master_users.clone())
    }

    async fn load_master_hosts(&self) -> StorageResult<Vec<MasterHostRecord>> {
        self.record_load(TableId::MasterHosts);
        Ok(self.data.read().await.master_hosts.clone())
    }

    async fn load_master_servers(&self) -> StorageResult<Vec<MasterServerRecord>> {
        self.record_load(TableId::MasterServers);
        Ok(self.data.read().await.master_servers.clone())
    }

    async fn load_switch_grants(&self) -> StorageResult<Vec<SwitchGrantRecord>> {
        self.record_load(TableId::SwitchUserGrants);
        Ok(self.data.read().await.switch_grants.clone())
    }

    async fn load_business_tree(&self) -> StorageResult<Vec<BusinessRecord>> {
        self.record_load(TableId::Businesses);
        Ok(self.data.read().await.businesses.clone())
    }

    async fn load_business_servers(&self) -> StorageResult<Vec<BusinessServerRecord>> {
        self.record_load(TableId::BusinessServers);
        Ok(self.data.read().await.business_servers.clone())
    }

    async fn load_failover_parents(&self) -> StorageResult<Vec<FailoverRecord>> {
        self.record_load(TableId::FailoverFileReplications);
        Ok(self.data.read().await.failover.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_and_loads() -> StorageResult<()> {
        let directory = InMemoryDirectory::new()
            .with_user("alice", "acme", None)
            .with_master_user("root")
            .with_master_host("root", "10.0.0.1");

        assert!(directory.find_user(&UserId::from("alice")).await?.is_some());
        assert!(directory.find_user(&UserId::from("bob")).await?.is_none());
        assert_eq!(directory.load_master_hosts().await?.len(), 1);
        assert_eq!(directory.load_count(TableId::MasterHosts), 1);
        assert_eq!(directory.load_count(TableId::MasterUsers), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_set_disabled() -> StorageResult<()> {
        let directory = InMemoryDirectory::new().with_user("alice", "acme", None);
        let alice = UserId::from("alice");
        directory.set_disabled(&alice, true).await;
        let record = directory.find_user(&alice).await?;
        assert!(record.map(|r| r.disabled).unwrap_or(false));
        Ok(())
    }
}
