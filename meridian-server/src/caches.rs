//! Process-scoped access-control cache service.
//!
//! Each [`CachedView`] is loaded from the account directory on first use and
//! dropped when its source table is invalidated. Every view carries a
//! generation number bumped by invalidation; a load that started before an
//! invalidation finishes without installing its result, so a racing load can
//! never resurrect stale data.

use meridian_core::{BusinessId, ServerId, StorageResult, TableId, UserId};
use meridian_storage::{AccountDirectory, MasterUserRecord, UserRecord};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Receives table invalidations before any client is notified.
pub trait InvalidationHook: Send + Sync {
    /// Drop whatever was derived from `table`. Returns how many caches were cleared.
    fn invalidate_table(&self, table: TableId) -> usize;
}

// ============================================================================
// CACHED VIEW
// ============================================================================

#[derive(Debug)]
struct ViewState<T> {
    value: Option<Arc<T>>,
    generation: u64,
}

/// Lazily loaded value derived from one source table.
#[derive(Debug)]
pub struct CachedView<T> {
    source: TableId,
    state: RwLock<ViewState<T>>,
}

impl<T> CachedView<T> {
    pub fn new(source: TableId) -> Self {
        Self {
            source,
            state: RwLock::new(ViewState {
                value: None,
                generation: 0,
            }),
        }
    }

    pub fn source(&self) -> TableId {
        self.source
    }

    fn read(&self) -> RwLockReadGuard<'_, ViewState<T>> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(table = %self.source, "Cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, ViewState<T>> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(table = %self.source, "Cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.read().value.is_some()
    }

    /// Return the cached value, loading it with `load` if absent.
    pub async fn get_or_load<F, Fut>(&self, load: F) -> StorageResult<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let generation = {
            let state = self.read();
            if let Some(value) = &state.value {
                return Ok(Arc::clone(value));
            }
            state.generation
        };

        let loaded = Arc::new(load().await?);

        let mut state = self.write();
        if state.generation == generation {
            state.value = Some(Arc::clone(&loaded));
        } else {
            tracing::debug!(table = %self.source, "Discarding cache load that raced an invalidation");
        }
        Ok(loaded)
    }

    /// Drop the cached value. Returns whether anything was cached.
    pub fn invalidate(&self) -> bool {
        let mut state = self.write();
        state.generation += 1;
        state.value.take().is_some()
    }
}

// ============================================================================
// ACCOUNT MEMO
// ============================================================================

#[derive(Debug, Default)]
struct MemoState {
    entries: HashMap<UserId, Option<UserRecord>>,
    generation: u64,
}

/// Account records looked up one user at a time and kept until the
/// `usernames` table is invalidated. Unknown users are remembered too.
#[derive(Debug, Default)]
pub struct AccountMemo {
    state: RwLock<MemoState>,
}

impl AccountMemo {
    fn read(&self) -> RwLockReadGuard<'_, MemoState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn get_or_load<F, Fut>(
        &self,
        user: &UserId,
        load: F,
    ) -> StorageResult<Option<UserRecord>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageResult<Option<UserRecord>>>,
    {
        let generation = {
            let state = self.read();
            if let Some(entry) = state.entries.get(user) {
                return Ok(entry.clone());
            }
            state.generation
        };

        let loaded = load().await?;

        let mut state = self.write();
        if state.generation == generation {
            state.entries.insert(user.clone(), loaded.clone());
        }
        Ok(loaded)
    }

    pub fn invalidate(&self) -> bool {
        let mut state = self.write();
        state.generation += 1;
        let had_entries = !state.entries.is_empty();
        state.entries.clear();
        had_entries
    }
}

trait Invalidate: Send + Sync {
    fn source_table(&self) -> TableId;
    fn clear(&self) -> bool;
}

impl<T: Send + Sync> Invalidate for CachedView<T> {
    fn source_table(&self) -> TableId {
        self.source
    }

    fn clear(&self) -> bool {
        self.invalidate()
    }
}

// ============================================================================
// PROCESS CACHES
// ============================================================================

pub type MasterUsers = HashMap<UserId, MasterUserRecord>;
pub type MasterHosts = HashMap<UserId, HashSet<String>>;
pub type MasterServers = HashMap<UserId, BTreeSet<ServerId>>;
pub type SwitchGrants = HashSet<(UserId, UserId)>;
pub type BusinessTree = HashMap<BusinessId, Option<BusinessId>>;
/// Server → businesses granted access to it.
pub type ServerGrants = HashMap<ServerId, BTreeSet<BusinessId>>;
pub type FailoverParents = HashMap<ServerId, ServerId>;

/// All access-control caches of one server process.
pub struct ProcessCaches {
    directory: Arc<dyn AccountDirectory>,
    accounts: AccountMemo,
    master_users: CachedView<MasterUsers>,
    master_hosts: CachedView<MasterHosts>,
    master_servers: CachedView<MasterServers>,
    switch_grants: CachedView<SwitchGrants>,
    business_tree: CachedView<BusinessTree>,
    server_grants: CachedView<ServerGrants>,
    failover_parents: CachedView<FailoverParents>,
}

impl Invalidate for AccountMemo {
    fn source_table(&self) -> TableId {
        TableId::Usernames
    }

    fn clear(&self) -> bool {
        self.invalidate()
    }
}

impl ProcessCaches {
    pub fn new(directory: Arc<dyn AccountDirectory>) -> Self {
        Self {
            directory,
            accounts: AccountMemo::default(),
            master_users: CachedView::new(TableId::MasterUsers),
            master_hosts: CachedView::new(TableId::MasterHosts),
            master_servers: CachedView::new(TableId::MasterServers),
            switch_grants: CachedView::new(TableId::SwitchUserGrants),
            business_tree: CachedView::new(TableId::Businesses),
            server_grants: CachedView::new(TableId::BusinessServers),
            failover_parents: CachedView::new(TableId::FailoverFileReplications),
        }
    }

    pub fn directory(&self) -> &Arc<dyn AccountDirectory> {
        &self.directory
    }

    /// Account of `user` as last seen; not for login or disabled checks.
    pub async fn account(&self, user: &UserId) -> StorageResult<Option<UserRecord>> {
        self.accounts
            .get_or_load(user, || self.directory.find_user(user))
            .await
    }

    pub async fn master_users(&self) -> StorageResult<Arc<MasterUsers>> {
        self.master_users
            .get_or_load(|| async {
                let rows = self.directory.load_master_users().await?;
                Ok(rows
                    .into_iter()
                    .map(|row| (row.username.clone(), row))
                    .collect())
            })
            .await
    }

    pub async fn master_hosts(&self) -> StorageResult<Arc<MasterHosts>> {
        self.master_hosts
            .get_or_load(|| async {
                let mut hosts = MasterHosts::new();
                for row in self.directory.load_master_hosts().await? {
                    hosts.entry(row.username).or_default().insert(row.host);
                }
                Ok(hosts)
            })
            .await
    }

    pub async fn master_servers(&self) -> StorageResult<Arc<MasterServers>> {
        self.master_servers
            .get_or_load(|| async {
                let mut servers = MasterServers::new();
                for row in self.directory.load_master_servers().await? {
                    servers.entry(row.username).or_default().insert(row.server);
                }
                Ok(servers)
            })
            .await
    }

    pub async fn switch_grants(&self) -> StorageResult<Arc<SwitchGrants>> {
        self.switch_grants
            .get_or_load(|| async {
                Ok(self
                    .directory
                    .load_switch_grants()
                    .await?
                    .into_iter()
                    .map(|row| (row.from, row.to))
                    .collect())
            })
            .await
    }

    pub async fn business_tree(&self) -> StorageResult<Arc<BusinessTree>> {
        self.business_tree
            .get_or_load(|| async {
                Ok(self
                    .directory
                    .load_business_tree()
                    .await?
                    .into_iter()
                    .map(|row| (row.business, row.parent))
                    .collect())
            })
            .await
    }

    pub async fn server_grants(&self) -> StorageResult<Arc<ServerGrants>> {
        self.server_grants
            .get_or_load(|| async {
                let mut grants = ServerGrants::new();
                for row in self.directory.load_business_servers().await? {
                    grants.entry(row.server).or_default().insert(row.business);
                }
                Ok(grants)
            })
            .await
    }

    pub async fn failover_parents(&self) -> StorageResult<Arc<FailoverParents>> {
        self.failover_parents
            .get_or_load(|| async {
                Ok(self
                    .directory
                    .load_failover_parents()
                    .await?
                    .into_iter()
                    .map(|row| (row.server, row.parent))
                    .collect())
            })
            .await
    }

    fn views(&self) -> [&dyn Invalidate; 8] {
        [
            &self.accounts,
            &self.master_users,
            &self.master_hosts,
            &self.master_servers,
            &self.switch_grants,
            &self.business_tree,
            &self.server_grants,
            &self.failover_parents,
        ]
    }

    /// Tables that feed at least one cache.
    pub fn source_tables(&self) -> Vec<TableId> {
        self.views().iter().map(|view| view.source_table()).collect()
    }
}

impl InvalidationHook for ProcessCaches {
    fn invalidate_table(&self, table: TableId) -> usize {
        let cleared = self
            .views()
            .iter()
            .filter(|view| view.source_table() == table)
            .filter(|view| view.clear())
            .count();
        if cleared > 0 {
            tracing::debug!(table = %table, cleared, "Invalidated process caches");
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_storage::InMemoryDirectory;

    fn caches() -> (Arc<InMemoryDirectory>, ProcessCaches) {
        let directory = Arc::new(
            InMemoryDirectory::new()
                .with_master_user("root")
                .with_master_host("root", "10.0.0.1"),
        );
        let caches = ProcessCaches::new(directory.clone());
        (directory, caches)
    }

    #[tokio::test]
    async fn test_loads_once() -> StorageResult<()> {
        let (directory, caches) = caches();
        caches.master_hosts().await?;
        caches.master_hosts().await?;
        assert_eq!(directory.load_count(TableId::MasterHosts), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalidate_clears_only_matching_source() -> StorageResult<()> {
        let (directory, caches) = caches();
        caches.master_hosts().await?;
        caches.master_users().await?;

        assert_eq!(caches.invalidate_table(TableId::MasterHosts), 1);
        assert_eq!(caches.invalidate_table(TableId::MysqlDatabases), 0);

        caches.master_users().await?;
        assert_eq!(directory.load_count(TableId::MasterUsers), 1);

        directory.add_master_host("root", "10.0.0.2").await;
        let hosts = caches.master_hosts().await?;
        assert_eq!(directory.load_count(TableId::MasterHosts), 2);
        assert_eq!(hosts.get(&UserId::from("root")).map(|h| h.len()), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_racing_load_is_not_installed() -> StorageResult<()> {
        let view: CachedView<u32> = CachedView::new(TableId::MasterUsers);
        let value = view
            .get_or_load(|| async {
                // Invalidation lands while this load is in flight.
                view.invalidate();
                Ok(1)
            })
            .await?;
        assert_eq!(*value, 1);
        assert!(!view.is_loaded());

        let value = view.get_or_load(|| async { Ok(2) }).await?;
        assert_eq!(*value, 2);
        assert!(view.is_loaded());
        Ok(())
    }

    #[tokio::test]
    async fn test_accounts_are_memoized_until_usernames_change() -> StorageResult<()> {
        let directory = Arc::new(InMemoryDirectory::new().with_user("alice", "acme", None));
        let caches = ProcessCaches::new(directory.clone());
        let alice = UserId::from("alice");

        for _ in 0..3 {
            let account = caches.account(&alice).await?;
            assert_eq!(account.map(|a| a.business), Some(BusinessId::from("acme")));
        }
        assert_eq!(caches.account(&UserId::from("ghost")).await?, None);
        assert_eq!(directory.load_count(TableId::Usernames), 2);

        directory.set_disabled(&alice, true).await;
        assert_eq!(caches.invalidate_table(TableId::Usernames), 1);
        assert!(caches.accounts.is_empty());
        let account = caches.account(&alice).await?;
        assert_eq!(account.map(|a| a.disabled), Some(true));
        assert_eq!(directory.load_count(TableId::Usernames), 3);
        Ok(())
    }

    #[test]
    fn test_source_tables() {
        let (_, caches) = caches();
        let sources = caches.source_tables();
        assert!(sources.contains(&TableId::MasterHosts));
        assert!(sources.contains(&TableId::FailoverFileReplications));
        assert!(sources.contains(&TableId::Usernames));
        assert!(!sources.contains(&TableId::MysqlDatabases));
    }
}
