//! Cache Broadcast Registry
//!
//! Sessions blocked in the invalidation long-poll register here. When a
//! request commits, [`ListenerRegistry::broadcast`] first runs every
//! [`InvalidationHook`] so process caches are fresh, then snapshots the
//! listener set and delivers to each listener only the tables it can see
//! for the businesses and servers it can access.
//!
//! The registry lock is never held while authorization checks run: the
//! snapshot is copied out of the map first.

use dashmap::DashMap;
use meridian_core::{ConnectorId, ScopeSet, ServerId, StorageResult, TableId};
use std::sync::Arc;

use crate::auth::{AccessControl, Principal};
use crate::caches::InvalidationHook;
use crate::catalog::TableCatalog;
use crate::ledger::{InvalidationLedger, TableScope};
use crate::session::Session;
use crate::telemetry::metrics::with_metrics;

/// Tables whose changes can disable an account or move it between businesses.
const ACCOUNT_TABLES: &[TableId] = &[TableId::Usernames, TableId::Businesses];

/// Summary of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Caches cleared by hooks.
    pub caches_cleared: usize,
    /// Listeners that received a non-empty batch.
    pub woken: usize,
    /// Listeners skipped because their access checks failed.
    pub skipped: usize,
    /// Listeners asked to recheck their account.
    pub rechecked: usize,
}

/// Process-wide set of long-polling sessions.
pub struct ListenerRegistry {
    listeners: DashMap<ConnectorId, Arc<Session>>,
    hooks: Vec<Arc<dyn InvalidationHook>>,
    access: AccessControl,
    catalog: TableCatalog,
}

impl ListenerRegistry {
    pub fn new(access: AccessControl, catalog: TableCatalog) -> Self {
        Self {
            listeners: DashMap::new(),
            hooks: Vec::new(),
            access,
            catalog,
        }
    }

    /// Add a hook run synchronously before any listener is notified.
    pub fn with_hook(mut self, hook: Arc<dyn InvalidationHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Register a listening session until the returned guard drops.
    pub fn register(self: &Arc<Self>, session: Arc<Session>) -> ListenerGuard {
        let connector_id = session.connector_id;
        if self.listeners.insert(connector_id, session).is_none() {
            with_metrics(|m| m.listeners.inc());
        }
        tracing::debug!(connector_id = %connector_id, "Listener registered");
        ListenerGuard {
            registry: Arc::clone(self),
            connector_id,
        }
    }

    pub fn unregister(&self, connector_id: ConnectorId) -> bool {
        let removed = self.listeners.remove(&connector_id).is_some();
        if removed {
            with_metrics(|m| m.listeners.dec());
            tracing::debug!(connector_id = %connector_id, "Listener unregistered");
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_listening(&self, connector_id: ConnectorId) -> bool {
        self.listeners.contains_key(&connector_id)
    }

    fn snapshot(&self, exclude: Option<ConnectorId>) -> Vec<Arc<Session>> {
        self.listeners
            .iter()
            .filter(|entry| Some(*entry.key()) != exclude)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Publish a committed ledger to every listener except `exclude`.
    pub async fn broadcast(
        &self,
        ledger: &InvalidationLedger,
        exclude: Option<ConnectorId>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        if ledger.is_empty() {
            return report;
        }

        for table in ledger.tables() {
            for hook in &self.hooks {
                report.caches_cleared += hook.invalidate_table(table);
            }
        }

        let recheck = ACCOUNT_TABLES.iter().any(|table| ledger.contains(*table));

        for listener in self.snapshot(exclude) {
            match self.filter_for(&listener, ledger).await {
                Ok(batch) => {
                    for (_, table) in &batch {
                        with_metrics(|m| m.record_delivery(table.name()));
                    }
                    if listener.mailbox().deliver(batch.iter().map(|(id, _)| *id)) {
                        report.woken += 1;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        connector_id = %listener.connector_id,
                        user = %listener.effective_user,
                        error = %err,
                        "Skipping listener after failed access check"
                    );
                    report.skipped += 1;
                }
            }
            if recheck {
                listener.mailbox().interrupt();
                report.rechecked += 1;
            }
        }

        tracing::debug!(
            tables = ledger.len(),
            woken = report.woken,
            skipped = report.skipped,
            "Broadcast invalidations"
        );
        report
    }

    /// Client table ids of `ledger` this listener should receive.
    async fn filter_for(
        &self,
        listener: &Session,
        ledger: &InvalidationLedger,
    ) -> StorageResult<Vec<(i32, TableId)>> {
        let Some(principal) = self.access.principal(&listener.effective_user).await? else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        for (table, scope) in ledger.iter() {
            let Some(client_id) =
                self.catalog
                    .client_id_for(table, listener.version, principal.is_master())
            else {
                continue;
            };
            if self.matches_scope(&principal, table, scope).await? {
                batch.push((client_id, table));
            }
        }
        Ok(batch)
    }

    async fn matches_scope(
        &self,
        principal: &Principal,
        table: TableId,
        scope: &TableScope,
    ) -> StorageResult<bool> {
        if let Some(businesses) = scope.businesses.keys() {
            let mut any = false;
            for business in businesses {
                if self.access.can_access_business(principal, business).await? {
                    any = true;
                    break;
                }
            }
            if !any {
                return Ok(false);
            }
        }
        self.matches_servers(principal, table, &scope.servers).await
    }

    async fn matches_servers(
        &self,
        principal: &Principal,
        table: TableId,
        servers: &ScopeSet<ServerId>,
    ) -> StorageResult<bool> {
        let Some(servers) = servers.keys() else {
            return Ok(true);
        };
        for server in servers {
            if self.access.can_access_server(principal, *server).await? {
                return Ok(true);
            }
            if table.propagates_to_failover_parent() {
                if let Some(parent) = self.access.failover_parent(*server).await? {
                    if self.access.can_access_server(principal, parent).await? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }
}

/// Keeps a session registered as a listener.
pub struct ListenerGuard {
    registry: Arc<ListenerRegistry>,
    connector_id: ConnectorId,
}

impl ListenerGuard {
    pub fn connector_id(&self) -> ConnectorId {
        self.connector_id
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.connector_id);
    }
}
