//! Per-request invalidation ledger.

use meridian_core::{BusinessId, ScopeSet, ServerId, TableId};
use std::collections::BTreeMap;

/// Businesses and servers touched in one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableScope {
    pub businesses: ScopeSet<BusinessId>,
    pub servers: ScopeSet<ServerId>,
}

impl TableScope {
    fn union(&mut self, other: TableScope) {
        self.businesses.union(other.businesses);
        self.servers.union(other.servers);
    }
}

/// Tables changed by one request, with the scope of each change.
///
/// Owned by the in-flight request and handed to the broadcaster only after
/// both datastores committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationLedger {
    entries: BTreeMap<TableId, TableScope>,
}

impl InvalidationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `table` changed for the given scopes.
    ///
    /// Repeated calls for the same table union their scopes.
    pub fn invalidate(
        &mut self,
        table: TableId,
        businesses: ScopeSet<BusinessId>,
        servers: ScopeSet<ServerId>,
    ) {
        let scope = TableScope {
            businesses,
            servers,
        };
        match self.entries.get_mut(&table) {
            Some(existing) => existing.union(scope),
            None => {
                self.entries.insert(table, scope);
            }
        }
    }

    /// Record a change to `table` that affects everyone.
    pub fn invalidate_all(&mut self, table: TableId) {
        self.invalidate(table, ScopeSet::Everyone, ScopeSet::Everyone);
    }

    pub fn merge(&mut self, other: InvalidationLedger) {
        for (table, scope) in other.entries {
            self.invalidate(table, scope.businesses, scope.servers);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, table: TableId) -> bool {
        self.entries.contains_key(&table)
    }

    pub fn get(&self, table: TableId) -> Option<&TableScope> {
        self.entries.get(&table)
    }

    /// Invalidated tables in canonical order.
    pub fn tables(&self) -> impl Iterator<Item = TableId> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TableId, &TableScope)> {
        self.entries.iter().map(|(table, scope)| (*table, scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme() -> BusinessId {
        BusinessId::from("acme")
    }

    #[test]
    fn test_repeated_invalidation_unions_scopes() {
        let mut ledger = InvalidationLedger::new();
        ledger.invalidate(
            TableId::MysqlDatabases,
            ScopeSet::single(acme()),
            ScopeSet::single(ServerId(1)),
        );
        ledger.invalidate(
            TableId::MysqlDatabases,
            ScopeSet::single(BusinessId::from("other")),
            ScopeSet::single(ServerId(2)),
        );
        assert_eq!(ledger.len(), 1);
        let scope = ledger.get(TableId::MysqlDatabases).cloned().unwrap_or_default();
        assert_eq!(
            scope.businesses,
            ScopeSet::only([acme(), BusinessId::from("other")])
        );
        assert_eq!(scope.servers, ScopeSet::only([ServerId(1), ServerId(2)]));
    }

    #[test]
    fn test_global_scope_absorbs_limited() {
        let mut ledger = InvalidationLedger::new();
        ledger.invalidate(TableId::DnsZones, ScopeSet::single(acme()), ScopeSet::Everyone);
        ledger.invalidate_all(TableId::DnsZones);
        ledger.invalidate(TableId::DnsZones, ScopeSet::single(acme()), ScopeSet::single(ServerId(3)));
        let scope = ledger.get(TableId::DnsZones);
        assert!(scope.map_or(false, |s| s.businesses.is_everyone() && s.servers.is_everyone()));
    }

    #[test]
    fn test_tables_in_canonical_order() {
        let mut ledger = InvalidationLedger::new();
        ledger.invalidate_all(TableId::Tickets);
        ledger.invalidate_all(TableId::Businesses);
        let mut other = InvalidationLedger::new();
        other.invalidate_all(TableId::MysqlDatabases);
        ledger.merge(other);
        let tables: Vec<_> = ledger.tables().collect();
        assert_eq!(
            tables,
            vec![TableId::Businesses, TableId::MysqlDatabases, TableId::Tickets]
        );
    }
}
