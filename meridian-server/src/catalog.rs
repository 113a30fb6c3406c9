//! Table catalog: stable table ids ↔ per-version client table ids.
//!
//! The client id of a table under protocol version `v` is its index in the
//! canonical list of tables present in `v`. Administrative tables exist in
//! that list for everyone (so indices never depend on who is asking) but
//! resolve to "no such table" for users who are not master users.

use meridian_core::{ProtocolVersion, StorageResult, TableId, Visibility};

use crate::auth::AccessControl;
use crate::session::Session;

/// Version-aware table id translation.
#[derive(Clone)]
pub struct TableCatalog {
    by_version: Vec<(ProtocolVersion, Vec<TableId>)>,
    access: AccessControl,
}

impl TableCatalog {
    pub fn new(access: AccessControl) -> Self {
        let by_version = ProtocolVersion::ALL
            .iter()
            .map(|version| {
                let tables = TableId::ALL
                    .iter()
                    .copied()
                    .filter(|table| table.is_present_in(*version))
                    .collect();
                (*version, tables)
            })
            .collect();
        Self { by_version, access }
    }

    fn tables_for(&self, version: ProtocolVersion) -> &[TableId] {
        self.by_version
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, tables)| tables.as_slice())
            .unwrap_or(&[])
    }

    /// Client id of `table` for a viewer with the given version and authority.
    pub fn client_id_for(&self, table: TableId, version: ProtocolVersion, is_master: bool) -> Option<i32> {
        if table.visibility() == Visibility::Administrative && !is_master {
            return None;
        }
        self.tables_for(version)
            .iter()
            .position(|candidate| *candidate == table)
            .and_then(|index| i32::try_from(index).ok())
    }

    /// Stable id for a client id. Negative and out-of-range ids are absent.
    pub fn table_for(&self, client_id: i32, version: ProtocolVersion, is_master: bool) -> Option<TableId> {
        let index = usize::try_from(client_id).ok()?;
        let table = *self.tables_for(version).get(index)?;
        if table.visibility() == Visibility::Administrative && !is_master {
            return None;
        }
        Some(table)
    }

    async fn session_is_master(&self, session: &Session) -> StorageResult<bool> {
        self.access.is_master_user(&session.effective_user).await
    }

    pub async fn to_client_table_id(&self, table: TableId, session: &Session) -> StorageResult<Option<i32>> {
        let is_master = self.session_is_master(session).await?;
        Ok(self.client_id_for(table, session.version, is_master))
    }

    pub async fn to_stable_table_id(&self, client_id: i32, session: &Session) -> StorageResult<Option<TableId>> {
        let is_master = self.session_is_master(session).await?;
        Ok(self.table_for(client_id, session.version, is_master))
    }

    /// Every table the session can see, by ascending client id.
    pub async fn visible_tables(&self, session: &Session) -> StorageResult<Vec<(i32, TableId)>> {
        let is_master = self.session_is_master(session).await?;
        Ok(self
            .tables_for(session.version)
            .iter()
            .filter_map(|table| {
                self.client_id_for(*table, session.version, is_master)
                    .map(|id| (id, *table))
            })
            .collect())
    }
}
