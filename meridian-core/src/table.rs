//! Stable table identifiers.
//!
//! A [`TableId`] never changes once assigned. The integer a client sees for a
//! table depends on its protocol version and is computed by the server's
//! table catalog from the metadata declared here.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::ProtocolVersion;

/// Who may see a table at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Visibility {
    /// Visible to every authenticated user (rows are still filtered).
    Public,
    /// Visible to master users only.
    Administrative,
}

/// Resource categories managed by the control plane.
///
/// Declaration order is the canonical order used to number tables on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TableId {
    Businesses,
    BusinessAdministrators,
    BusinessServers,
    Usernames,
    MasterUsers,
    MasterHosts,
    MasterServers,
    SwitchUserGrants,
    Servers,
    IpAddresses,
    NetBinds,
    FailoverFileReplications,
    Packages,
    LinuxAccounts,
    LinuxGroups,
    LinuxServerAccounts,
    EmailDomains,
    EmailAddresses,
    EmailForwarding,
    EmailLists,
    SpamRelayRules,
    HttpdServers,
    HttpdSites,
    HttpdSiteUrls,
    MysqlServers,
    MysqlDatabases,
    MysqlUsers,
    PostgresServers,
    PostgresDatabases,
    PostgresUsers,
    DnsZones,
    DnsRecords,
    CvsRepositories,
    PrivateFtpServers,
    BackupPartitions,
    BackupRetentions,
    Tickets,
    TicketActions,
    Transactions,
    MonthlyCharges,
    SchemaTables,
}

impl TableId {
    /// Every table in canonical order.
    pub const ALL: &'static [TableId] = &[
        TableId::Businesses,
        TableId::BusinessAdministrators,
        TableId::BusinessServers,
        TableId::Usernames,
        TableId::MasterUsers,
        TableId::MasterHosts,
        TableId::MasterServers,
        TableId::SwitchUserGrants,
        TableId::Servers,
        TableId::IpAddresses,
        TableId::NetBinds,
        TableId::FailoverFileReplications,
        TableId::Packages,
        TableId::LinuxAccounts,
        TableId::LinuxGroups,
        TableId::LinuxServerAccounts,
        TableId::EmailDomains,
        TableId::EmailAddresses,
        TableId::EmailForwarding,
        TableId::EmailLists,
        TableId::SpamRelayRules,
        TableId::HttpdServers,
        TableId::HttpdSites,
        TableId::HttpdSiteUrls,
        TableId::MysqlServers,
        TableId::MysqlDatabases,
        TableId::MysqlUsers,
        TableId::PostgresServers,
        TableId::PostgresDatabases,
        TableId::PostgresUsers,
        TableId::DnsZones,
        TableId::DnsRecords,
        TableId::CvsRepositories,
        TableId::PrivateFtpServers,
        TableId::BackupPartitions,
        TableId::BackupRetentions,
        TableId::Tickets,
        TableId::TicketActions,
        TableId::Transactions,
        TableId::MonthlyCharges,
        TableId::SchemaTables,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TableId::Businesses => "businesses",
            TableId::BusinessAdministrators => "business_administrators",
            TableId::BusinessServers => "business_servers",
            TableId::Usernames => "usernames",
            TableId::MasterUsers => "master_users",
            TableId::MasterHosts => "master_hosts",
            TableId::MasterServers => "master_servers",
            TableId::SwitchUserGrants => "switch_user_grants",
            TableId::Servers => "servers",
            TableId::IpAddresses => "ip_addresses",
            TableId::NetBinds => "net_binds",
            TableId::FailoverFileReplications => "failover_file_replications",
            TableId::Packages => "packages",
            TableId::LinuxAccounts => "linux_accounts",
            TableId::LinuxGroups => "linux_groups",
            TableId::LinuxServerAccounts => "linux_server_accounts",
            TableId::EmailDomains => "email_domains",
            TableId::EmailAddresses => "email_addresses",
            TableId::EmailForwarding => "email_forwarding",
            TableId::EmailLists => "email_lists",
            TableId::SpamRelayRules => "spam_relay_rules",
            TableId::HttpdServers => "httpd_servers",
            TableId::HttpdSites => "httpd_sites",
            TableId::HttpdSiteUrls => "httpd_site_urls",
            TableId::MysqlServers => "mysql_servers",
            TableId::MysqlDatabases => "mysql_databases",
            TableId::MysqlUsers => "mysql_users",
            TableId::PostgresServers => "postgres_servers",
            TableId::PostgresDatabases => "postgres_databases",
            TableId::PostgresUsers => "postgres_users",
            TableId::DnsZones => "dns_zones",
            TableId::DnsRecords => "dns_records",
            TableId::CvsRepositories => "cvs_repositories",
            TableId::PrivateFtpServers => "private_ftp_servers",
            TableId::BackupPartitions => "backup_partitions",
            TableId::BackupRetentions => "backup_retentions",
            TableId::Tickets => "tickets",
            TableId::TicketActions => "ticket_actions",
            TableId::Transactions => "transactions",
            TableId::MonthlyCharges => "monthly_charges",
            TableId::SchemaTables => "schema_tables",
        }
    }

    pub fn from_name(name: &str) -> Option<TableId> {
        Self::ALL.iter().copied().find(|table| table.name() == name)
    }

    /// First protocol version that knows this table.
    pub fn introduced(&self) -> ProtocolVersion {
        match self {
            TableId::SwitchUserGrants => ProtocolVersion::V1_30,
            TableId::FailoverFileReplications | TableId::BackupRetentions => {
                ProtocolVersion::V1_44
            }
            TableId::SpamRelayRules | TableId::PrivateFtpServers => ProtocolVersion::V1_62,
            TableId::LinuxServerAccounts => ProtocolVersion::V1_80,
            _ => ProtocolVersion::V1_0,
        }
    }

    /// First protocol version that no longer knows this table.
    pub fn retired(&self) -> Option<ProtocolVersion> {
        match self {
            TableId::CvsRepositories => Some(ProtocolVersion::V1_80),
            _ => None,
        }
    }

    pub fn is_present_in(&self, version: ProtocolVersion) -> bool {
        version >= self.introduced() && self.retired().map_or(true, |retired| version < retired)
    }

    pub fn visibility(&self) -> Visibility {
        match self {
            TableId::MasterHosts | TableId::MasterServers | TableId::SwitchUserGrants => {
                Visibility::Administrative
            }
            _ => Visibility::Public,
        }
    }

    /// Server-identity tables whose changes must also reach listeners that
    /// can only see the failover parent of an affected server.
    pub fn propagates_to_failover_parent(&self) -> bool {
        matches!(
            self,
            TableId::Servers
                | TableId::IpAddresses
                | TableId::NetBinds
                | TableId::LinuxServerAccounts
                | TableId::FailoverFileReplications
        )
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_is_in_declaration_order() {
        let mut sorted = TableId::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, TableId::ALL);
    }

    #[test]
    fn test_names_round_trip() {
        for table in TableId::ALL {
            assert_eq!(TableId::from_name(table.name()), Some(*table));
        }
        assert_eq!(TableId::from_name("nope"), None);
    }

    #[test]
    fn test_presence_by_version() {
        assert!(!TableId::SwitchUserGrants.is_present_in(ProtocolVersion::V1_0));
        assert!(TableId::SwitchUserGrants.is_present_in(ProtocolVersion::V1_30));
        assert!(TableId::CvsRepositories.is_present_in(ProtocolVersion::V1_62));
        assert!(!TableId::CvsRepositories.is_present_in(ProtocolVersion::V1_80));
        assert!(TableId::MysqlDatabases.is_present_in(ProtocolVersion::V1_0));
    }
}
