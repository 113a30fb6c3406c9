//! Authentication and Authorization
//!
//! [`AccessControl`] checks handshake credentials and answers the
//! resource-level questions handlers and the broadcaster ask: is this user a
//! master user, may they see this business, this server, this other user.
//! Everything except the account record itself comes from the process caches.

use meridian_core::{BusinessId, ServerId, StorageError, StorageResult, UserId};
use meridian_storage::UserRecord;
use secrecy::{ExposeSecret, SecretString};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::caches::ProcessCaches;

// ============================================================================
// ERRORS
// ============================================================================

/// Why a handshake was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Username must not be empty")]
    EmptyUsername,

    #[error("Unknown user {0}")]
    UnknownUser(UserId),

    #[error("Account {0} is disabled")]
    AccountDisabled(UserId),

    #[error("Connections for {user} are not allowed from {host}")]
    HostNotAllowed { user: UserId, host: String },

    #[error("Password must not be empty")]
    EmptyPassword,

    #[error("Invalid username or password")]
    BadCredentials,

    #[error("{from} is not allowed to connect as {to}")]
    SwitchNotGranted { from: UserId, to: UserId },

    #[error("Cannot connect as {0}: account missing or disabled")]
    SwitchTargetUnavailable(UserId),

    #[error("Account directory unavailable: {0}")]
    Directory(#[from] StorageError),
}

pub type AuthResult<T> = Result<T, AuthError>;

// ============================================================================
// PASSWORDS
// ============================================================================

/// Compare a password with a bcrypt hash on the blocking pool.
pub async fn verify_password(password: &SecretString, hash: &str) -> AuthResult<bool> {
    let password = password.expose_secret().to_string();
    let hash = hash.to_string();

    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| {
            tracing::error!("Password verification task failed: {}", e);
            AuthError::BadCredentials
        })?
        .map_err(|e| {
            tracing::warn!("Stored credential is not a valid bcrypt hash: {}", e);
            AuthError::BadCredentials
        })
}

/// Hash a password on the blocking pool.
pub async fn hash_password(password: &SecretString, cost: u32) -> AuthResult<String> {
    let password = password.expose_secret().to_string();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| AuthError::Directory(StorageError::Query {
            reason: format!("Task join error: {}", e),
        }))?
        .map_err(|e| AuthError::Directory(StorageError::Query {
            reason: e.to_string(),
        }))
}

// ============================================================================
// PRINCIPAL
// ============================================================================

/// Master-user authority of a principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterScope {
    /// Ordinary account holder.
    None,
    /// Master user without server restrictions.
    Unrestricted,
    /// Master user limited to the listed servers.
    Restricted(BTreeSet<ServerId>),
}

/// A user resolved against the access-control caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: UserId,
    pub business: BusinessId,
    pub master: MasterScope,
}

impl Principal {
    pub fn is_master(&self) -> bool {
        !matches!(self.master, MasterScope::None)
    }

    pub fn is_unrestricted_master(&self) -> bool {
        matches!(self.master, MasterScope::Unrestricted)
    }
}

// ============================================================================
// ACCESS CONTROL
// ============================================================================

/// Upper bound on business-tree depth; guards against parent cycles.
const MAX_BUSINESS_DEPTH: usize = 64;

#[derive(Clone)]
pub struct AccessControl {
    caches: Arc<ProcessCaches>,
}

impl AccessControl {
    pub fn new(caches: Arc<ProcessCaches>) -> Self {
        Self { caches }
    }

    pub fn caches(&self) -> &Arc<ProcessCaches> {
        &self.caches
    }

    async fn find_user(&self, user: &UserId) -> StorageResult<Option<UserRecord>> {
        self.caches.directory().find_user(user).await
    }

    /// Check handshake credentials.
    ///
    /// On success nothing is returned; every later operation re-checks
    /// resource-level authorization.
    pub async fn authenticate(
        &self,
        remote_host: &str,
        connect_as: &UserId,
        authenticate_as: &UserId,
        password: &SecretString,
    ) -> AuthResult<()> {
        if connect_as.is_empty() || authenticate_as.is_empty() {
            return Err(AuthError::EmptyUsername);
        }

        let account = self
            .find_user(authenticate_as)
            .await?
            .ok_or_else(|| AuthError::UnknownUser(authenticate_as.clone()))?;
        if account.disabled {
            return Err(AuthError::AccountDisabled(authenticate_as.clone()));
        }

        let hosts = self.caches.master_hosts().await?;
        if let Some(allowed) = hosts.get(authenticate_as) {
            if !allowed.contains(remote_host) {
                return Err(AuthError::HostNotAllowed {
                    user: authenticate_as.clone(),
                    host: remote_host.to_string(),
                });
            }
        }

        if password.expose_secret().is_empty() {
            return Err(AuthError::EmptyPassword);
        }
        let hash = account
            .password_hash
            .as_deref()
            .ok_or(AuthError::BadCredentials)?;
        if !verify_password(password, hash).await? {
            return Err(AuthError::BadCredentials);
        }

        if connect_as != authenticate_as {
            match self.find_user(connect_as).await? {
                Some(target) if !target.disabled => {}
                _ => return Err(AuthError::SwitchTargetUnavailable(connect_as.clone())),
            }
            let grants = self.caches.switch_grants().await?;
            if !grants.contains(&(authenticate_as.clone(), connect_as.clone())) {
                return Err(AuthError::SwitchNotGranted {
                    from: authenticate_as.clone(),
                    to: connect_as.clone(),
                });
            }
        }

        tracing::debug!(user = %authenticate_as, connect_as = %connect_as, host = remote_host, "Authenticated");
        Ok(())
    }

    /// Resolve `user` against the caches. `None` for unknown accounts.
    pub async fn principal(&self, user: &UserId) -> StorageResult<Option<Principal>> {
        let Some(account) = self.caches.account(user).await? else {
            return Ok(None);
        };
        let master = if self.is_master_user(user).await? {
            match self.caches.master_servers().await?.get(user) {
                Some(servers) if !servers.is_empty() => MasterScope::Restricted(servers.clone()),
                _ => MasterScope::Unrestricted,
            }
        } else {
            MasterScope::None
        };
        Ok(Some(Principal {
            user: account.username,
            business: account.business,
            master,
        }))
    }

    pub async fn is_master_user(&self, user: &UserId) -> StorageResult<bool> {
        Ok(self
            .caches
            .master_users()
            .await?
            .get(user)
            .map(|record| record.active)
            .unwrap_or(false))
    }

    /// Never cached: a disabled account must stop being served immediately.
    /// Unknown accounts count as disabled.
    pub async fn is_account_disabled(&self, user: &UserId) -> StorageResult<bool> {
        Ok(self
            .find_user(user)
            .await?
            .map(|record| record.disabled)
            .unwrap_or(true))
    }

    /// Own business or any descendant of it; unrestricted masters see all.
    pub async fn can_access_business(
        &self,
        principal: &Principal,
        business: &BusinessId,
    ) -> StorageResult<bool> {
        if principal.is_unrestricted_master() {
            return Ok(true);
        }
        let tree = self.caches.business_tree().await?;
        let mut current = Some(business.clone());
        let mut visited = HashSet::new();
        while let Some(candidate) = current {
            if candidate == principal.business {
                return Ok(true);
            }
            if !visited.insert(candidate.clone()) || visited.len() > MAX_BUSINESS_DEPTH {
                tracing::warn!(business = %business, "Business tree cycle or excessive depth");
                return Ok(false);
            }
            current = tree.get(&candidate).cloned().flatten();
        }
        Ok(false)
    }

    /// Restricted masters see listed servers only, unrestricted masters see
    /// all, others see servers granted to any business they can access.
    pub async fn can_access_server(
        &self,
        principal: &Principal,
        server: ServerId,
    ) -> StorageResult<bool> {
        match &principal.master {
            MasterScope::Unrestricted => Ok(true),
            MasterScope::Restricted(servers) => Ok(servers.contains(&server)),
            MasterScope::None => {
                let grants = self.caches.server_grants().await?;
                let Some(businesses) = grants.get(&server) else {
                    return Ok(false);
                };
                for business in businesses {
                    if self.can_access_business(principal, business).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    pub async fn failover_parent(&self, server: ServerId) -> StorageResult<Option<ServerId>> {
        Ok(self.caches.failover_parents().await?.get(&server).copied())
    }

    /// Whether `requester` may see the account `user`.
    pub async fn can_see_user(&self, requester: &Principal, user: &UserId) -> StorageResult<bool> {
        if requester.user == *user || requester.is_unrestricted_master() {
            return Ok(true);
        }
        match self.caches.account(user).await? {
            Some(target) => self.can_access_business(requester, &target.business).await,
            None => Ok(false),
        }
    }
}
