//! Contracts for the pluggable parts of the registry.
//!
//! The registry grew these as load-time plugin registries; here they are
//! plain trait objects handed to [crate::Janitor] by the embedding
//! process. The implementations in this module are the trivial ones:
//! no-op federation, a static account list, an in-process inbound cache.
//! Production deployments substitute their own.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stevedore_api_types::{GcPolicy, Identity, RbacPolicy, SecurityScanPolicy};
use stevedore_db::AccountRow;

/// Desired state of one managed account, as reported by the account
/// management driver.
#[derive(Clone, Debug)]
pub struct AccountConfig {
    pub auth_tenant_id: String,
    pub upstream_peer_hostname: Option<String>,
    pub external_peer_url: Option<String>,
    pub gc_policies: Vec<GcPolicy>,
    pub security_scan_policies: Vec<SecurityScanPolicy>,
    pub rbac_policies: Vec<RbacPolicy>,
}

/// Source of desired state for managed accounts.
#[async_trait]
pub trait AccountManagementDriver: Send + Sync {
    /// All account names this driver claims responsibility for.
    async fn managed_account_names(&self) -> Result<Vec<String>, Error>;

    /// The desired configuration for one name. `None` means the account
    /// should not exist (anymore) and will be driven into deletion.
    async fn configure_account(&self, name: &str) -> Result<Option<AccountConfig>, Error>;
}

/// Announces account ownership across the federation of registries.
#[async_trait]
pub trait FederationDriver: Send + Sync {
    /// Periodic liveness announcement for an account we hold. Failures
    /// are logged by the caller but never block the janitor.
    async fn record_existing_account(
        &self,
        account: &AccountRow,
        now: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Releases the account name after deletion so other registries may
    /// claim it.
    async fn forfeit_account_name(&self, account: &AccountRow) -> Result<(), Error>;
}

/// Short-TTL cache that suppresses repeated upstream checks when the
/// primary is an external registry.
#[async_trait]
pub trait InboundCacheDriver: Send + Sync {
    async fn load_sync_stamp(
        &self,
        account_name: &str,
        repo_name: &str,
    ) -> Result<Option<DateTime<Utc>>, Error>;

    async fn store_sync_stamp(
        &self,
        account_name: &str,
        repo_name: &str,
        at: DateTime<Utc>,
    ) -> Result<(), Error>;
}

/// Issues registry pull tokens, e.g. for the vulnerability scanner.
pub trait TokenIssuer: Send + Sync {
    fn issue_pull_token(
        &self,
        identity: &Identity,
        account_name: &str,
        repo_name: &str,
    ) -> Result<String, Error>;
}

/// Federation driver for unfederated deployments.
#[derive(Default)]
pub struct NoopFederationDriver;

#[async_trait]
impl FederationDriver for NoopFederationDriver {
    async fn record_existing_account(
        &self,
        _account: &AccountRow,
        _now: DateTime<Utc>,
    ) -> Result<(), Error> {
        Ok(())
    }

    async fn forfeit_account_name(&self, _account: &AccountRow) -> Result<(), Error> {
        Ok(())
    }
}

/// Account management driver backed by a fixed in-process table.
#[derive(Default)]
pub struct StaticAccountManagementDriver {
    accounts: Mutex<HashMap<String, AccountConfig>>,
}

impl StaticAccountManagementDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_account(&self, name: &str, config: AccountConfig) {
        self.accounts
            .lock()
            .unwrap()
            .insert(name.to_string(), config);
    }

    pub fn remove_account(&self, name: &str) {
        self.accounts.lock().unwrap().remove(name);
    }
}

#[async_trait]
impl AccountManagementDriver for StaticAccountManagementDriver {
    async fn managed_account_names(&self) -> Result<Vec<String>, Error> {
        let mut names: Vec<String> = self.accounts.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn configure_account(&self, name: &str) -> Result<Option<AccountConfig>, Error> {
        Ok(self.accounts.lock().unwrap().get(name).cloned())
    }
}

/// Inbound cache living in process memory. Enough for single-node
/// deployments; clustered ones plug in a shared store instead.
#[derive(Default)]
pub struct InMemoryInboundCache {
    stamps: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl InMemoryInboundCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InboundCacheDriver for InMemoryInboundCache {
    async fn load_sync_stamp(
        &self,
        account_name: &str,
        repo_name: &str,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let key = (account_name.to_string(), repo_name.to_string());
        Ok(self.stamps.lock().unwrap().get(&key).copied())
    }

    async fn store_sync_stamp(
        &self,
        account_name: &str,
        repo_name: &str,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let key = (account_name.to_string(), repo_name.to_string());
        self.stamps.lock().unwrap().insert(key, at);
        Ok(())
    }
}

/// Token issuer that hands out one fixed token. Test deployments only.
pub struct StaticTokenIssuer {
    pub token: String,
}

impl TokenIssuer for StaticTokenIssuer {
    fn issue_pull_token(
        &self,
        _identity: &Identity,
        _account_name: &str,
        _repo_name: &str,
    ) -> Result<String, Error> {
        Ok(self.token.clone())
    }
}
