//! Enforcement of managed accounts, account deletion, and federation
//! announcements.

use std::collections::{BTreeSet, HashSet};

use anyhow::{bail, Context, Error};
use async_trait::async_trait;

use stevedore_api_types::Identity;
use stevedore_db::{
    accounts, blobs, manifests, repos, unknowns, uploads, AccountRow,
};

use crate::drivers::AccountConfig;
use crate::server::manifest_sync::plan_deletion_rounds;
use crate::server::manifests::delete_manifest_fully;
use crate::server::{Janitor, JobDesc, Task};
use crate::tools::to_chrono;

static ACCOUNT_ENFORCEMENT_DESC: JobDesc = JobDesc {
    name: "account enforcement",
    counter_name: "stevedore_account_enforcements",
    counter_help: "Counter for account enforcement operations.",
};

static ACCOUNT_DELETION_DESC: JobDesc = JobDesc {
    name: "account deletion",
    counter_name: "stevedore_account_deletions",
    counter_help: "Counter for account deletion operations.",
};

static FEDERATION_ANNOUNCEMENT_DESC: JobDesc = JobDesc {
    name: "federation announcement",
    counter_name: "stevedore_federation_announcements",
    counter_help: "Counter for federation announcement operations.",
};

pub enum EnforcementWork {
    /// A name the driver manages but no account row exists for yet.
    CreateMissing(String),
    /// An existing managed account whose enforcement is due.
    Existing(AccountRow),
}

/// Applies the account management driver's desired state: managed
/// accounts are created and kept up to date, accounts the driver stopped
/// listing are marked for deletion.
pub struct AccountEnforcementTask {
    janitor: Janitor,
}

impl AccountEnforcementTask {
    pub fn new(janitor: Janitor) -> Self {
        Self { janitor }
    }

    async fn apply_config(
        &self,
        name: &str,
        config: &AccountConfig,
        is_new: bool,
    ) -> Result<(), Error> {
        // reject broken policies here instead of letting every dependent
        // job fail on them later
        for policy in &config.gc_policies {
            policy
                .compile()
                .with_context(|| format!("driver supplied invalid GC policy for {name}"))?;
        }
        for policy in &config.security_scan_policies {
            policy.compile().with_context(|| {
                format!("driver supplied invalid security scan policy for {name}")
            })?;
        }
        for policy in &config.rbac_policies {
            policy
                .validate()
                .with_context(|| format!("driver supplied invalid RBAC policy for {name}"))?;
        }

        if is_new {
            if let Some(upstream) = &config.upstream_peer_hostname {
                // a new replica must prove to its upstream that it may
                // carry this account name
                let peer = self.janitor.peer_connector().connect(upstream)?;
                let token = peer
                    .get_sublease_token(name)
                    .await
                    .with_context(|| format!("cannot obtain sublease for {name} from {upstream}"))?;
                log::info!(
                    "obtained sublease token for account {name} from {upstream} ({} bytes)",
                    token.len(),
                );
            }
        }

        let gc_policies_json = serde_json::to_string(&config.gc_policies)?;
        let security_scan_policies_json = serde_json::to_string(&config.security_scan_policies)?;
        let rbac_policies_json = serde_json::to_string(&config.rbac_policies)?;
        accounts::upsert_managed_account(
            self.janitor.db().pool(),
            name,
            &config.auth_tenant_id,
            config.upstream_peer_hostname.as_deref(),
            config.external_peer_url.as_deref(),
            &gc_policies_json,
            &security_scan_policies_json,
            &rbac_policies_json,
        )
        .await?;

        let identity = Identity::janitor("account enforcement");
        log::info!(
            "audit: {identity} {} account {name} for tenant {}",
            if is_new { "created" } else { "updated" },
            config.auth_tenant_id,
        );
        Ok(())
    }
}

#[async_trait]
impl Task for AccountEnforcementTask {
    type Item = EnforcementWork;

    fn desc(&self) -> &'static JobDesc {
        &ACCOUNT_ENFORCEMENT_DESC
    }

    async fn discover(&self) -> Result<Option<EnforcementWork>, Error> {
        let clock = self.janitor.clock();
        let pool = self.janitor.db().pool();

        // accounts the driver wants but we do not have come first
        let managed = self.janitor.account_management().managed_account_names().await?;
        let existing: HashSet<String> =
            accounts::list_account_names(pool).await?.into_iter().collect();
        if let Some(name) = managed.into_iter().find(|name| !existing.contains(name)) {
            return Ok(Some(EnforcementWork::CreateMissing(name)));
        }

        let next = clock.next_run(self.janitor.config().account_enforcement_interval);
        let account = accounts::claim_due_enforcement(pool, clock.now(), next).await?;
        Ok(account.map(EnforcementWork::Existing))
    }

    async fn process(&self, work: EnforcementWork) -> Result<(), Error> {
        let clock = self.janitor.clock();
        let pool = self.janitor.db().pool();

        let (name, is_new) = match &work {
            EnforcementWork::CreateMissing(name) => (name.clone(), true),
            EnforcementWork::Existing(account) => (account.name.clone(), false),
        };
        if !stevedore_api_types::is_valid_account_name(&name) {
            bail!("account management driver supplied invalid account name {name:?}");
        }

        match self.janitor.account_management().configure_account(&name).await? {
            Some(config) => {
                self.apply_config(&name, &config, is_new).await?;
                if is_new {
                    // existing accounts had their schedule advanced at
                    // claim time already
                    accounts::reschedule_enforcement(
                        pool,
                        &name,
                        clock.next_run(self.janitor.config().account_enforcement_interval),
                    )
                    .await?;
                }
            }
            None => {
                if let EnforcementWork::Existing(account) = &work {
                    if account.is_managed && !account.is_deleting {
                        accounts::mark_for_deletion(pool, &account.name, clock.now()).await?;
                        log::info!(
                            "audit: {} marked account {} for deletion",
                            Identity::janitor("account enforcement"),
                            account.name,
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

pub struct DueDeletion {
    account: AccountRow,
}

/// Drives an account marked for deletion through manifest, repo, blob and
/// storage cleanup until the row itself can go.
pub struct AccountDeletionTask {
    janitor: Janitor,
}

impl AccountDeletionTask {
    pub fn new(janitor: Janitor) -> Self {
        Self { janitor }
    }

    /// Deletes every manifest of the account, children last.
    async fn delete_all_manifests(&self, account: &AccountRow) -> Result<(), Error> {
        let pool = self.janitor.db().pool();

        for repo in repos::list_repos_of_account(pool, &account.name).await? {
            let doomed: BTreeSet<String> = manifests::list_manifests_of_repo(pool, repo.id)
                .await?
                .into_iter()
                .map(|manifest| manifest.digest)
                .collect();
            if doomed.is_empty() {
                continue;
            }
            let edges = manifests::list_parent_child_edges(pool, repo.id).await?;
            // a stall here is a hard error: the refs table contradicts
            // the manifest set
            for round in plan_deletion_rounds(&doomed, &edges)? {
                for digest in round {
                    delete_manifest_fully(
                        &self.janitor,
                        repo.id,
                        &repo.account_name,
                        &repo.name,
                        &digest,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Deletes whatever the storage driver still lists, without the usual
    /// grace period. At this point no database row of the account is
    /// left, so everything in storage is garbage by definition.
    async fn clear_storage(&self, account: &AccountRow) -> Result<(), Error> {
        let storage = self.janitor.storage();
        let contents = storage.list_storage_contents(&account.name).await?;

        for blob in &contents.blobs {
            if blob.chunk_count > 0 {
                storage
                    .abort_blob_upload(&account.name, &blob.storage_id, blob.chunk_count)
                    .await?;
            } else {
                storage.delete_blob(&account.name, &blob.storage_id).await?;
            }
        }
        for manifest in &contents.manifests {
            storage
                .delete_manifest(&account.name, &manifest.repo_name, &manifest.digest)
                .await?;
        }
        for report in &contents.trivy_reports {
            storage
                .delete_trivy_report(
                    &account.name,
                    &report.repo_name,
                    &report.digest,
                    &report.format,
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Task for AccountDeletionTask {
    type Item = DueDeletion;

    fn desc(&self) -> &'static JobDesc {
        &ACCOUNT_DELETION_DESC
    }

    async fn discover(&self) -> Result<Option<DueDeletion>, Error> {
        let clock = self.janitor.clock();
        let now = clock.now();
        // pre-schedule the retry; the success path deletes the row anyway
        let retry = now + to_chrono(self.janitor.config().deletion_retry_interval);
        let account =
            accounts::claim_due_deletion(self.janitor.db().pool(), now, retry).await?;
        Ok(account.map(|account| DueDeletion { account }))
    }

    async fn process(&self, item: DueDeletion) -> Result<(), Error> {
        let DueDeletion { account } = item;
        let pool = self.janitor.db().pool();
        let clock = self.janitor.clock();
        let now = clock.now();

        if !account.is_deleting {
            bail!("account {} is not marked for deletion", account.name);
        }

        self.delete_all_manifests(&account).await?;

        uploads::delete_uploads_of_account(pool, &account.name).await?;
        blobs::delete_mounts_of_account(pool, &account.name).await?;
        for repo in repos::list_repos_of_account(pool, &account.name).await? {
            repos::delete_repo(pool, repo.id).await?;
        }

        // hand remaining blobs to the blob sweeper and come back later
        if blobs::count_blobs_in_account(pool, &account.name).await? > 0 {
            blobs::mark_all_blobs_for_deletion(pool, &account.name, now).await?;
            accounts::request_blob_sweep(pool, &account.name, now).await?;
            accounts::set_next_deletion_attempt(
                pool,
                &account.name,
                now + to_chrono(self.janitor.config().deletion_blob_wait),
            )
            .await?;
            log::info!(
                "deletion of account {} waits for the blob sweeper",
                account.name,
            );
            return Ok(());
        }

        self.clear_storage(&account).await?;

        let mut tx = self.janitor.db().begin().await?;
        unknowns::delete_all_for_account(&mut tx, &account.name).await?;
        accounts::delete_account(&mut *tx, &account.name).await?;
        self.janitor.storage().cleanup_account(&account.name).await?;
        self.janitor
            .federation()
            .forfeit_account_name(&account)
            .await
            .with_context(|| format!("cannot forfeit account name {}", account.name))?;
        tx.commit().await?;

        log::info!("deleted account {}", account.name);
        Ok(())
    }
}

pub struct DueAnnouncement {
    account: AccountRow,
}

/// Periodically re-announces every account to the federation driver.
pub struct FederationAnnouncementTask {
    janitor: Janitor,
}

impl FederationAnnouncementTask {
    pub fn new(janitor: Janitor) -> Self {
        Self { janitor }
    }
}

#[async_trait]
impl Task for FederationAnnouncementTask {
    type Item = DueAnnouncement;

    fn desc(&self) -> &'static JobDesc {
        &FEDERATION_ANNOUNCEMENT_DESC
    }

    async fn discover(&self) -> Result<Option<DueAnnouncement>, Error> {
        let clock = self.janitor.clock();
        // the schedule advances before the driver call, so a persistently
        // failing driver cannot wedge the loop on one account
        let next = clock.next_run(self.janitor.config().federation_announcement_interval);
        let account = accounts::claim_due_federation_announcement(
            self.janitor.db().pool(),
            clock.now(),
            next,
        )
        .await?;
        Ok(account.map(|account| DueAnnouncement { account }))
    }

    async fn process(&self, item: DueAnnouncement) -> Result<(), Error> {
        let DueAnnouncement { account } = item;
        let now = self.janitor.clock().now();

        // best-effort: the driver owns its own consistency
        if let Err(err) = self
            .janitor
            .federation()
            .record_existing_account(&account, now)
            .await
        {
            log::warn!(
                "cannot announce account {} to federation: {err:#}",
                account.name,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use stevedore_api_types::{GcPolicy, SecurityScanPolicy};

    #[test]
    fn policy_validation_catches_driver_mistakes() {
        let broken: Vec<GcPolicy> = serde_json::from_str(
            r#"[{"match_repository": "*oops", "action": "delete"}]"#,
        )
        .unwrap();
        assert!(broken[0].compile().is_err());

        let broken: Vec<SecurityScanPolicy> = serde_json::from_str(
            r#"[{
                "match_repository": ".*",
                "match_vulnerability_id": "CVE-.*",
                "action": {"assessment": ""}
            }]"#,
        )
        .unwrap();
        assert!(broken[0].compile().is_err());
    }
}
