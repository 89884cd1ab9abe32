//! Reconciliation of storage contents against the database.
//!
//! Storage may transiently hold more than the database knows about:
//! uploads that died between chunk and row, manifests whose deletion
//! half-failed, reports of re-scanned images. The sweeper inventories the
//! driver and applies the usual mark/unmark/sweep staging through the
//! `unknown_*` tables. The grace period is the only thing protecting a
//! concurrent writer's freshly stored object, hence the generous 4 hours.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stevedore_db::{accounts, blobs, manifests, security, unknowns, uploads, AccountRow};
use stevedore_storage::StorageContents;

use crate::server::{Janitor, JobDesc, Task};
use crate::tools::to_chrono;

static STORAGE_SWEEP_DESC: JobDesc = JobDesc {
    name: "storage sweep",
    counter_name: "stevedore_storage_sweeps",
    counter_help: "Counter for storage sweep operations.",
};

pub(crate) struct SweepPlan<K> {
    /// Listed in storage, no DB referent, not yet marked.
    pub mark: Vec<K>,
    /// Marked, but the referent reappeared or the object is gone.
    pub unmark: Vec<K>,
    /// Marked long enough ago and still present and unreferenced.
    pub sweep: Vec<K>,
}

/// The core mark/unmark/sweep decision, shared by all three object
/// categories. Sweeping is gated on the object still being in the live
/// listing so that a racing deletion elsewhere cannot make us touch a
/// name that now means something else.
pub(crate) fn plan_sweep<K: Ord + Clone>(
    listed: &BTreeSet<K>,
    known: &BTreeSet<K>,
    marked: &BTreeMap<K, DateTime<Utc>>,
    now: DateTime<Utc>,
) -> SweepPlan<K> {
    let mut plan = SweepPlan {
        mark: Vec::new(),
        unmark: Vec::new(),
        sweep: Vec::new(),
    };

    for key in listed {
        if !known.contains(key) && !marked.contains_key(key) {
            plan.mark.push(key.clone());
        }
    }
    for (key, deadline) in marked {
        if known.contains(key) || !listed.contains(key) {
            plan.unmark.push(key.clone());
        } else if *deadline < now {
            plan.sweep.push(key.clone());
        }
    }
    plan
}

pub struct DueStorageSweep {
    account: AccountRow,
}

pub struct StorageSweepTask {
    janitor: Janitor,
}

impl StorageSweepTask {
    pub fn new(janitor: Janitor) -> Self {
        Self { janitor }
    }

    async fn sweep_blobs(
        &self,
        account: &AccountRow,
        contents: &StorageContents,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let pool = self.janitor.db().pool();
        let deadline = now + to_chrono(self.janitor.config().storage_sweep_grace);

        let chunk_counts: BTreeMap<String, u32> = contents
            .blobs
            .iter()
            .map(|blob| (blob.storage_id.clone(), blob.chunk_count))
            .collect();
        let listed: BTreeSet<String> = chunk_counts.keys().cloned().collect();

        let mut known: BTreeSet<String> =
            blobs::list_storage_ids(pool, &account.name).await?.into_iter().collect();
        // in-flight uploads protect their half-written blobs
        known.extend(uploads::list_storage_ids(pool, &account.name).await?);

        let marked: BTreeMap<String, DateTime<Utc>> =
            unknowns::list_unknown_blobs(pool, &account.name)
                .await?
                .into_iter()
                .map(|row| (row.storage_id, row.can_be_deleted_at))
                .collect();

        let plan = plan_sweep(&listed, &known, &marked, now);
        for storage_id in &plan.mark {
            unknowns::insert_unknown_blob(pool, &account.name, storage_id, deadline).await?;
        }
        for storage_id in &plan.unmark {
            unknowns::delete_unknown_blob(pool, &account.name, storage_id).await?;
        }
        for storage_id in &plan.sweep {
            match chunk_counts.get(storage_id) {
                Some(chunk_count) if *chunk_count > 0 => {
                    self.janitor
                        .storage()
                        .abort_blob_upload(&account.name, storage_id, *chunk_count)
                        .await?;
                }
                _ => {
                    self.janitor
                        .storage()
                        .delete_blob(&account.name, storage_id)
                        .await?;
                }
            }
            unknowns::delete_unknown_blob(pool, &account.name, storage_id).await?;
            log::info!(
                "storage sweep removed unknown blob object {storage_id} in account {}",
                account.name,
            );
        }
        Ok(())
    }

    async fn sweep_manifests(
        &self,
        account: &AccountRow,
        contents: &StorageContents,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let pool = self.janitor.db().pool();
        let deadline = now + to_chrono(self.janitor.config().storage_sweep_grace);

        let listed: BTreeSet<(String, String)> = contents
            .manifests
            .iter()
            .map(|m| (m.repo_name.clone(), m.digest.clone()))
            .collect();
        let known: BTreeSet<(String, String)> = manifests::list_known_manifests(pool, &account.name)
            .await?
            .into_iter()
            .collect();
        let marked: BTreeMap<(String, String), DateTime<Utc>> =
            unknowns::list_unknown_manifests(pool, &account.name)
                .await?
                .into_iter()
                .map(|row| ((row.repo_name, row.digest), row.can_be_deleted_at))
                .collect();

        let plan = plan_sweep(&listed, &known, &marked, now);
        for (repo_name, digest) in &plan.mark {
            unknowns::insert_unknown_manifest(pool, &account.name, repo_name, digest, deadline)
                .await?;
        }
        for (repo_name, digest) in &plan.unmark {
            unknowns::delete_unknown_manifest(pool, &account.name, repo_name, digest).await?;
        }
        for (repo_name, digest) in &plan.sweep {
            self.janitor
                .storage()
                .delete_manifest(&account.name, repo_name, digest)
                .await?;
            unknowns::delete_unknown_manifest(pool, &account.name, repo_name, digest).await?;
            log::info!(
                "storage sweep removed unknown manifest object {}/{repo_name}@{digest}",
                account.name,
            );
        }
        Ok(())
    }

    async fn sweep_trivy_reports(
        &self,
        account: &AccountRow,
        contents: &StorageContents,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let pool = self.janitor.db().pool();
        let deadline = now + to_chrono(self.janitor.config().storage_sweep_grace);

        let listed: BTreeSet<(String, String, String)> = contents
            .trivy_reports
            .iter()
            .map(|r| (r.repo_name.clone(), r.digest.clone(), r.format.clone()))
            .collect();
        // enriched reports only exist in the "json" format
        let known: BTreeSet<(String, String, String)> =
            security::list_known_reports(pool, &account.name)
                .await?
                .into_iter()
                .map(|(repo_name, digest)| (repo_name, digest, "json".to_string()))
                .collect();
        let marked: BTreeMap<(String, String, String), DateTime<Utc>> =
            unknowns::list_unknown_trivy_reports(pool, &account.name)
                .await?
                .into_iter()
                .map(|row| ((row.repo_name, row.digest, row.format), row.can_be_deleted_at))
                .collect();

        let plan = plan_sweep(&listed, &known, &marked, now);
        for (repo_name, digest, format) in &plan.mark {
            unknowns::insert_unknown_trivy_report(
                pool,
                &account.name,
                repo_name,
                digest,
                format,
                deadline,
            )
            .await?;
        }
        for (repo_name, digest, format) in &plan.unmark {
            unknowns::delete_unknown_trivy_report(pool, &account.name, repo_name, digest, format)
                .await?;
        }
        for (repo_name, digest, format) in &plan.sweep {
            self.janitor
                .storage()
                .delete_trivy_report(&account.name, repo_name, digest, format)
                .await?;
            unknowns::delete_unknown_trivy_report(pool, &account.name, repo_name, digest, format)
                .await?;
            log::info!(
                "storage sweep removed unknown trivy report {}/{repo_name}@{digest} ({format})",
                account.name,
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Task for StorageSweepTask {
    type Item = DueStorageSweep;

    fn desc(&self) -> &'static JobDesc {
        &STORAGE_SWEEP_DESC
    }

    async fn discover(&self) -> Result<Option<DueStorageSweep>, Error> {
        let clock = self.janitor.clock();
        let next = clock.next_run(self.janitor.config().storage_sweep_interval);
        let account =
            accounts::claim_due_storage_sweep(self.janitor.db().pool(), clock.now(), next).await?;
        Ok(account.map(|account| DueStorageSweep { account }))
    }

    async fn process(&self, item: DueStorageSweep) -> Result<(), Error> {
        let DueStorageSweep { account } = item;
        let now = self.janitor.clock().now();

        let contents = self.janitor.storage().list_storage_contents(&account.name).await?;

        self.sweep_blobs(&account, &contents, now).await?;
        self.sweep_manifests(&account, &contents, now).await?;
        self.sweep_trivy_reports(&account, &contents, now).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marked(entries: &[(&str, DateTime<Utc>)]) -> BTreeMap<String, DateTime<Utc>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    fn set(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn unreferenced_objects_are_marked_once() {
        let now = Utc::now();
        let plan = plan_sweep(&set(&["a", "b", "c"]), &set(&["a"]), &marked(&[("b", now)]), now);
        assert_eq!(plan.mark, vec!["c".to_string()]);
    }

    #[test]
    fn reappeared_referent_unmarks() {
        let now = Utc::now();
        let later = now + chrono::Duration::hours(4);
        // "a" got a DB row since it was marked; "gone" vanished from
        // storage by other means
        let plan = plan_sweep(
            &set(&["a"]),
            &set(&["a"]),
            &marked(&[("a", later), ("gone", later)]),
            now,
        );
        assert_eq!(plan.unmark, vec!["a".to_string(), "gone".to_string()]);
        assert!(plan.sweep.is_empty());
    }

    #[test]
    fn marks_expire_into_sweeps() {
        let now = Utc::now();
        let expired = now - chrono::Duration::minutes(1);
        let pending = now + chrono::Duration::hours(3);
        let plan = plan_sweep(
            &set(&["old", "young"]),
            &set(&[]),
            &marked(&[("old", expired), ("young", pending)]),
            now,
        );
        assert!(plan.mark.is_empty());
        assert!(plan.unmark.is_empty());
        assert_eq!(plan.sweep, vec!["old".to_string()]);
    }

    #[test]
    fn sweep_requires_live_listing() {
        let now = Utc::now();
        let expired = now - chrono::Duration::minutes(1);
        let plan = plan_sweep(&set(&[]), &set(&[]), &marked(&[("old", expired)]), now);
        assert!(plan.sweep.is_empty());
        assert_eq!(plan.unmark, vec!["old".to_string()]);
    }
}
