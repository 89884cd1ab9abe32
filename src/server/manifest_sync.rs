//! Replica-side manifest sync.
//!
//! A replica repo never deletes manifests on its own; it mirrors
//! deletions, tag changes and (in one direction) pull timestamps from its
//! primary. One sync pass handles one repo:
//!
//! - every local manifest is checked against the primary; a definitive
//!   "not found" queues it for deletion, any other failure aborts the
//!   pass as a network error,
//! - queued deletions run children-last, since a manifest must not
//!   disappear while another manifest still lists it,
//! - tags are reconciled (additions, moves, removals); a moved tag
//!   triggers re-validation of the newly tagged manifest,
//! - in on-first-use replication the replica pushes its `last_pulled_at`
//!   high-water marks to the primary, the only write it ever does there.

use std::collections::{BTreeSet, HashMap};

use anyhow::{bail, Context, Error};
use async_trait::async_trait;

use stevedore_client::{LastPulledMerge, PeerApi, PeerTag};
use stevedore_db::{accounts, manifests, repos, AccountRow, DbError, RepoRow, TagRow};

use stevedore_api_types::ReplicationMode;

use crate::server::manifests::delete_manifest_fully;
use crate::server::{Janitor, JobDesc, Task};
use crate::tools::to_chrono;

static MANIFEST_SYNC_DESC: JobDesc = JobDesc {
    name: "manifest sync",
    counter_name: "stevedore_manifest_syncs",
    counter_help: "Counter for manifest sync operations.",
};

/// Computes the order in which the queued manifests can be deleted.
///
/// Each round contains the manifests whose parents have all been deleted
/// in earlier rounds (or were never referenced). If no progress is
/// possible while work remains, some queued manifest is still referenced
/// by a manifest that is not queued, which is an inconsistency between
/// replica and primary.
pub(crate) fn plan_deletion_rounds(
    doomed: &BTreeSet<String>,
    parent_child_edges: &[(String, String)],
) -> Result<Vec<Vec<String>>, Error> {
    let mut remaining = doomed.clone();
    let mut deleted: BTreeSet<String> = BTreeSet::new();
    let mut rounds = Vec::new();

    while !remaining.is_empty() {
        let round: Vec<String> = remaining
            .iter()
            .filter(|digest| {
                parent_child_edges
                    .iter()
                    .filter(|(_, child)| child == *digest)
                    .all(|(parent, _)| deleted.contains(parent))
            })
            .cloned()
            .collect();

        if round.is_empty() {
            bail!(
                "cannot delete {} manifests because they are still referenced by other manifests",
                remaining.len(),
            );
        }
        for digest in &round {
            remaining.remove(digest);
            deleted.insert(digest.clone());
        }
        rounds.push(round);
    }

    Ok(rounds)
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct TagSyncPlan {
    pub added: Vec<PeerTag>,
    pub moved: Vec<PeerTag>,
    pub removed: Vec<String>,
}

/// Diffs the local tag set against the primary's.
pub(crate) fn plan_tag_sync(local: &[TagRow], upstream: &[PeerTag]) -> TagSyncPlan {
    let local_by_name: HashMap<&str, &str> = local
        .iter()
        .map(|tag| (tag.name.as_str(), tag.digest.as_str()))
        .collect();
    let upstream_names: BTreeSet<&str> = upstream.iter().map(|tag| tag.name.as_str()).collect();

    let mut plan = TagSyncPlan::default();
    for tag in upstream {
        match local_by_name.get(tag.name.as_str()) {
            None => plan.added.push(tag.clone()),
            Some(digest) if *digest != tag.digest => plan.moved.push(tag.clone()),
            Some(_) => (), // unchanged, do not touch
        }
    }
    for tag in local {
        if !upstream_names.contains(tag.name.as_str()) {
            plan.removed.push(tag.name.clone());
        }
    }
    plan
}

pub struct DueManifestSync {
    repo: RepoRow,
    account: AccountRow,
}

pub struct ManifestSyncTask {
    janitor: Janitor,
}

impl ManifestSyncTask {
    pub fn new(janitor: Janitor) -> Self {
        Self { janitor }
    }

    /// Deletes every local manifest the primary no longer has.
    async fn sync_deletions(
        &self,
        repo: &RepoRow,
        peer: &dyn PeerApi,
        repo_on_primary: &str,
    ) -> Result<(), Error> {
        let pool = self.janitor.db().pool();

        let mut doomed = BTreeSet::new();
        for manifest in manifests::list_manifests_of_repo(pool, repo.id).await? {
            let exists = peer
                .check_manifest(repo_on_primary, &manifest.digest)
                .await
                .with_context(|| {
                    format!("cannot check manifest {} on primary", manifest.digest)
                })?;
            if !exists {
                doomed.insert(manifest.digest);
            }
        }
        if doomed.is_empty() {
            return Ok(());
        }

        let edges = manifests::list_parent_child_edges(pool, repo.id).await?;
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
        Ok(())
    }

    /// Replays tag additions, moves and removals from the primary.
    async fn sync_tags(
        &self,
        repo: &RepoRow,
        peer: &dyn PeerApi,
        repo_on_primary: &str,
    ) -> Result<(), Error> {
        let pool = self.janitor.db().pool();
        let now = self.janitor.clock().now();

        let local = manifests::list_tags_of_repo(pool, repo.id).await?;
        let upstream = peer
            .get_tags(repo_on_primary)
            .await
            .context("cannot list tags on primary")?;
        let plan = plan_tag_sync(&local, &upstream);

        for tag in &plan.added {
            // only materialize tags for manifests we already replicated;
            // the rest appear when they are first pulled
            if manifests::get_manifest(pool, repo.id, &tag.digest).await?.is_some() {
                manifests::insert_tag(pool, repo.id, &tag.name, &tag.digest, now).await?;
            }
        }
        for tag in &plan.moved {
            if manifests::get_manifest(pool, repo.id, &tag.digest).await?.is_none() {
                // target manifest not replicated yet, keep the stale tag
                // until it is
                continue;
            }
            manifests::move_tag(pool, repo.id, &tag.name, &tag.digest, now).await?;
            manifests::request_validation(pool, repo.id, &tag.digest, now).await?;
            log::info!(
                "tag {} in repo {} moved to {}",
                tag.name,
                repo.full_name(),
                tag.digest,
            );
        }
        for name in &plan.removed {
            manifests::delete_tag(pool, repo.id, name).await?;
        }
        Ok(())
    }

    /// Pushes local pull timestamps to the primary.
    async fn merge_last_pulled(
        &self,
        repo: &RepoRow,
        peer: &dyn PeerApi,
        repo_on_primary: &str,
    ) -> Result<(), Error> {
        let pool = self.janitor.db().pool();

        let mut merge = LastPulledMerge::default();
        for manifest in manifests::list_manifests_of_repo(pool, repo.id).await? {
            if let Some(at) = manifest.last_pulled_at {
                merge.manifests.insert(manifest.digest, at);
            }
        }
        for tag in manifests::list_tags_of_repo(pool, repo.id).await? {
            if let Some(at) = tag.last_pulled_at {
                merge.tags.insert(tag.name, at);
            }
        }
        if merge.is_empty() {
            return Ok(());
        }
        peer.merge_last_pulled(repo_on_primary, &merge)
            .await
            .context("cannot merge last-pulled timestamps into primary")?;
        Ok(())
    }
}

#[async_trait]
impl Task for ManifestSyncTask {
    type Item = DueManifestSync;

    fn desc(&self) -> &'static JobDesc {
        &MANIFEST_SYNC_DESC
    }

    async fn discover(&self) -> Result<Option<DueManifestSync>, Error> {
        let clock = self.janitor.clock();
        let pool = self.janitor.db().pool();
        let next = clock.next_run(self.janitor.config().manifest_sync_interval);

        let repo = match repos::claim_due_manifest_sync(pool, clock.now(), next).await? {
            Some(repo) => repo,
            None => return Ok(None),
        };
        let account = accounts::get_account(pool, &repo.account_name)
            .await?
            .ok_or(DbError::NotFound("account of replica repo"))?;
        Ok(Some(DueManifestSync { repo, account }))
    }

    async fn process(&self, item: DueManifestSync) -> Result<(), Error> {
        let DueManifestSync { repo, account } = item;
        let config = self.janitor.config();
        let now = self.janitor.clock().now();

        let (peer, repo_on_primary, is_external) = match account.replication_mode() {
            ReplicationMode::None => {
                // the repo stopped being a replica between claim and now
                return Ok(());
            }
            ReplicationMode::OnFirstUse { upstream_hostname } => {
                let peer = self.janitor.peer_connector().connect(&upstream_hostname)?;
                (peer, format!("{}/{}", account.name, repo.name), false)
            }
            ReplicationMode::FromExternalOnFirstUse { upstream_url } => {
                let peer = self.janitor.peer_connector().connect(&upstream_url)?;
                (peer, repo.name.clone(), true)
            }
        };

        // Cross-cluster manifest checks against an external primary are
        // expensive, so they are rate-limited through the inbound cache;
        // tag sync stays active within the window.
        let mut run_deletions = true;
        if is_external {
            let stamp = self
                .janitor
                .inbound_cache()
                .load_sync_stamp(&account.name, &repo.name)
                .await?;
            if let Some(stamp) = stamp {
                if stamp > now - to_chrono(config.inbound_cache_lifetime) {
                    run_deletions = false;
                }
            }
        }

        if run_deletions {
            self.sync_deletions(&repo, &*peer, &repo_on_primary).await?;
            if is_external {
                self.janitor
                    .inbound_cache()
                    .store_sync_stamp(&account.name, &repo.name, now)
                    .await?;
            }
        }

        self.sync_tags(&repo, &*peer, &repo_on_primary).await?;

        if account.replication_mode().merges_last_pulled() {
            self.merge_last_pulled(&repo, &*peer, &repo_on_primary)
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(byte: u8) -> String {
        format!("sha256:{}", hex::encode([byte; 32]))
    }

    #[test]
    fn deletion_rounds_respect_parent_order() {
        // list L references A and B; everything is doomed
        let doomed: BTreeSet<String> =
            [digest(1), digest(2), digest(3)].into_iter().collect();
        let edges = vec![
            (digest(3), digest(1)),
            (digest(3), digest(2)),
        ];

        let rounds = plan_deletion_rounds(&doomed, &edges).unwrap();
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0], vec![digest(3)]);
        let mut second = rounds[1].clone();
        second.sort();
        assert_eq!(second, vec![digest(1), digest(2)]);
    }

    #[test]
    fn deletion_rounds_handle_chains() {
        let doomed: BTreeSet<String> =
            [digest(1), digest(2), digest(3)].into_iter().collect();
        let edges = vec![
            (digest(1), digest(2)),
            (digest(2), digest(3)),
        ];

        let rounds = plan_deletion_rounds(&doomed, &edges).unwrap();
        assert_eq!(
            rounds,
            vec![vec![digest(1)], vec![digest(2)], vec![digest(3)]],
        );
    }

    #[test]
    fn deletion_stalls_on_live_parent() {
        // child is doomed but its parent is not queued for deletion
        let doomed: BTreeSet<String> = [digest(1)].into_iter().collect();
        let edges = vec![(digest(9), digest(1))];

        let err = plan_deletion_rounds(&doomed, &edges).unwrap_err();
        assert!(err.to_string().contains("still referenced"));
    }

    #[test]
    fn deletion_of_unreferenced_manifests_is_single_round() {
        let doomed: BTreeSet<String> = [digest(1), digest(2)].into_iter().collect();
        let rounds = plan_deletion_rounds(&doomed, &[]).unwrap();
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].len(), 2);
    }

    fn tag_row(name: &str, digest_str: &str) -> TagRow {
        TagRow {
            repo_id: 1,
            name: name.to_string(),
            digest: digest_str.to_string(),
            pushed_at: chrono::Utc::now(),
            last_pulled_at: None,
        }
    }

    fn peer_tag(name: &str, digest_str: &str) -> PeerTag {
        PeerTag {
            name: name.to_string(),
            digest: digest_str.to_string(),
        }
    }

    #[test]
    fn tag_sync_plan_classifies_changes() {
        let local = vec![
            tag_row("latest", &digest(1)),
            tag_row("stable", &digest(2)),
            tag_row("old", &digest(3)),
        ];
        let upstream = vec![
            peer_tag("latest", &digest(9)), // moved
            peer_tag("stable", &digest(2)), // unchanged
            peer_tag("fresh", &digest(4)),  // added
        ];

        let plan = plan_tag_sync(&local, &upstream);
        assert_eq!(plan.added.len(), 1);
        assert_eq!(plan.added[0].name, "fresh");
        assert_eq!(plan.moved.len(), 1);
        assert_eq!(plan.moved[0].name, "latest");
        assert_eq!(plan.moved[0].digest, digest(9));
        assert_eq!(plan.removed, vec!["old".to_string()]);
    }

    #[test]
    fn tag_sync_plan_is_empty_when_in_sync() {
        let local = vec![tag_row("latest", &digest(1))];
        let upstream = vec![peer_tag("latest", &digest(1))];
        assert_eq!(plan_tag_sync(&local, &upstream), TagSyncPlan::default());
    }
}
