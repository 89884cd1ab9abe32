//! Garbage collection of manifests according to account policies.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stevedore_api_types::{CompiledGcPolicy, GcAction, GcPolicy, GcStatus};
use stevedore_db::{accounts, manifests, repos, AccountRow, DbError, RepoRow};

use crate::server::manifests::delete_manifest_fully;
use crate::server::{Janitor, JobDesc, Task};
use crate::tools::to_chrono;

static IMAGE_GC_DESC: JobDesc = JobDesc {
    name: "image garbage collection",
    counter_name: "stevedore_image_garbage_collections",
    counter_help: "Counter for image garbage collection operations.",
};

/// What the policy evaluation needs to know about one manifest.
pub struct ManifestGcInfo {
    pub digest: String,
    pub pushed_at: DateTime<Utc>,
    /// Latest pull of the manifest or any tag pointing at it.
    pub last_pulled_at: Option<DateTime<Utc>>,
    pub tag_names: Vec<String>,
    /// Whether another manifest in the repo lists this one as a child.
    pub is_child: bool,
}

pub enum GcVerdict {
    Delete,
    Keep(GcStatus),
}

/// Decides the fate of every manifest in a repo.
///
/// Recently pushed manifests are spared unconditionally (the pusher may
/// still be about to tag them), as are manifests referenced by a parent.
/// After that, any matching `protect` policy preserves the manifest;
/// otherwise a matching `delete` policy removes it, and a manifest no
/// policy cares about is kept.
pub fn evaluate_gc_policies(
    policies: &[&CompiledGcPolicy],
    infos: &[ManifestGcInfo],
    now: DateTime<Utc>,
    recent_upload_protection: chrono::Duration,
) -> Vec<(String, GcVerdict)> {
    infos
        .iter()
        .map(|info| {
            if info.pushed_at > now - recent_upload_protection {
                return (
                    info.digest.clone(),
                    GcVerdict::Keep(GcStatus {
                        protected_by_recent_upload: true,
                        ..GcStatus::default()
                    }),
                );
            }
            if info.is_child {
                return (
                    info.digest.clone(),
                    GcVerdict::Keep(GcStatus {
                        protected_by_parent: true,
                        ..GcStatus::default()
                    }),
                );
            }

            let matching: Vec<&&CompiledGcPolicy> = policies
                .iter()
                .filter(|policy| {
                    policy.matches_tags(&info.tag_names)
                        && policy.matches_time(info.pushed_at, info.last_pulled_at, now)
                })
                .collect();

            if let Some(protecting) = matching
                .iter()
                .find(|policy| policy.policy.action == GcAction::Protect)
            {
                return (
                    info.digest.clone(),
                    GcVerdict::Keep(GcStatus {
                        protected_by_policy: Some(protecting.policy.clone()),
                        ..GcStatus::default()
                    }),
                );
            }
            if matching
                .iter()
                .any(|policy| policy.policy.action == GcAction::Delete)
            {
                return (info.digest.clone(), GcVerdict::Delete);
            }

            (
                info.digest.clone(),
                GcVerdict::Keep(GcStatus {
                    relevant_policies: matching.iter().map(|p| p.policy.clone()).collect(),
                    ..GcStatus::default()
                }),
            )
        })
        .collect()
}

pub struct DueGc {
    repo: RepoRow,
    account: AccountRow,
}

pub struct ImageGcTask {
    janitor: Janitor,
}

impl ImageGcTask {
    pub fn new(janitor: Janitor) -> Self {
        Self { janitor }
    }

    async fn collect_infos(&self, repo: &RepoRow) -> Result<Vec<ManifestGcInfo>, Error> {
        let pool = self.janitor.db().pool();

        let manifest_rows = manifests::list_manifests_of_repo(pool, repo.id).await?;
        let tags = manifests::list_tags_of_repo(pool, repo.id).await?;
        let edges = manifests::list_parent_child_edges(pool, repo.id).await?;

        let mut tags_by_digest: HashMap<&str, Vec<&stevedore_db::TagRow>> = HashMap::new();
        for tag in &tags {
            tags_by_digest.entry(tag.digest.as_str()).or_default().push(tag);
        }
        let children: HashSet<&str> = edges.iter().map(|(_, child)| child.as_str()).collect();

        Ok(manifest_rows
            .into_iter()
            .map(|manifest| {
                let manifest_tags = tags_by_digest
                    .get(manifest.digest.as_str())
                    .map(|tags| tags.as_slice())
                    .unwrap_or(&[]);
                let last_pulled_at = manifest_tags
                    .iter()
                    .filter_map(|tag| tag.last_pulled_at)
                    .chain(manifest.last_pulled_at)
                    .max();
                ManifestGcInfo {
                    is_child: children.contains(manifest.digest.as_str()),
                    tag_names: manifest_tags.iter().map(|tag| tag.name.clone()).collect(),
                    last_pulled_at,
                    pushed_at: manifest.pushed_at,
                    digest: manifest.digest,
                }
            })
            .collect())
    }
}

#[async_trait]
impl Task for ImageGcTask {
    type Item = DueGc;

    fn desc(&self) -> &'static JobDesc {
        &IMAGE_GC_DESC
    }

    async fn discover(&self) -> Result<Option<DueGc>, Error> {
        let clock = self.janitor.clock();
        let pool = self.janitor.db().pool();
        let next = clock.next_run(self.janitor.config().gc_interval);

        let repo = match repos::claim_due_gc(pool, clock.now(), next).await? {
            Some(repo) => repo,
            None => return Ok(None),
        };
        let account = accounts::get_account(pool, &repo.account_name)
            .await?
            .ok_or(DbError::NotFound("account of repo"))?;
        Ok(Some(DueGc { repo, account }))
    }

    async fn process(&self, item: DueGc) -> Result<(), Error> {
        let DueGc { repo, account } = item;
        let now = self.janitor.clock().now();

        // a broken policy list is an operator problem and blocks GC for
        // the whole account until fixed
        let policies = GcPolicy::parse_list(&account.gc_policies_json)
            .with_context(|| format!("invalid GC policies on account {}", account.name))?;
        let compiled = policies
            .iter()
            .map(GcPolicy::compile)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid GC policies on account {}", account.name))?;

        // policy repository regexes match the repo name without the
        // account prefix
        let relevant: Vec<&CompiledGcPolicy> = compiled
            .iter()
            .filter(|policy| policy.matches_repository(&repo.name))
            .collect();

        let infos = self.collect_infos(&repo).await?;
        let verdicts = evaluate_gc_policies(
            &relevant,
            &infos,
            now,
            to_chrono(self.janitor.config().recent_upload_protection),
        );

        let pool = self.janitor.db().pool();
        let mut deleted = 0;
        for (digest, verdict) in verdicts {
            match verdict {
                GcVerdict::Delete => {
                    delete_manifest_fully(
                        &self.janitor,
                        repo.id,
                        &repo.account_name,
                        &repo.name,
                        &digest,
                    )
                    .await?;
                    deleted += 1;
                }
                GcVerdict::Keep(status) => {
                    let status_json = serde_json::to_string(&status)?;
                    manifests::update_gc_status(pool, repo.id, &digest, &status_json).await?;
                }
            }
        }

        if deleted > 0 {
            log::info!(
                "garbage collection in repo {} deleted {deleted} manifests",
                repo.full_name(),
            );
        }
        Ok(())
    }
}
