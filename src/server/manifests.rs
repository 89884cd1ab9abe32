//! Manifest validation and the shared manifest deletion path.

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::{bail, format_err, Error};
use async_trait::async_trait;
use sqlx::postgres::Postgres;
use sqlx::Transaction;

use stevedore_db::{blobs, manifests, ManifestWithRepo};

use crate::registry::manifest::parse_manifest;
use crate::server::{Janitor, JobDesc, Task};

static MANIFEST_VALIDATION_DESC: JobDesc = JobDesc {
    name: "manifest validation",
    counter_name: "stevedore_manifest_validations",
    counter_help: "Counter for manifest validation operations.",
};

/// Deletes one manifest everywhere: all its database rows in one
/// transaction, then its bytes in storage. The database goes first so
/// that a failed storage delete only leaks an unreferenced object, which
/// the storage sweeper reclaims.
pub(crate) async fn delete_manifest_fully(
    janitor: &Janitor,
    repo_id: i64,
    account_name: &str,
    repo_name: &str,
    digest: &str,
) -> Result<(), Error> {
    let mut tx = janitor.db().begin().await?;
    let deleted = manifests::delete_manifest_rows(&mut tx, repo_id, digest).await?;
    tx.commit().await?;

    if !deleted {
        // already gone, e.g. a concurrent worker won the race
        return Ok(());
    }

    janitor
        .storage()
        .delete_manifest(account_name, repo_name, digest)
        .await?;
    log::info!("deleted manifest {account_name}/{repo_name}@{digest}");
    Ok(())
}

pub struct DueManifestValidation {
    tx: Transaction<'static, Postgres>,
    candidate: ManifestWithRepo,
}

/// Periodic structural re-check of manifests.
///
/// Re-parses the stored bytes and restores the invariant that the
/// `manifest_blob_refs` and `manifest_manifest_refs` rows equal the
/// reference sets obtained from the content, fixing `size_bytes` along
/// the way. References to blobs or manifests the registry does not know
/// are a validation error, not something to silently create.
pub struct ManifestValidationTask {
    janitor: Janitor,
}

impl ManifestValidationTask {
    pub fn new(janitor: Janitor) -> Self {
        Self { janitor }
    }
}

impl ManifestValidationTask {
    async fn validate(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        candidate: &ManifestWithRepo,
    ) -> Result<(), Error> {
        let manifest = &candidate.manifest;
        let repo_id = manifest.repo_id;

        let content = manifests::get_content(&mut **tx, repo_id, &manifest.digest)
            .await?
            .ok_or_else(|| format_err!("manifest contents are missing from the database"))?;

        let parsed = parse_manifest(&manifest.media_type, &content)?;

        if parsed.size_bytes as i64 != manifest.size_bytes {
            manifests::update_size(&mut **tx, repo_id, &manifest.digest, parsed.size_bytes as i64)
                .await?;
        }

        // restore the blob reference set
        let wanted_digests: Vec<String> = parsed.blob_digests.iter().cloned().collect();
        let known_blobs =
            blobs::find_blobs_by_digests(&mut **tx, &candidate.account_name, &wanted_digests)
                .await?;
        let known_by_digest: HashMap<&str, i64> = known_blobs
            .iter()
            .map(|blob| (blob.digest.as_str(), blob.id))
            .collect();
        for digest in &parsed.blob_digests {
            if !known_by_digest.contains_key(digest.as_str()) {
                bail!("manifest references unknown blob {digest}");
            }
        }

        let wanted_ids: HashSet<i64> = known_by_digest.values().copied().collect();
        let stored_ids: HashSet<i64> = manifests::list_blob_refs(&mut **tx, repo_id, &manifest.digest)
            .await?
            .into_iter()
            .collect();
        for blob_id in wanted_ids.difference(&stored_ids) {
            manifests::insert_blob_ref(&mut **tx, repo_id, &manifest.digest, *blob_id).await?;
            blobs::ensure_blob_mount(&mut **tx, *blob_id, repo_id).await?;
        }
        for blob_id in stored_ids.difference(&wanted_ids) {
            manifests::delete_blob_ref(&mut **tx, repo_id, &manifest.digest, *blob_id).await?;
        }

        // restore the child manifest reference set
        for child in &parsed.child_digests {
            if manifests::get_manifest(&mut **tx, repo_id, child).await?.is_none() {
                bail!("manifest references unknown child manifest {child}");
            }
        }
        let stored_children: BTreeSet<String> =
            manifests::list_child_digests(&mut **tx, repo_id, &manifest.digest)
                .await?
                .into_iter()
                .collect();
        for child in parsed.child_digests.difference(&stored_children) {
            manifests::insert_manifest_ref(&mut **tx, repo_id, &manifest.digest, child).await?;
        }
        for child in stored_children.difference(&parsed.child_digests) {
            manifests::delete_manifest_ref(&mut **tx, repo_id, &manifest.digest, child).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Task for ManifestValidationTask {
    type Item = DueManifestValidation;

    fn desc(&self) -> &'static JobDesc {
        &MANIFEST_VALIDATION_DESC
    }

    async fn discover(&self) -> Result<Option<DueManifestValidation>, Error> {
        let now = self.janitor.clock().now();
        let mut tx = self.janitor.db().begin().await?;
        match manifests::claim_due_validation(&mut *tx, now).await? {
            Some(candidate) => Ok(Some(DueManifestValidation { tx, candidate })),
            None => Ok(None),
        }
    }

    async fn process(&self, item: DueManifestValidation) -> Result<(), Error> {
        let DueManifestValidation { mut tx, candidate } = item;
        let config = self.janitor.config();
        let clock = self.janitor.clock();
        let manifest = &candidate.manifest;

        match self.validate(&mut tx, &candidate).await {
            Ok(()) => {
                manifests::update_validation_result(
                    &mut *tx,
                    manifest.repo_id,
                    &manifest.digest,
                    "",
                    clock.next_run(config.manifest_validation_interval),
                )
                .await?;
                tx.commit().await?;
                if !manifest.validation_error_message.is_empty() {
                    log::info!(
                        "manifest {}/{}@{} validates again",
                        candidate.account_name,
                        candidate.repo_name,
                        manifest.digest,
                    );
                }
                Ok(())
            }
            Err(err) => {
                let message = format!("{err:#}");
                manifests::update_validation_result(
                    &mut *tx,
                    manifest.repo_id,
                    &manifest.digest,
                    &message,
                    clock.next_run(config.validation_retry_interval),
                )
                .await?;
                tx.commit().await?;
                bail!(
                    "validation of manifest {}/{}@{} failed: {message}",
                    candidate.account_name,
                    candidate.repo_name,
                    manifest.digest,
                );
            }
        }
    }
}
