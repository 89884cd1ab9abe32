//! Blob sweeping and blob validation.

use anyhow::{bail, Error};
use async_trait::async_trait;
use sqlx::postgres::Postgres;
use sqlx::Transaction;

use stevedore_api_types::Digest;
use stevedore_db::{accounts, blobs, AccountRow, BlobRow};

use crate::server::{Janitor, JobDesc, Task};
use crate::tools::to_chrono;

static BLOB_SWEEP_DESC: JobDesc = JobDesc {
    name: "blob sweep",
    counter_name: "stevedore_blob_sweeps",
    counter_help: "Counter for blob sweep operations.",
};

static BLOB_VALIDATION_DESC: JobDesc = JobDesc {
    name: "blob validation",
    counter_name: "stevedore_blob_validations",
    counter_help: "Counter for blob validation operations.",
};

pub struct DueBlobSweep {
    tx: Transaction<'static, Postgres>,
    account: AccountRow,
}

/// Staged sweep of unmounted blobs, one account at a time.
///
/// Mirrors the blob mount sweep one level down: a blob with no mount in
/// any repo of its account is marked, rescued if remounted, and deleted
/// once the mark expires. Database rows go first; the storage object is
/// deleted after commit, so a failed storage delete leaks an unreferenced
/// object that the storage sweeper will reclaim later.
pub struct BlobSweepTask {
    janitor: Janitor,
}

impl BlobSweepTask {
    pub fn new(janitor: Janitor) -> Self {
        Self { janitor }
    }
}

#[async_trait]
impl Task for BlobSweepTask {
    type Item = DueBlobSweep;

    fn desc(&self) -> &'static JobDesc {
        &BLOB_SWEEP_DESC
    }

    async fn discover(&self) -> Result<Option<DueBlobSweep>, Error> {
        let now = self.janitor.clock().now();
        let mut tx = self.janitor.db().begin().await?;
        match accounts::claim_due_blob_sweep(&mut *tx, now).await? {
            Some(account) => Ok(Some(DueBlobSweep { tx, account })),
            None => Ok(None),
        }
    }

    async fn process(&self, item: DueBlobSweep) -> Result<(), Error> {
        let DueBlobSweep { mut tx, account } = item;
        let config = self.janitor.config();
        let now = self.janitor.clock().now();
        let deadline = now + to_chrono(config.blob_sweep_grace);

        let marked = blobs::mark_unmounted_blobs(&mut *tx, &account.name, deadline).await?;
        let unmarked = blobs::unmark_remounted_blobs(&mut *tx, &account.name).await?;

        let doomed = blobs::list_doomed_blobs(&mut *tx, &account.name, now).await?;
        for blob in &doomed {
            blobs::delete_blob(&mut *tx, blob.id).await?;
        }

        accounts::reschedule_blob_sweep(
            &mut *tx,
            &account.name,
            self.janitor.clock().next_run(config.blob_sweep_interval),
        )
        .await?;
        tx.commit().await?;

        if marked > 0 || unmarked > 0 || !doomed.is_empty() {
            log::info!(
                "blob sweep in account {}: {marked} marked, {unmarked} unmarked, {} deleted",
                account.name,
                doomed.len(),
            );
        }

        // Rows are gone; now drop the bytes. Failures here only leak
        // unreferenced storage objects.
        let mut first_error = None;
        for blob in &doomed {
            if blob.storage_id.is_empty() {
                continue;
            }
            if let Err(err) = self
                .janitor
                .storage()
                .delete_blob(&account.name, &blob.storage_id)
                .await
            {
                log::warn!(
                    "cannot delete blob {} of account {} from storage: {err:#}",
                    blob.digest,
                    account.name,
                );
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct DueBlobValidation {
    tx: Transaction<'static, Postgres>,
    blob: BlobRow,
}

/// Periodic re-hash of stored blobs against their recorded digest.
pub struct BlobValidationTask {
    janitor: Janitor,
}

impl BlobValidationTask {
    pub fn new(janitor: Janitor) -> Self {
        Self { janitor }
    }
}

/// The actual check: recompute the digest over the stored bytes.
pub(crate) fn validate_blob_bytes(expected_digest: &str, bytes: &[u8]) -> Result<(), String> {
    let actual = Digest::of(bytes);
    if actual.as_str() != expected_digest {
        return Err(format!(
            "expected digest {expected_digest}, but got {actual}"
        ));
    }
    Ok(())
}

#[async_trait]
impl Task for BlobValidationTask {
    type Item = DueBlobValidation;

    fn desc(&self) -> &'static JobDesc {
        &BLOB_VALIDATION_DESC
    }

    async fn discover(&self) -> Result<Option<DueBlobValidation>, Error> {
        let now = self.janitor.clock().now();
        let mut tx = self.janitor.db().begin().await?;
        match blobs::claim_due_validation(&mut *tx, now).await? {
            Some(blob) => Ok(Some(DueBlobValidation { tx, blob })),
            None => Ok(None),
        }
    }

    async fn process(&self, item: DueBlobValidation) -> Result<(), Error> {
        let DueBlobValidation { mut tx, blob } = item;
        let config = self.janitor.config();
        let clock = self.janitor.clock();

        let outcome = match self
            .janitor
            .storage()
            .read_blob(&blob.account_name, &blob.storage_id)
            .await
        {
            Ok(bytes) => validate_blob_bytes(&blob.digest, &bytes),
            // a registered blob must be readable; treat failure to read
            // like a content mismatch
            Err(err) => Err(format!("cannot read blob from storage: {err:#}")),
        };

        match outcome {
            Ok(()) => {
                blobs::update_validation_result(
                    &mut *tx,
                    blob.id,
                    "",
                    clock.next_run(config.blob_validation_interval),
                )
                .await?;
                tx.commit().await?;
                if !blob.validation_error_message.is_empty() {
                    log::info!(
                        "blob {} in account {} validates again",
                        blob.digest,
                        blob.account_name,
                    );
                }
                Ok(())
            }
            Err(message) => {
                blobs::update_validation_result(
                    &mut *tx,
                    blob.id,
                    &message,
                    clock.next_run(config.validation_retry_interval),
                )
                .await?;
                tx.commit().await?;
                bail!(
                    "validation of blob {} in account {} failed: {message}",
                    blob.digest,
                    blob.account_name,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_bytes_validation() {
        let digest = Digest::of(b"layer data");
        assert_eq!(validate_blob_bytes(digest.as_str(), b"layer data"), Ok(()));

        let err = validate_blob_bytes(digest.as_str(), b"corrupted").unwrap_err();
        assert!(err.starts_with(&format!("expected digest {digest}, but got sha256:")));
    }
}
