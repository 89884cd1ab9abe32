//! Cleanup of abandoned blob uploads.

use anyhow::Error;
use async_trait::async_trait;
use sqlx::postgres::Postgres;
use sqlx::Transaction;

use stevedore_db::{repos, uploads, DbError, UploadRow};

use crate::server::{Janitor, JobDesc, Task};
use crate::tools::to_chrono;

static UPLOAD_CLEANUP_DESC: JobDesc = JobDesc {
    name: "abandoned upload cleanup",
    counter_name: "stevedore_abandoned_upload_cleanups",
    counter_help: "Counter for abandoned upload cleanup operations.",
};

pub struct AbandonedUpload {
    tx: Transaction<'static, Postgres>,
    upload: UploadRow,
}

/// Reaps uploads that have been idle for longer than the cutoff and
/// aborts their partial writes in storage.
pub struct UploadCleanupTask {
    janitor: Janitor,
}

impl UploadCleanupTask {
    pub fn new(janitor: Janitor) -> Self {
        Self { janitor }
    }
}

#[async_trait]
impl Task for UploadCleanupTask {
    type Item = AbandonedUpload;

    fn desc(&self) -> &'static JobDesc {
        &UPLOAD_CLEANUP_DESC
    }

    async fn discover(&self) -> Result<Option<AbandonedUpload>, Error> {
        let cutoff =
            self.janitor.clock().now() - to_chrono(self.janitor.config().upload_idle_cutoff);
        let mut tx = self.janitor.db().begin().await?;
        match uploads::claim_abandoned_upload(&mut *tx, cutoff).await? {
            Some(upload) => Ok(Some(AbandonedUpload { tx, upload })),
            None => Ok(None),
        }
    }

    async fn process(&self, item: AbandonedUpload) -> Result<(), Error> {
        let AbandonedUpload { mut tx, upload } = item;

        let repo = repos::get_repo(&mut *tx, upload.repo_id)
            .await?
            .ok_or(DbError::NotFound("repo of abandoned upload"))?;

        uploads::delete_upload(&mut *tx, &upload.uuid).await?;
        if upload.num_chunks > 0 {
            self.janitor
                .storage()
                .abort_blob_upload(&repo.account_name, &upload.storage_id, upload.num_chunks as u32)
                .await?;
        }
        tx.commit().await?;

        log::info!(
            "cleaned up abandoned upload {} in repo {} (idle since {})",
            upload.uuid,
            repo.full_name(),
            upload.updated_at,
        );
        Ok(())
    }
}
