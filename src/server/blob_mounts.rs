//! Staged sweep of blob mounts, one repo at a time.
//!
//! A mount is garbage once no manifest of its repo references the blob
//! anymore. The mark pass flags such mounts, the unmark pass rescues any
//! that regained a reference, and the sweep pass deletes flags older than
//! the grace period. A pusher who has mounted a blob but not yet pushed
//! the referencing manifest therefore has a full grace period to finish.

use anyhow::Error;
use async_trait::async_trait;
use sqlx::postgres::Postgres;
use sqlx::Transaction;

use stevedore_db::{blobs, repos, RepoRow};

use crate::server::{Janitor, JobDesc, Task};
use crate::tools::to_chrono;

static BLOB_MOUNT_SWEEP_DESC: JobDesc = JobDesc {
    name: "blob mount sweep",
    counter_name: "stevedore_blob_mount_sweeps",
    counter_help: "Counter for blob mount sweep operations.",
};

pub struct DueMountSweep {
    tx: Transaction<'static, Postgres>,
    repo: RepoRow,
}

pub struct BlobMountSweepTask {
    janitor: Janitor,
}

impl BlobMountSweepTask {
    pub fn new(janitor: Janitor) -> Self {
        Self { janitor }
    }
}

#[async_trait]
impl Task for BlobMountSweepTask {
    type Item = DueMountSweep;

    fn desc(&self) -> &'static JobDesc {
        &BLOB_MOUNT_SWEEP_DESC
    }

    async fn discover(&self) -> Result<Option<DueMountSweep>, Error> {
        let now = self.janitor.clock().now();
        let mut tx = self.janitor.db().begin().await?;
        match repos::claim_due_blob_mount_sweep(&mut *tx, now).await? {
            Some(repo) => Ok(Some(DueMountSweep { tx, repo })),
            None => Ok(None),
        }
    }

    async fn process(&self, item: DueMountSweep) -> Result<(), Error> {
        let DueMountSweep { mut tx, repo } = item;
        let config = self.janitor.config();
        let now = self.janitor.clock().now();
        let deadline = now + to_chrono(config.mount_sweep_grace);

        let marked = blobs::mark_unreferenced_mounts(&mut *tx, repo.id, deadline).await?;
        let unmarked = blobs::unmark_referenced_mounts(&mut *tx, repo.id).await?;
        let swept = blobs::sweep_marked_mounts(&mut *tx, repo.id, now).await?;

        repos::reschedule_blob_mount_sweep(
            &mut *tx,
            repo.id,
            self.janitor.clock().next_run(config.blob_mount_sweep_interval),
        )
        .await?;
        tx.commit().await?;

        if marked > 0 || unmarked > 0 || swept > 0 {
            log::info!(
                "blob mount sweep in repo {}: {marked} marked, {unmarked} unmarked, {swept} deleted",
                repo.full_name(),
            );
        }
        Ok(())
    }
}
