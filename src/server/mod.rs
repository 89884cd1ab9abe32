//! The janitor service: job infrastructure and all reconciliation jobs.

use std::sync::Arc;

use anyhow::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use stevedore_client::{PeerConnector, ScannerApi};
use stevedore_db::Database;
use stevedore_storage::StorageDriver;

use crate::config::JanitorConfig;
use crate::drivers::{
    AccountManagementDriver, FederationDriver, InboundCacheDriver, TokenIssuer,
};
use crate::tools::Clock;

mod job;
pub use job::{JobDesc, JobMetrics, JobRunner, Outcome, Task};

mod accounts;
pub use accounts::{AccountDeletionTask, AccountEnforcementTask, FederationAnnouncementTask};

mod blob_mounts;
pub use blob_mounts::BlobMountSweepTask;

mod blobs;
pub use blobs::{BlobSweepTask, BlobValidationTask};

mod image_gc;
pub use image_gc::{evaluate_gc_policies, GcVerdict, ImageGcTask, ManifestGcInfo};

mod manifest_sync;
pub use manifest_sync::ManifestSyncTask;

mod manifests;
pub use manifests::ManifestValidationTask;

mod peers;
pub use peers::PeerRotationTask;

mod storage_sweep;
pub use storage_sweep::StorageSweepTask;

mod uploads;
pub use uploads::UploadCleanupTask;

mod vuln_check;
pub use vuln_check::VulnCheckTask;

/// Everything the janitor needs, assembled by the embedding process.
pub struct JanitorParts {
    pub config: JanitorConfig,
    pub clock: Clock,
    pub db: Database,
    pub storage: Arc<dyn StorageDriver>,
    pub federation: Arc<dyn FederationDriver>,
    pub account_management: Arc<dyn AccountManagementDriver>,
    pub inbound_cache: Arc<dyn InboundCacheDriver>,
    pub peer_connector: Arc<dyn PeerConnector>,
    pub scanner: Arc<dyn ScannerApi>,
    pub token_issuer: Arc<dyn TokenIssuer>,
    pub metrics: prometheus::Registry,
    /// Our own hostname as it appears in the peers tables of other
    /// registries.
    pub own_hostname: String,
}

/// Handle on the janitor. Cheap to clone; all clones share the same
/// dependencies.
#[derive(Clone)]
pub struct Janitor {
    parts: Arc<JanitorParts>,
}

impl Janitor {
    pub fn new(parts: JanitorParts) -> Self {
        Self {
            parts: Arc::new(parts),
        }
    }

    pub fn config(&self) -> &JanitorConfig {
        &self.parts.config
    }

    pub fn clock(&self) -> &Clock {
        &self.parts.clock
    }

    pub fn db(&self) -> &Database {
        &self.parts.db
    }

    pub fn storage(&self) -> &dyn StorageDriver {
        &*self.parts.storage
    }

    pub fn federation(&self) -> &dyn FederationDriver {
        &*self.parts.federation
    }

    pub fn account_management(&self) -> &dyn AccountManagementDriver {
        &*self.parts.account_management
    }

    pub fn inbound_cache(&self) -> &dyn InboundCacheDriver {
        &*self.parts.inbound_cache
    }

    pub fn peer_connector(&self) -> &dyn PeerConnector {
        &*self.parts.peer_connector
    }

    pub fn scanner(&self) -> &dyn ScannerApi {
        &*self.parts.scanner
    }

    pub fn token_issuer(&self) -> &dyn TokenIssuer {
        &*self.parts.token_issuer
    }

    pub fn metrics(&self) -> &prometheus::Registry {
        &self.parts.metrics
    }

    pub fn own_hostname(&self) -> &str {
        &self.parts.own_hostname
    }

    fn runner<T: Task>(&self, task: T) -> Result<JobRunner<T>, Error> {
        JobRunner::new(task, self.metrics(), self.config().idle_backoff)
    }

    pub fn upload_cleanup_job(&self) -> Result<JobRunner<UploadCleanupTask>, Error> {
        self.runner(UploadCleanupTask::new(self.clone()))
    }

    pub fn blob_mount_sweep_job(&self) -> Result<JobRunner<BlobMountSweepTask>, Error> {
        self.runner(BlobMountSweepTask::new(self.clone()))
    }

    pub fn blob_sweep_job(&self) -> Result<JobRunner<BlobSweepTask>, Error> {
        self.runner(BlobSweepTask::new(self.clone()))
    }

    pub fn blob_validation_job(&self) -> Result<JobRunner<BlobValidationTask>, Error> {
        self.runner(BlobValidationTask::new(self.clone()))
    }

    pub fn manifest_validation_job(&self) -> Result<JobRunner<ManifestValidationTask>, Error> {
        self.runner(ManifestValidationTask::new(self.clone()))
    }

    pub fn manifest_sync_job(&self) -> Result<JobRunner<ManifestSyncTask>, Error> {
        self.runner(ManifestSyncTask::new(self.clone()))
    }

    pub fn image_gc_job(&self) -> Result<JobRunner<ImageGcTask>, Error> {
        self.runner(ImageGcTask::new(self.clone()))
    }

    pub fn vuln_check_job(&self) -> Result<JobRunner<VulnCheckTask>, Error> {
        self.runner(VulnCheckTask::new(self.clone()))
    }

    pub fn storage_sweep_job(&self) -> Result<JobRunner<StorageSweepTask>, Error> {
        self.runner(StorageSweepTask::new(self.clone()))
    }

    pub fn account_enforcement_job(&self) -> Result<JobRunner<AccountEnforcementTask>, Error> {
        self.runner(AccountEnforcementTask::new(self.clone()))
    }

    pub fn account_deletion_job(&self) -> Result<JobRunner<AccountDeletionTask>, Error> {
        self.runner(AccountDeletionTask::new(self.clone()))
    }

    pub fn federation_announcement_job(
        &self,
    ) -> Result<JobRunner<FederationAnnouncementTask>, Error> {
        self.runner(FederationAnnouncementTask::new(self.clone()))
    }

    pub fn peer_rotation_job(&self) -> Result<JobRunner<PeerRotationTask>, Error> {
        self.runner(PeerRotationTask::new(self.clone()))
    }

    /// Runs all job loops until `shutdown` flips to true. Each loop gets
    /// `workers_per_job` concurrent workers; coordination between workers
    /// happens through database row locks, not in-process state.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let workers = self.config().workers_per_job;

        spawn_workers(self.upload_cleanup_job()?, workers, &shutdown, &mut handles);
        spawn_workers(self.blob_mount_sweep_job()?, workers, &shutdown, &mut handles);
        spawn_workers(self.blob_sweep_job()?, workers, &shutdown, &mut handles);
        spawn_workers(self.blob_validation_job()?, workers, &shutdown, &mut handles);
        spawn_workers(
            self.manifest_validation_job()?,
            workers,
            &shutdown,
            &mut handles,
        );
        spawn_workers(self.manifest_sync_job()?, workers, &shutdown, &mut handles);
        spawn_workers(self.image_gc_job()?, workers, &shutdown, &mut handles);
        spawn_workers(self.vuln_check_job()?, workers, &shutdown, &mut handles);
        spawn_workers(self.storage_sweep_job()?, workers, &shutdown, &mut handles);
        spawn_workers(
            self.account_enforcement_job()?,
            workers,
            &shutdown,
            &mut handles,
        );
        spawn_workers(self.account_deletion_job()?, workers, &shutdown, &mut handles);
        spawn_workers(
            self.federation_announcement_job()?,
            workers,
            &shutdown,
            &mut handles,
        );
        spawn_workers(self.peer_rotation_job()?, workers, &shutdown, &mut handles);

        for handle in handles {
            handle.await?;
        }
        Ok(())
    }
}

fn spawn_workers<T>(
    runner: JobRunner<T>,
    workers: usize,
    shutdown: &watch::Receiver<bool>,
    handles: &mut Vec<JoinHandle<()>>,
) where
    T: Task + 'static,
{
    let runner = Arc::new(runner);
    for _ in 0..workers.max(1) {
        let runner = Arc::clone(&runner);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            runner.run(shutdown).await;
        }));
    }
}
