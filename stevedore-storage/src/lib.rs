//! Storage driver contract for blob, manifest and report payloads.
//!
//! The database is the source of truth; drivers only hold bytes. The
//! janitor therefore treats storage as reconcilable state: it may contain
//! more than the database knows about, and the storage sweeper brings the
//! two back in line.
//!
//! Production deployments use the S3 or filesystem driver; those live in
//! their own crates. The in-memory driver in this crate backs the test
//! suites.

use anyhow::Error;
use async_trait::async_trait;
use bytes::Bytes;

mod inmemory;
pub use inmemory::InMemoryDriver;

/// A blob as reported by [StorageDriver::list_storage_contents].
///
/// `chunk_count > 0` means the blob upload was never finalized and the
/// object consists of loose chunks.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StoredBlobInfo {
    pub storage_id: String,
    pub chunk_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StoredManifestInfo {
    pub repo_name: String,
    pub digest: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StoredReportInfo {
    pub repo_name: String,
    pub digest: String,
    pub format: String,
}

/// Everything a driver holds for one account.
#[derive(Clone, Debug, Default)]
pub struct StorageContents {
    pub blobs: Vec<StoredBlobInfo>,
    pub manifests: Vec<StoredManifestInfo>,
    pub trivy_reports: Vec<StoredReportInfo>,
}

/// Contract between the registry core and a storage backend.
///
/// All methods take the account name first; drivers namespace their
/// objects per account so that [StorageDriver::cleanup_account] can drop
/// everything at once. Implementations must be safe for concurrent use.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Appends one chunk to a blob upload. Chunks are numbered from 1.
    /// `chunk_len` is a size hint for drivers that need it upfront.
    async fn append_to_blob(
        &self,
        account: &str,
        storage_id: &str,
        chunk_number: u32,
        chunk_len: Option<u64>,
        chunk: Bytes,
    ) -> Result<(), Error>;

    /// Assembles all chunks of an upload into the final blob object.
    async fn finalize_blob(
        &self,
        account: &str,
        storage_id: &str,
        chunk_count: u32,
    ) -> Result<(), Error>;

    /// Removes the chunks of an unfinished upload.
    async fn abort_blob_upload(
        &self,
        account: &str,
        storage_id: &str,
        chunk_count: u32,
    ) -> Result<(), Error>;

    async fn read_blob(&self, account: &str, storage_id: &str) -> Result<Bytes, Error>;

    async fn delete_blob(&self, account: &str, storage_id: &str) -> Result<(), Error>;

    async fn read_manifest(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<Bytes, Error>;

    async fn write_manifest(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        contents: Bytes,
    ) -> Result<(), Error>;

    async fn delete_manifest(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<(), Error>;

    async fn write_trivy_report(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        format: &str,
        payload: Bytes,
    ) -> Result<(), Error>;

    async fn delete_trivy_report(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        format: &str,
    ) -> Result<(), Error>;

    /// Enumerates every object the driver holds for the account. The
    /// storage sweeper reconciles this inventory against the database.
    async fn list_storage_contents(&self, account: &str) -> Result<StorageContents, Error>;

    /// Drops whatever is left for the account. Called as the final step of
    /// account deletion, after all individual objects have been removed.
    async fn cleanup_account(&self, account: &str) -> Result<(), Error>;
}
