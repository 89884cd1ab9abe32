//! In-memory storage backend.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{bail, Error};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::{
    StorageContents, StorageDriver, StoredBlobInfo, StoredManifestInfo, StoredReportInfo,
};

#[derive(Default)]
struct BlobObject {
    chunks: BTreeMap<u32, Bytes>,
    finalized: Option<Bytes>,
}

#[derive(Default)]
struct AccountObjects {
    // keyed by storage_id
    blobs: BTreeMap<String, BlobObject>,
    // keyed by (repo_name, digest)
    manifests: BTreeMap<(String, String), Bytes>,
    // keyed by (repo_name, digest, format)
    trivy_reports: BTreeMap<(String, String, String), Bytes>,
}

/// Keeps everything in process memory. This is the driver the test suites
/// run against; it lives here rather than under `#[cfg(test)]` because the
/// janitor's own tests need it too.
#[derive(Default)]
pub struct InMemoryDriver {
    accounts: Mutex<BTreeMap<String, AccountObjects>>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_account<R>(&self, account: &str, f: impl FnOnce(&mut AccountObjects) -> R) -> R {
        let mut accounts = self.accounts.lock().unwrap();
        f(accounts.entry(account.to_string()).or_default())
    }

    /// Test helper: number of finalized blobs across all accounts.
    pub fn blob_count(&self) -> usize {
        let accounts = self.accounts.lock().unwrap();
        accounts
            .values()
            .map(|objs| {
                objs.blobs
                    .values()
                    .filter(|b| b.finalized.is_some())
                    .count()
            })
            .sum()
    }
}

#[async_trait]
impl StorageDriver for InMemoryDriver {
    async fn append_to_blob(
        &self,
        account: &str,
        storage_id: &str,
        chunk_number: u32,
        _chunk_len: Option<u64>,
        chunk: Bytes,
    ) -> Result<(), Error> {
        self.with_account(account, |objs| {
            let blob = objs.blobs.entry(storage_id.to_string()).or_default();
            if blob.finalized.is_some() {
                bail!("blob {storage_id} is already finalized");
            }
            if blob.chunks.insert(chunk_number, chunk).is_some() {
                bail!("chunk {chunk_number} of blob {storage_id} was already written");
            }
            Ok(())
        })
    }

    async fn finalize_blob(
        &self,
        account: &str,
        storage_id: &str,
        chunk_count: u32,
    ) -> Result<(), Error> {
        self.with_account(account, |objs| {
            let blob = match objs.blobs.get_mut(storage_id) {
                Some(blob) => blob,
                None => bail!("no such blob upload: {storage_id}"),
            };
            if blob.finalized.is_some() {
                bail!("blob {storage_id} is already finalized");
            }
            let mut buf = BytesMut::new();
            for number in 1..=chunk_count {
                match blob.chunks.remove(&number) {
                    Some(chunk) => buf.extend_from_slice(&chunk),
                    None => bail!("blob {storage_id} is missing chunk {number}"),
                }
            }
            blob.finalized = Some(buf.freeze());
            Ok(())
        })
    }

    async fn abort_blob_upload(
        &self,
        account: &str,
        storage_id: &str,
        _chunk_count: u32,
    ) -> Result<(), Error> {
        self.with_account(account, |objs| {
            objs.blobs.remove(storage_id);
            Ok(())
        })
    }

    async fn read_blob(&self, account: &str, storage_id: &str) -> Result<Bytes, Error> {
        self.with_account(account, |objs| {
            match objs.blobs.get(storage_id).and_then(|b| b.finalized.clone()) {
                Some(bytes) => Ok(bytes),
                None => bail!("no such blob: {storage_id}"),
            }
        })
    }

    async fn delete_blob(&self, account: &str, storage_id: &str) -> Result<(), Error> {
        self.with_account(account, |objs| {
            match objs.blobs.remove(storage_id) {
                Some(_) => Ok(()),
                None => bail!("no such blob: {storage_id}"),
            }
        })
    }

    async fn read_manifest(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<Bytes, Error> {
        self.with_account(account, |objs| {
            let key = (repo_name.to_string(), digest.to_string());
            match objs.manifests.get(&key) {
                Some(bytes) => Ok(bytes.clone()),
                None => bail!("no such manifest: {repo_name}@{digest}"),
            }
        })
    }

    async fn write_manifest(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        contents: Bytes,
    ) -> Result<(), Error> {
        self.with_account(account, |objs| {
            let key = (repo_name.to_string(), digest.to_string());
            objs.manifests.insert(key, contents);
            Ok(())
        })
    }

    async fn delete_manifest(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
    ) -> Result<(), Error> {
        self.with_account(account, |objs| {
            let key = (repo_name.to_string(), digest.to_string());
            match objs.manifests.remove(&key) {
                Some(_) => Ok(()),
                None => bail!("no such manifest: {repo_name}@{digest}"),
            }
        })
    }

    async fn write_trivy_report(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        format: &str,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.with_account(account, |objs| {
            let key = (repo_name.to_string(), digest.to_string(), format.to_string());
            objs.trivy_reports.insert(key, payload);
            Ok(())
        })
    }

    async fn delete_trivy_report(
        &self,
        account: &str,
        repo_name: &str,
        digest: &str,
        format: &str,
    ) -> Result<(), Error> {
        self.with_account(account, |objs| {
            let key = (repo_name.to_string(), digest.to_string(), format.to_string());
            match objs.trivy_reports.remove(&key) {
                Some(_) => Ok(()),
                None => bail!("no such trivy report: {repo_name}@{digest} ({format})"),
            }
        })
    }

    async fn list_storage_contents(&self, account: &str) -> Result<StorageContents, Error> {
        self.with_account(account, |objs| {
            Ok(StorageContents {
                blobs: objs
                    .blobs
                    .iter()
                    .map(|(storage_id, blob)| StoredBlobInfo {
                        storage_id: storage_id.clone(),
                        chunk_count: if blob.finalized.is_some() {
                            0
                        } else {
                            blob.chunks.len() as u32
                        },
                    })
                    .collect(),
                manifests: objs
                    .manifests
                    .keys()
                    .map(|(repo_name, digest)| StoredManifestInfo {
                        repo_name: repo_name.clone(),
                        digest: digest.clone(),
                    })
                    .collect(),
                trivy_reports: objs
                    .trivy_reports
                    .keys()
                    .map(|(repo_name, digest, format)| StoredReportInfo {
                        repo_name: repo_name.clone(),
                        digest: digest.clone(),
                        format: format.clone(),
                    })
                    .collect(),
            })
        })
    }

    async fn cleanup_account(&self, account: &str) -> Result<(), Error> {
        let mut accounts = self.accounts.lock().unwrap();
        accounts.remove(account);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blob_upload_lifecycle() -> Result<(), Error> {
        let driver = InMemoryDriver::new();

        driver
            .append_to_blob("acct", "sid-1", 1, None, Bytes::from_static(b"hello "))
            .await?;
        driver
            .append_to_blob("acct", "sid-1", 2, None, Bytes::from_static(b"world"))
            .await?;

        // unfinalized uploads are listed with their chunk count
        let contents = driver.list_storage_contents("acct").await?;
        assert_eq!(contents.blobs.len(), 1);
        assert_eq!(contents.blobs[0].chunk_count, 2);

        driver.finalize_blob("acct", "sid-1", 2).await?;
        assert_eq!(
            driver.read_blob("acct", "sid-1").await?,
            Bytes::from_static(b"hello world"),
        );

        let contents = driver.list_storage_contents("acct").await?;
        assert_eq!(contents.blobs[0].chunk_count, 0);

        driver.delete_blob("acct", "sid-1").await?;
        assert!(driver.read_blob("acct", "sid-1").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn finalize_with_missing_chunk_fails() -> Result<(), Error> {
        let driver = InMemoryDriver::new();
        driver
            .append_to_blob("acct", "sid-1", 1, None, Bytes::from_static(b"a"))
            .await?;
        driver
            .append_to_blob("acct", "sid-1", 3, None, Bytes::from_static(b"c"))
            .await?;
        assert!(driver.finalize_blob("acct", "sid-1", 3).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn abort_removes_chunks() -> Result<(), Error> {
        let driver = InMemoryDriver::new();
        driver
            .append_to_blob("acct", "sid-1", 1, None, Bytes::from_static(b"a"))
            .await?;
        driver.abort_blob_upload("acct", "sid-1", 1).await?;
        let contents = driver.list_storage_contents("acct").await?;
        assert!(contents.blobs.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn manifests_and_reports() -> Result<(), Error> {
        let driver = InMemoryDriver::new();
        driver
            .write_manifest("acct", "foo", "sha256:abc", Bytes::from_static(b"{}"))
            .await?;
        driver
            .write_trivy_report("acct", "foo", "sha256:abc", "json", Bytes::from_static(b"{}"))
            .await?;

        let contents = driver.list_storage_contents("acct").await?;
        assert_eq!(contents.manifests.len(), 1);
        assert_eq!(contents.trivy_reports.len(), 1);
        assert_eq!(contents.trivy_reports[0].format, "json");

        driver.delete_manifest("acct", "foo", "sha256:abc").await?;
        assert!(driver.delete_manifest("acct", "foo", "sha256:abc").await.is_err());

        driver.cleanup_account("acct").await?;
        let contents = driver.list_storage_contents("acct").await?;
        assert!(contents.trivy_reports.is_empty());
        Ok(())
    }
}
