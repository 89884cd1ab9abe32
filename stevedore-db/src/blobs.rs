//! Blob rows, blob mounts, and the staged GC queries for both.

use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::DbError;

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct BlobRow {
    pub id: i64,
    pub account_name: String,
    pub digest: String,
    pub size_bytes: i64,
    /// Opaque key into the storage driver. Empty for blobs that are known
    /// from replication but whose bytes were never fetched.
    pub storage_id: String,
    pub pushed_at: DateTime<Utc>,
    pub next_validation_at: DateTime<Utc>,
    pub validation_error_message: String,
    /// Set by the mark pass of the blob sweeper; cleared when the blob is
    /// mounted again before the mark expires.
    pub can_be_deleted_at: Option<DateTime<Utc>>,
    pub blocks_vuln_scanning: bool,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct BlobMountRow {
    pub blob_id: i64,
    pub repo_id: i64,
    pub can_be_deleted_at: Option<DateTime<Utc>>,
}

/// Mark pass of the blob sweeper: flags blobs of the account that are not
/// mounted into any of its repos. Returns the number of marked rows.
pub async fn mark_unmounted_blobs(
    ex: impl PgExecutor<'_>,
    account_name: &str,
    deadline: DateTime<Utc>,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "UPDATE blobs SET can_be_deleted_at = $2 \
         WHERE account_name = $1 AND can_be_deleted_at IS NULL AND id NOT IN (\
             SELECT bm.blob_id FROM blob_mounts bm \
             JOIN repos r ON r.id = bm.repo_id \
             WHERE r.account_name = $1\
         )",
    )
    .bind(account_name)
    .bind(deadline)
    .execute(ex)
    .await?;
    Ok(result.rows_affected())
}

/// Unmark pass: clears the mark on blobs that have been mounted again.
pub async fn unmark_remounted_blobs(
    ex: impl PgExecutor<'_>,
    account_name: &str,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "UPDATE blobs SET can_be_deleted_at = NULL \
         WHERE account_name = $1 AND can_be_deleted_at IS NOT NULL AND id IN (\
             SELECT bm.blob_id FROM blob_mounts bm \
             JOIN repos r ON r.id = bm.repo_id \
             WHERE r.account_name = $1\
         )",
    )
    .bind(account_name)
    .execute(ex)
    .await?;
    Ok(result.rows_affected())
}

/// Sweep pass: blobs whose mark has expired.
pub async fn list_doomed_blobs(
    ex: impl PgExecutor<'_>,
    account_name: &str,
    now: DateTime<Utc>,
) -> Result<Vec<BlobRow>, DbError> {
    let rows = sqlx::query_as::<_, BlobRow>(
        "SELECT * FROM blobs \
         WHERE account_name = $1 AND can_be_deleted_at < $2 \
         ORDER BY id",
    )
    .bind(account_name)
    .bind(now)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

pub async fn delete_blob(ex: impl PgExecutor<'_>, blob_id: i64) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM blobs WHERE id = $1")
        .bind(blob_id)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Marks every blob of the account as immediately deletable. Used by the
/// account deleter once no repo is left.
pub async fn mark_all_blobs_for_deletion(
    ex: impl PgExecutor<'_>,
    account_name: &str,
    now: DateTime<Utc>,
) -> Result<u64, DbError> {
    let result = sqlx::query("UPDATE blobs SET can_be_deleted_at = $2 WHERE account_name = $1")
        .bind(account_name)
        .bind(now)
        .execute(ex)
        .await?;
    Ok(result.rows_affected())
}

pub async fn count_blobs_in_account(
    ex: impl PgExecutor<'_>,
    account_name: &str,
) -> Result<i64, DbError> {
    let count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM blobs WHERE account_name = $1")
            .bind(account_name)
            .fetch_one(ex)
            .await?;
    Ok(count)
}

/// Resolves digests to blob rows within one account. Digests unknown to
/// the account are simply absent from the result.
pub async fn find_blobs_by_digests(
    ex: impl PgExecutor<'_>,
    account_name: &str,
    digests: &[String],
) -> Result<Vec<BlobRow>, DbError> {
    let rows = sqlx::query_as::<_, BlobRow>(
        "SELECT * FROM blobs WHERE account_name = $1 AND digest = ANY($2)",
    )
    .bind(account_name)
    .bind(digests)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

/// Locks and returns the next blob due for validation. Blobs that already
/// carry a validation error are retried before healthy ones. Unbacked
/// blobs (empty `storage_id`) have no bytes to validate and are skipped.
pub async fn claim_due_validation(
    ex: impl PgExecutor<'_>,
    now: DateTime<Utc>,
) -> Result<Option<BlobRow>, DbError> {
    let row = sqlx::query_as::<_, BlobRow>(
        "SELECT * FROM blobs \
         WHERE next_validation_at < $1 AND storage_id != '' \
         ORDER BY (validation_error_message = '') ASC, next_validation_at ASC \
         LIMIT 1 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(now)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn update_validation_result(
    ex: impl PgExecutor<'_>,
    blob_id: i64,
    error_message: &str,
    next_validation_at: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE blobs SET validation_error_message = $2, next_validation_at = $3 WHERE id = $1",
    )
    .bind(blob_id)
    .bind(error_message)
    .bind(next_validation_at)
    .execute(ex)
    .await?;
    Ok(())
}

/// Storage IDs of all backed blobs of the account, for the storage
/// sweeper's "known" set.
pub async fn list_storage_ids(
    ex: impl PgExecutor<'_>,
    account_name: &str,
) -> Result<Vec<String>, DbError> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT storage_id FROM blobs WHERE account_name = $1 AND storage_id != ''",
    )
    .bind(account_name)
    .fetch_all(ex)
    .await?;
    Ok(ids)
}

/// Makes sure a mount row exists and is not marked for deletion. Used by
/// the manifest validator when it restores a missing blob reference, so
/// that the referenced blob cannot be swept.
pub async fn ensure_blob_mount(
    ex: impl PgExecutor<'_>,
    blob_id: i64,
    repo_id: i64,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO blob_mounts (blob_id, repo_id) VALUES ($1, $2) \
         ON CONFLICT (blob_id, repo_id) DO UPDATE SET can_be_deleted_at = NULL",
    )
    .bind(blob_id)
    .bind(repo_id)
    .execute(ex)
    .await?;
    Ok(())
}

/// Mark pass of the blob mount sweeper: flags mounts in the repo whose
/// blob is not referenced by any manifest of the repo.
pub async fn mark_unreferenced_mounts(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    deadline: DateTime<Utc>,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "UPDATE blob_mounts SET can_be_deleted_at = $2 \
         WHERE repo_id = $1 AND can_be_deleted_at IS NULL AND blob_id NOT IN (\
             SELECT blob_id FROM manifest_blob_refs WHERE repo_id = $1\
         )",
    )
    .bind(repo_id)
    .bind(deadline)
    .execute(ex)
    .await?;
    Ok(result.rows_affected())
}

pub async fn unmark_referenced_mounts(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "UPDATE blob_mounts SET can_be_deleted_at = NULL \
         WHERE repo_id = $1 AND can_be_deleted_at IS NOT NULL AND blob_id IN (\
             SELECT blob_id FROM manifest_blob_refs WHERE repo_id = $1\
         )",
    )
    .bind(repo_id)
    .execute(ex)
    .await?;
    Ok(result.rows_affected())
}

pub async fn sweep_marked_mounts(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    now: DateTime<Utc>,
) -> Result<u64, DbError> {
    let result =
        sqlx::query("DELETE FROM blob_mounts WHERE repo_id = $1 AND can_be_deleted_at < $2")
            .bind(repo_id)
            .bind(now)
            .execute(ex)
            .await?;
    Ok(result.rows_affected())
}

pub async fn delete_mounts_of_account(
    ex: impl PgExecutor<'_>,
    account_name: &str,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "DELETE FROM blob_mounts WHERE repo_id IN (SELECT id FROM repos WHERE account_name = $1)",
    )
    .bind(account_name)
    .execute(ex)
    .await?;
    Ok(result.rows_affected())
}
