//! In-progress blob uploads.

use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::DbError;

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct UploadRow {
    pub uuid: String,
    pub repo_id: i64,
    pub storage_id: String,
    /// Number of chunks written to storage so far. Zero means nothing has
    /// reached the storage driver yet.
    pub num_chunks: i32,
    pub size_bytes: i64,
    pub digest: String,
    pub updated_at: DateTime<Utc>,
}

/// Locks and returns the oldest upload that has been idle since before
/// `cutoff`. Runs inside the caller's transaction.
pub async fn claim_abandoned_upload(
    ex: impl PgExecutor<'_>,
    cutoff: DateTime<Utc>,
) -> Result<Option<UploadRow>, DbError> {
    let row = sqlx::query_as::<_, UploadRow>(
        "SELECT * FROM uploads \
         WHERE updated_at < $1 \
         ORDER BY updated_at ASC \
         LIMIT 1 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(cutoff)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn delete_upload(ex: impl PgExecutor<'_>, uuid: &str) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM uploads WHERE uuid = $1")
        .bind(uuid)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Storage IDs of in-flight uploads of the account. The storage sweeper
/// treats these as known so that half-written blobs survive.
pub async fn list_storage_ids(
    ex: impl PgExecutor<'_>,
    account_name: &str,
) -> Result<Vec<String>, DbError> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT u.storage_id FROM uploads u \
         JOIN repos r ON r.id = u.repo_id \
         WHERE r.account_name = $1",
    )
    .bind(account_name)
    .fetch_all(ex)
    .await?;
    Ok(ids)
}

pub async fn delete_uploads_of_account(
    ex: impl PgExecutor<'_>,
    account_name: &str,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "DELETE FROM uploads WHERE repo_id IN (SELECT id FROM repos WHERE account_name = $1)",
    )
    .bind(account_name)
    .execute(ex)
    .await?;
    Ok(result.rows_affected())
}
