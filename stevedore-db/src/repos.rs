//! Repository rows and the per-repo job schedules.

use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::DbError;

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct RepoRow {
    pub id: i64,
    pub account_name: String,
    pub name: String,
    pub next_blob_mount_sweep_at: Option<DateTime<Utc>>,
    pub next_manifest_sync_at: Option<DateTime<Utc>>,
    pub next_gc_at: Option<DateTime<Utc>>,
}

impl RepoRow {
    /// `account/name`, the form that appears in image references.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.account_name, self.name)
    }
}

pub async fn get_repo(ex: impl PgExecutor<'_>, id: i64) -> Result<Option<RepoRow>, DbError> {
    let row = sqlx::query_as::<_, RepoRow>("SELECT * FROM repos WHERE id = $1")
        .bind(id)
        .fetch_optional(ex)
        .await?;
    Ok(row)
}

pub async fn list_repos_of_account(
    ex: impl PgExecutor<'_>,
    account_name: &str,
) -> Result<Vec<RepoRow>, DbError> {
    let rows =
        sqlx::query_as::<_, RepoRow>("SELECT * FROM repos WHERE account_name = $1 ORDER BY name")
            .bind(account_name)
            .fetch_all(ex)
            .await?;
    Ok(rows)
}

/// Locks and returns the next repo due for a blob mount sweep.
///
/// Repos containing a manifest with a pending validation error are
/// excluded: an unvalidated manifest cannot be trusted to enumerate its
/// blob references, so sweeping its mounts could destroy data.
pub async fn claim_due_blob_mount_sweep(
    ex: impl PgExecutor<'_>,
    now: DateTime<Utc>,
) -> Result<Option<RepoRow>, DbError> {
    let row = sqlx::query_as::<_, RepoRow>(
        "SELECT * FROM repos r \
         WHERE (r.next_blob_mount_sweep_at IS NULL OR r.next_blob_mount_sweep_at < $1) \
           AND NOT EXISTS (\
               SELECT 1 FROM manifests m \
               WHERE m.repo_id = r.id AND m.validation_error_message != ''\
           ) \
         ORDER BY r.next_blob_mount_sweep_at ASC NULLS FIRST \
         LIMIT 1 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(now)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn reschedule_blob_mount_sweep(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    next: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query("UPDATE repos SET next_blob_mount_sweep_at = $2 WHERE id = $1")
        .bind(repo_id)
        .bind(next)
        .execute(ex)
        .await?;
    Ok(())
}

/// Claims the next repo due for garbage collection by advancing its
/// schedule atomically.
pub async fn claim_due_gc(
    ex: impl PgExecutor<'_>,
    now: DateTime<Utc>,
    next: DateTime<Utc>,
) -> Result<Option<RepoRow>, DbError> {
    let row = sqlx::query_as::<_, RepoRow>(
        "UPDATE repos SET next_gc_at = $2 \
         WHERE id IN (\
             SELECT id FROM repos \
             WHERE next_gc_at IS NULL OR next_gc_at < $1 \
             ORDER BY next_gc_at ASC NULLS FIRST \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED\
         ) \
         RETURNING *",
    )
    .bind(now)
    .bind(next)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

/// Claims the next repo of a replica account that is due for a manifest
/// sync. Accounts already being deleted are skipped.
pub async fn claim_due_manifest_sync(
    ex: impl PgExecutor<'_>,
    now: DateTime<Utc>,
    next: DateTime<Utc>,
) -> Result<Option<RepoRow>, DbError> {
    let row = sqlx::query_as::<_, RepoRow>(
        "UPDATE repos SET next_manifest_sync_at = $2 \
         WHERE id IN (\
             SELECT r.id FROM repos r \
             JOIN accounts a ON a.name = r.account_name \
             WHERE (r.next_manifest_sync_at IS NULL OR r.next_manifest_sync_at < $1) \
               AND (a.upstream_peer_hostname IS NOT NULL OR a.external_peer_url IS NOT NULL) \
               AND NOT a.is_deleting \
             ORDER BY r.next_manifest_sync_at ASC NULLS FIRST \
             LIMIT 1 \
             FOR UPDATE OF r SKIP LOCKED\
         ) \
         RETURNING *",
    )
    .bind(now)
    .bind(next)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn delete_repo(ex: impl PgExecutor<'_>, repo_id: i64) -> Result<(), DbError> {
    sqlx::query("DELETE FROM repos WHERE id = $1")
        .bind(repo_id)
        .execute(ex)
        .await?;
    Ok(())
}
