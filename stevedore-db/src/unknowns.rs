//! Marker rows for storage objects with no database referent.
//!
//! The storage sweeper records every object it cannot attribute to a row
//! in one of the `unknown_*` tables and only deletes the object once the
//! marker has aged past its grace period. An object that gains a referent
//! in the meantime has its marker removed instead.

use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::DbError;

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct UnknownBlobRow {
    pub account_name: String,
    pub storage_id: String,
    pub can_be_deleted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct UnknownManifestRow {
    pub account_name: String,
    pub repo_name: String,
    pub digest: String,
    pub can_be_deleted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct UnknownTrivyReportRow {
    pub account_name: String,
    pub repo_name: String,
    pub digest: String,
    pub format: String,
    pub can_be_deleted_at: DateTime<Utc>,
}

pub async fn list_unknown_blobs(
    ex: impl PgExecutor<'_>,
    account_name: &str,
) -> Result<Vec<UnknownBlobRow>, DbError> {
    let rows = sqlx::query_as::<_, UnknownBlobRow>(
        "SELECT * FROM unknown_blobs WHERE account_name = $1",
    )
    .bind(account_name)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

pub async fn insert_unknown_blob(
    ex: impl PgExecutor<'_>,
    account_name: &str,
    storage_id: &str,
    can_be_deleted_at: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO unknown_blobs (account_name, storage_id, can_be_deleted_at) \
         VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
    )
    .bind(account_name)
    .bind(storage_id)
    .bind(can_be_deleted_at)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn delete_unknown_blob(
    ex: impl PgExecutor<'_>,
    account_name: &str,
    storage_id: &str,
) -> Result<(), DbError> {
    sqlx::query("DELETE FROM unknown_blobs WHERE account_name = $1 AND storage_id = $2")
        .bind(account_name)
        .bind(storage_id)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn list_unknown_manifests(
    ex: impl PgExecutor<'_>,
    account_name: &str,
) -> Result<Vec<UnknownManifestRow>, DbError> {
    let rows = sqlx::query_as::<_, UnknownManifestRow>(
        "SELECT * FROM unknown_manifests WHERE account_name = $1",
    )
    .bind(account_name)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

pub async fn insert_unknown_manifest(
    ex: impl PgExecutor<'_>,
    account_name: &str,
    repo_name: &str,
    digest: &str,
    can_be_deleted_at: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO unknown_manifests (account_name, repo_name, digest, can_be_deleted_at) \
         VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
    )
    .bind(account_name)
    .bind(repo_name)
    .bind(digest)
    .bind(can_be_deleted_at)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn delete_unknown_manifest(
    ex: impl PgExecutor<'_>,
    account_name: &str,
    repo_name: &str,
    digest: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "DELETE FROM unknown_manifests \
         WHERE account_name = $1 AND repo_name = $2 AND digest = $3",
    )
    .bind(account_name)
    .bind(repo_name)
    .bind(digest)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn list_unknown_trivy_reports(
    ex: impl PgExecutor<'_>,
    account_name: &str,
) -> Result<Vec<UnknownTrivyReportRow>, DbError> {
    let rows = sqlx::query_as::<_, UnknownTrivyReportRow>(
        "SELECT * FROM unknown_trivy_reports WHERE account_name = $1",
    )
    .bind(account_name)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

pub async fn insert_unknown_trivy_report(
    ex: impl PgExecutor<'_>,
    account_name: &str,
    repo_name: &str,
    digest: &str,
    format: &str,
    can_be_deleted_at: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO unknown_trivy_reports \
             (account_name, repo_name, digest, format, can_be_deleted_at) \
         VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
    )
    .bind(account_name)
    .bind(repo_name)
    .bind(digest)
    .bind(format)
    .bind(can_be_deleted_at)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn delete_unknown_trivy_report(
    ex: impl PgExecutor<'_>,
    account_name: &str,
    repo_name: &str,
    digest: &str,
    format: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "DELETE FROM unknown_trivy_reports \
         WHERE account_name = $1 AND repo_name = $2 AND digest = $3 AND format = $4",
    )
    .bind(account_name)
    .bind(repo_name)
    .bind(digest)
    .bind(format)
    .execute(ex)
    .await?;
    Ok(())
}

/// Drops all markers of the account in one go, as part of account
/// deletion.
pub async fn delete_all_for_account(
    ex: &mut sqlx::postgres::PgConnection,
    account_name: &str,
) -> Result<(), DbError> {
    sqlx::query("DELETE FROM unknown_blobs WHERE account_name = $1")
        .bind(account_name)
        .execute(&mut *ex)
        .await?;
    sqlx::query("DELETE FROM unknown_manifests WHERE account_name = $1")
        .bind(account_name)
        .execute(&mut *ex)
        .await?;
    sqlx::query("DELETE FROM unknown_trivy_reports WHERE account_name = $1")
        .bind(account_name)
        .execute(&mut *ex)
        .await?;
    Ok(())
}
