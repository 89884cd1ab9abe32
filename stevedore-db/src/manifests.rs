//! Manifest rows with their contents, reference sets and tags.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgConnection;
use sqlx::PgExecutor;

use crate::DbError;

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ManifestRow {
    pub repo_id: i64,
    pub digest: String,
    pub media_type: String,
    pub size_bytes: i64,
    pub pushed_at: DateTime<Utc>,
    pub last_pulled_at: Option<DateTime<Utc>>,
    pub next_validation_at: DateTime<Utc>,
    pub validation_error_message: String,
    pub gc_status_json: String,
}

/// A manifest row joined with the names needed to address its bytes in
/// storage.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ManifestWithRepo {
    #[sqlx(flatten)]
    pub manifest: ManifestRow,
    pub account_name: String,
    pub repo_name: String,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct TagRow {
    pub repo_id: i64,
    pub name: String,
    pub digest: String,
    pub pushed_at: DateTime<Utc>,
    pub last_pulled_at: Option<DateTime<Utc>>,
}

pub async fn list_manifests_of_repo(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
) -> Result<Vec<ManifestRow>, DbError> {
    let rows = sqlx::query_as::<_, ManifestRow>(
        "SELECT * FROM manifests WHERE repo_id = $1 ORDER BY digest",
    )
    .bind(repo_id)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

pub async fn get_manifest(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    digest: &str,
) -> Result<Option<ManifestRow>, DbError> {
    let row = sqlx::query_as::<_, ManifestRow>(
        "SELECT * FROM manifests WHERE repo_id = $1 AND digest = $2",
    )
    .bind(repo_id)
    .bind(digest)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

/// Locks and returns the next manifest due for validation, together with
/// its repo coordinates. Manifests with a pending validation error are
/// retried first.
pub async fn claim_due_validation(
    ex: impl PgExecutor<'_>,
    now: DateTime<Utc>,
) -> Result<Option<ManifestWithRepo>, DbError> {
    let row = sqlx::query_as::<_, ManifestWithRepo>(
        "SELECT m.*, r.account_name, r.name AS repo_name FROM manifests m \
         JOIN repos r ON r.id = m.repo_id \
         WHERE m.next_validation_at < $1 \
         ORDER BY (m.validation_error_message = '') ASC, m.next_validation_at ASC \
         LIMIT 1 \
         FOR UPDATE OF m SKIP LOCKED",
    )
    .bind(now)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn update_validation_result(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    digest: &str,
    error_message: &str,
    next_validation_at: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE manifests SET validation_error_message = $3, next_validation_at = $4 \
         WHERE repo_id = $1 AND digest = $2",
    )
    .bind(repo_id)
    .bind(digest)
    .bind(error_message)
    .bind(next_validation_at)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn update_size(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    digest: &str,
    size_bytes: i64,
) -> Result<(), DbError> {
    sqlx::query("UPDATE manifests SET size_bytes = $3 WHERE repo_id = $1 AND digest = $2")
        .bind(repo_id)
        .bind(digest)
        .bind(size_bytes)
        .execute(ex)
        .await?;
    Ok(())
}

pub async fn update_gc_status(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    digest: &str,
    gc_status_json: &str,
) -> Result<(), DbError> {
    sqlx::query("UPDATE manifests SET gc_status_json = $3 WHERE repo_id = $1 AND digest = $2")
        .bind(repo_id)
        .bind(digest)
        .bind(gc_status_json)
        .execute(ex)
        .await?;
    Ok(())
}

/// Requests an early re-validation, e.g. after a tag moved onto the
/// manifest during replica sync.
pub async fn request_validation(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    digest: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE manifests SET next_validation_at = $3 \
         WHERE repo_id = $1 AND digest = $2 AND next_validation_at > $3",
    )
    .bind(repo_id)
    .bind(digest)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn get_content(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    digest: &str,
) -> Result<Option<Vec<u8>>, DbError> {
    let content = sqlx::query_scalar::<_, Vec<u8>>(
        "SELECT content FROM manifest_contents WHERE repo_id = $1 AND digest = $2",
    )
    .bind(repo_id)
    .bind(digest)
    .fetch_optional(ex)
    .await?;
    Ok(content)
}

pub async fn list_blob_refs(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    digest: &str,
) -> Result<Vec<i64>, DbError> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT blob_id FROM manifest_blob_refs WHERE repo_id = $1 AND digest = $2",
    )
    .bind(repo_id)
    .bind(digest)
    .fetch_all(ex)
    .await?;
    Ok(ids)
}

pub async fn insert_blob_ref(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    digest: &str,
    blob_id: i64,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO manifest_blob_refs (repo_id, digest, blob_id) VALUES ($1, $2, $3) \
         ON CONFLICT DO NOTHING",
    )
    .bind(repo_id)
    .bind(digest)
    .bind(blob_id)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn delete_blob_ref(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    digest: &str,
    blob_id: i64,
) -> Result<(), DbError> {
    sqlx::query(
        "DELETE FROM manifest_blob_refs WHERE repo_id = $1 AND digest = $2 AND blob_id = $3",
    )
    .bind(repo_id)
    .bind(digest)
    .bind(blob_id)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn list_child_digests(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    parent_digest: &str,
) -> Result<Vec<String>, DbError> {
    let digests = sqlx::query_scalar::<_, String>(
        "SELECT child_digest FROM manifest_manifest_refs \
         WHERE repo_id = $1 AND parent_digest = $2",
    )
    .bind(repo_id)
    .bind(parent_digest)
    .fetch_all(ex)
    .await?;
    Ok(digests)
}

/// All parent/child edges of the repo, for deletion ordering and parent
/// protection.
pub async fn list_parent_child_edges(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
) -> Result<Vec<(String, String)>, DbError> {
    let edges = sqlx::query_as::<_, (String, String)>(
        "SELECT parent_digest, child_digest FROM manifest_manifest_refs WHERE repo_id = $1",
    )
    .bind(repo_id)
    .fetch_all(ex)
    .await?;
    Ok(edges)
}

pub async fn insert_manifest_ref(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    parent_digest: &str,
    child_digest: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO manifest_manifest_refs (repo_id, parent_digest, child_digest) \
         VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
    )
    .bind(repo_id)
    .bind(parent_digest)
    .bind(child_digest)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn delete_manifest_ref(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    parent_digest: &str,
    child_digest: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "DELETE FROM manifest_manifest_refs \
         WHERE repo_id = $1 AND parent_digest = $2 AND child_digest = $3",
    )
    .bind(repo_id)
    .bind(parent_digest)
    .bind(child_digest)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn list_tags_of_repo(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
) -> Result<Vec<TagRow>, DbError> {
    let rows =
        sqlx::query_as::<_, TagRow>("SELECT * FROM tags WHERE repo_id = $1 ORDER BY name")
            .bind(repo_id)
            .fetch_all(ex)
            .await?;
    Ok(rows)
}

pub async fn insert_tag(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    name: &str,
    digest: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO tags (repo_id, name, digest, pushed_at, last_pulled_at) \
         VALUES ($1, $2, $3, $4, NULL) \
         ON CONFLICT (repo_id, name) DO NOTHING",
    )
    .bind(repo_id)
    .bind(name)
    .bind(digest)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

/// Points an existing tag at a different manifest. The pull timestamp is
/// reset since the tag now names different content.
pub async fn move_tag(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    name: &str,
    digest: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE tags SET digest = $3, pushed_at = $4, last_pulled_at = NULL \
         WHERE repo_id = $1 AND name = $2",
    )
    .bind(repo_id)
    .bind(name)
    .bind(digest)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn delete_tag(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    name: &str,
) -> Result<(), DbError> {
    sqlx::query("DELETE FROM tags WHERE repo_id = $1 AND name = $2")
        .bind(repo_id)
        .bind(name)
        .execute(ex)
        .await?;
    Ok(())
}

/// Merges pull timestamps reported by a replica into tags and manifests.
/// `NULL` compares as the oldest value, so a timestamp is only ever moved
/// forward.
pub async fn merge_manifest_last_pulled(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    digest: &str,
    last_pulled_at: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE manifests SET last_pulled_at = $3 \
         WHERE repo_id = $1 AND digest = $2 \
           AND (last_pulled_at IS NULL OR last_pulled_at < $3)",
    )
    .bind(repo_id)
    .bind(digest)
    .bind(last_pulled_at)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn merge_tag_last_pulled(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    name: &str,
    last_pulled_at: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE tags SET last_pulled_at = $3 \
         WHERE repo_id = $1 AND name = $2 \
           AND (last_pulled_at IS NULL OR last_pulled_at < $3)",
    )
    .bind(repo_id)
    .bind(name)
    .bind(last_pulled_at)
    .execute(ex)
    .await?;
    Ok(())
}

/// Removes every database trace of one manifest: tags pointing at it, its
/// reference sets, its security info, its content bytes, and finally the
/// manifest row. Runs on a single connection, normally inside a
/// transaction; the storage object is deleted by the caller afterwards.
pub async fn delete_manifest_rows(
    conn: &mut PgConnection,
    repo_id: i64,
    digest: &str,
) -> Result<bool, DbError> {
    sqlx::query("DELETE FROM tags WHERE repo_id = $1 AND digest = $2")
        .bind(repo_id)
        .bind(digest)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM manifest_blob_refs WHERE repo_id = $1 AND digest = $2")
        .bind(repo_id)
        .bind(digest)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "DELETE FROM manifest_manifest_refs \
         WHERE repo_id = $1 AND (parent_digest = $2 OR child_digest = $2)",
    )
    .bind(repo_id)
    .bind(digest)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM trivy_security_info WHERE repo_id = $1 AND digest = $2")
        .bind(repo_id)
        .bind(digest)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM manifest_contents WHERE repo_id = $1 AND digest = $2")
        .bind(repo_id)
        .bind(digest)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM manifests WHERE repo_id = $1 AND digest = $2")
        .bind(repo_id)
        .bind(digest)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// The blobs a manifest references, with their full rows. Used by the
/// vulnerability check to find oversized or scan-blocking layers.
pub async fn list_blobs_of_manifest(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    digest: &str,
) -> Result<Vec<crate::BlobRow>, DbError> {
    let rows = sqlx::query_as::<_, crate::BlobRow>(
        "SELECT b.* FROM blobs b \
         JOIN manifest_blob_refs mbr ON mbr.blob_id = b.id \
         WHERE mbr.repo_id = $1 AND mbr.digest = $2",
    )
    .bind(repo_id)
    .bind(digest)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

/// The manifests the storage sweeper must treat as known, as
/// `(repo_name, digest)` pairs.
pub async fn list_known_manifests(
    ex: impl PgExecutor<'_>,
    account_name: &str,
) -> Result<Vec<(String, String)>, DbError> {
    let pairs = sqlx::query_as::<_, (String, String)>(
        "SELECT r.name, m.digest FROM manifests m \
         JOIN repos r ON r.id = m.repo_id \
         WHERE r.account_name = $1",
    )
    .bind(account_name)
    .fetch_all(ex)
    .await?;
    Ok(pairs)
}
