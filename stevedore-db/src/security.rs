//! Per-manifest vulnerability scan state.

use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::DbError;

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct TrivySecurityInfoRow {
    pub repo_id: i64,
    pub digest: String,
    /// Stringified [stevedore_api_types::VulnStatus].
    pub vuln_status: String,
    pub next_check_at: DateTime<Utc>,
    pub checked_at: Option<DateTime<Utc>>,
    pub has_enriched_report: bool,
    pub vuln_status_changed_at: Option<DateTime<Utc>>,
    pub message: String,
}

/// A security info row joined with the coordinates needed to talk to the
/// scanner about it.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct SecurityCheckCandidate {
    #[sqlx(flatten)]
    pub info: TrivySecurityInfoRow,
    pub account_name: String,
    pub repo_name: String,
}

/// Claims the next manifest due for a vulnerability check by advancing
/// its schedule atomically. Manifests in deleting accounts are skipped.
pub async fn claim_due_check(
    ex: impl PgExecutor<'_>,
    now: DateTime<Utc>,
    next: DateTime<Utc>,
) -> Result<Option<SecurityCheckCandidate>, DbError> {
    let row = sqlx::query_as::<_, SecurityCheckCandidate>(
        "WITH claimed AS (\
             SELECT t.repo_id, t.digest FROM trivy_security_info t \
             JOIN repos r ON r.id = t.repo_id \
             JOIN accounts a ON a.name = r.account_name \
             WHERE t.next_check_at < $1 AND NOT a.is_deleting \
             ORDER BY t.next_check_at ASC \
             LIMIT 1 \
             FOR UPDATE OF t SKIP LOCKED\
         ) \
         UPDATE trivy_security_info t SET next_check_at = $2 \
         FROM claimed, repos r \
         WHERE t.repo_id = claimed.repo_id AND t.digest = claimed.digest \
           AND r.id = t.repo_id \
         RETURNING t.*, r.account_name, r.name AS repo_name",
    )
    .bind(now)
    .bind(next)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

/// Scan states of the children of an image list manifest, keyed by child
/// digest. Children without a security info row are absent.
pub async fn get_child_statuses(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    parent_digest: &str,
) -> Result<Vec<(String, String)>, DbError> {
    let rows = sqlx::query_as::<_, (String, String)>(
        "SELECT mmr.child_digest, t.vuln_status FROM manifest_manifest_refs mmr \
         JOIN trivy_security_info t \
           ON t.repo_id = mmr.repo_id AND t.digest = mmr.child_digest \
         WHERE mmr.repo_id = $1 AND mmr.parent_digest = $2",
    )
    .bind(repo_id)
    .bind(parent_digest)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

/// Persists the outcome of one check. `vuln_status_changed_at` is only
/// stamped (with `now`) when the status actually changes.
#[allow(clippy::too_many_arguments)]
pub async fn update_check_result(
    ex: impl PgExecutor<'_>,
    repo_id: i64,
    digest: &str,
    vuln_status: &str,
    message: &str,
    checked_at: Option<DateTime<Utc>>,
    next_check_at: DateTime<Utc>,
    has_enriched_report: bool,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE trivy_security_info SET \
             vuln_status = $3, \
             message = $4, \
             checked_at = $5, \
             next_check_at = $6, \
             has_enriched_report = $7, \
             vuln_status_changed_at = CASE \
                 WHEN vuln_status != $3 THEN $8 \
                 ELSE vuln_status_changed_at \
             END \
         WHERE repo_id = $1 AND digest = $2",
    )
    .bind(repo_id)
    .bind(digest)
    .bind(vuln_status)
    .bind(message)
    .bind(checked_at)
    .bind(next_check_at)
    .bind(has_enriched_report)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

/// The enriched reports the storage sweeper must treat as known, as
/// `(repo_name, digest)` pairs.
pub async fn list_known_reports(
    ex: impl PgExecutor<'_>,
    account_name: &str,
) -> Result<Vec<(String, String)>, DbError> {
    let pairs = sqlx::query_as::<_, (String, String)>(
        "SELECT r.name, t.digest FROM trivy_security_info t \
         JOIN repos r ON r.id = t.repo_id \
         WHERE r.account_name = $1 AND t.has_enriched_report",
    )
    .bind(account_name)
    .fetch_all(ex)
    .await?;
    Ok(pairs)
}
