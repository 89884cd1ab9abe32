//! Account rows and the per-account job schedules.

use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use stevedore_api_types::ReplicationMode;

use crate::DbError;

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct AccountRow {
    pub name: String,
    pub auth_tenant_id: String,
    /// Hostname of the upstream peer if this account replicates from
    /// inside the peer group. Mutually exclusive with `external_peer_url`.
    pub upstream_peer_hostname: Option<String>,
    pub external_peer_url: Option<String>,
    pub gc_policies_json: String,
    pub security_scan_policies_json: String,
    pub rbac_policies_json: String,
    pub is_managed: bool,
    pub is_deleting: bool,
    pub next_blob_sweep_at: Option<DateTime<Utc>>,
    pub next_storage_sweep_at: Option<DateTime<Utc>>,
    pub next_federation_announcement_at: Option<DateTime<Utc>>,
    pub next_account_enforcement_at: Option<DateTime<Utc>>,
    pub next_deletion_attempt_at: Option<DateTime<Utc>>,
}

impl AccountRow {
    pub fn replication_mode(&self) -> ReplicationMode {
        if let Some(hostname) = &self.upstream_peer_hostname {
            ReplicationMode::OnFirstUse {
                upstream_hostname: hostname.clone(),
            }
        } else if let Some(url) = &self.external_peer_url {
            ReplicationMode::FromExternalOnFirstUse {
                upstream_url: url.clone(),
            }
        } else {
            ReplicationMode::None
        }
    }
}

pub async fn get_account(
    ex: impl PgExecutor<'_>,
    name: &str,
) -> Result<Option<AccountRow>, DbError> {
    let row = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE name = $1")
        .bind(name)
        .fetch_optional(ex)
        .await?;
    Ok(row)
}

pub async fn list_account_names(ex: impl PgExecutor<'_>) -> Result<Vec<String>, DbError> {
    let names = sqlx::query_scalar::<_, String>("SELECT name FROM accounts ORDER BY name")
        .fetch_all(ex)
        .await?;
    Ok(names)
}

/// Locks and returns the next account due for a blob sweep. Runs inside
/// the caller's transaction; the row stays locked until commit.
pub async fn claim_due_blob_sweep(
    ex: impl PgExecutor<'_>,
    now: DateTime<Utc>,
) -> Result<Option<AccountRow>, DbError> {
    let row = sqlx::query_as::<_, AccountRow>(
        "SELECT * FROM accounts \
         WHERE next_blob_sweep_at IS NULL OR next_blob_sweep_at < $1 \
         ORDER BY next_blob_sweep_at ASC NULLS FIRST \
         LIMIT 1 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(now)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn reschedule_blob_sweep(
    ex: impl PgExecutor<'_>,
    name: &str,
    next: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query("UPDATE accounts SET next_blob_sweep_at = $2 WHERE name = $1")
        .bind(name)
        .bind(next)
        .execute(ex)
        .await?;
    Ok(())
}

/// Pulls the account's blob sweep forward to `now`, but never delays a
/// sweep that is already scheduled sooner.
pub async fn request_blob_sweep(
    ex: impl PgExecutor<'_>,
    name: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE accounts SET next_blob_sweep_at = $2 \
         WHERE name = $1 AND (next_blob_sweep_at IS NULL OR next_blob_sweep_at > $2)",
    )
    .bind(name)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

/// Claims the next account due for a storage sweep by advancing its
/// schedule in one atomic statement. No lock survives this call.
pub async fn claim_due_storage_sweep(
    ex: impl PgExecutor<'_>,
    now: DateTime<Utc>,
    next: DateTime<Utc>,
) -> Result<Option<AccountRow>, DbError> {
    let row = sqlx::query_as::<_, AccountRow>(
        "UPDATE accounts SET next_storage_sweep_at = $2 \
         WHERE name IN (\
             SELECT name FROM accounts \
             WHERE next_storage_sweep_at IS NULL OR next_storage_sweep_at < $1 \
             ORDER BY next_storage_sweep_at ASC NULLS FIRST \
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

pub async fn claim_due_federation_announcement(
    ex: impl PgExecutor<'_>,
    now: DateTime<Utc>,
    next: DateTime<Utc>,
) -> Result<Option<AccountRow>, DbError> {
    let row = sqlx::query_as::<_, AccountRow>(
        "UPDATE accounts SET next_federation_announcement_at = $2 \
         WHERE name IN (\
             SELECT name FROM accounts \
             WHERE next_federation_announcement_at IS NULL OR next_federation_announcement_at < $1 \
             ORDER BY next_federation_announcement_at ASC NULLS FIRST \
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

pub async fn claim_due_enforcement(
    ex: impl PgExecutor<'_>,
    now: DateTime<Utc>,
    next: DateTime<Utc>,
) -> Result<Option<AccountRow>, DbError> {
    let row = sqlx::query_as::<_, AccountRow>(
        "UPDATE accounts SET next_account_enforcement_at = $2 \
         WHERE name IN (\
             SELECT name FROM accounts \
             WHERE is_managed \
               AND (next_account_enforcement_at IS NULL OR next_account_enforcement_at < $1) \
             ORDER BY next_account_enforcement_at ASC NULLS FIRST \
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

pub async fn reschedule_enforcement(
    ex: impl PgExecutor<'_>,
    name: &str,
    next: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query("UPDATE accounts SET next_account_enforcement_at = $2 WHERE name = $1")
        .bind(name)
        .bind(next)
        .execute(ex)
        .await?;
    Ok(())
}

/// Claims the next account marked for deletion. The deletion attempt is
/// rescheduled `retry` in the future up front; the success path removes
/// the row entirely, so the reschedule only matters on failure.
pub async fn claim_due_deletion(
    ex: impl PgExecutor<'_>,
    now: DateTime<Utc>,
    retry: DateTime<Utc>,
) -> Result<Option<AccountRow>, DbError> {
    let row = sqlx::query_as::<_, AccountRow>(
        "UPDATE accounts SET next_deletion_attempt_at = $2 \
         WHERE name IN (\
             SELECT name FROM accounts \
             WHERE is_deleting \
               AND (next_deletion_attempt_at IS NULL OR next_deletion_attempt_at < $1) \
             ORDER BY next_deletion_attempt_at ASC NULLS FIRST \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED\
         ) \
         RETURNING *",
    )
    .bind(now)
    .bind(retry)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn set_next_deletion_attempt(
    ex: impl PgExecutor<'_>,
    name: &str,
    next: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query("UPDATE accounts SET next_deletion_attempt_at = $2 WHERE name = $1")
        .bind(name)
        .bind(next)
        .execute(ex)
        .await?;
    Ok(())
}

/// Creates or updates a managed account from the account management
/// driver's desired state.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_managed_account(
    ex: impl PgExecutor<'_>,
    name: &str,
    auth_tenant_id: &str,
    upstream_peer_hostname: Option<&str>,
    external_peer_url: Option<&str>,
    gc_policies_json: &str,
    security_scan_policies_json: &str,
    rbac_policies_json: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO accounts (\
             name, auth_tenant_id, upstream_peer_hostname, external_peer_url, \
             gc_policies_json, security_scan_policies_json, rbac_policies_json, \
             is_managed, is_deleting\
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, FALSE) \
         ON CONFLICT (name) DO UPDATE SET \
             auth_tenant_id = EXCLUDED.auth_tenant_id, \
             upstream_peer_hostname = EXCLUDED.upstream_peer_hostname, \
             external_peer_url = EXCLUDED.external_peer_url, \
             gc_policies_json = EXCLUDED.gc_policies_json, \
             security_scan_policies_json = EXCLUDED.security_scan_policies_json, \
             rbac_policies_json = EXCLUDED.rbac_policies_json, \
             is_managed = TRUE",
    )
    .bind(name)
    .bind(auth_tenant_id)
    .bind(upstream_peer_hostname)
    .bind(external_peer_url)
    .bind(gc_policies_json)
    .bind(security_scan_policies_json)
    .bind(rbac_policies_json)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn mark_for_deletion(
    ex: impl PgExecutor<'_>,
    name: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE accounts SET is_deleting = TRUE, next_deletion_attempt_at = $2 WHERE name = $1",
    )
    .bind(name)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn delete_account(ex: impl PgExecutor<'_>, name: &str) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM accounts WHERE name = $1")
        .bind(name)
        .execute(ex)
        .await?;
    Ok(result.rows_affected() > 0)
}
