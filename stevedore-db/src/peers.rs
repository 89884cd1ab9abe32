//! Peered registries and their replication credentials.

use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::DbError;

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct PeerRow {
    pub hostname: String,
    /// SHA-256 hex hash of the replication password we most recently
    /// issued to this peer.
    pub their_current_password_hash: String,
    /// Hash of the password issued one rotation earlier. Both hashes are
    /// accepted for inbound auth, so rotation never locks a peer out.
    pub their_previous_password_hash: String,
    pub last_peered_at: Option<DateTime<Utc>>,
    pub use_for_pull_delegation: bool,
}

/// Locks and returns the next peer whose replication password is due for
/// rotation. Runs inside the caller's transaction.
pub async fn claim_due_rotation(
    ex: impl PgExecutor<'_>,
    cutoff: DateTime<Utc>,
) -> Result<Option<PeerRow>, DbError> {
    let row = sqlx::query_as::<_, PeerRow>(
        "SELECT * FROM peers \
         WHERE use_for_pull_delegation \
           AND (last_peered_at IS NULL OR last_peered_at < $1) \
         ORDER BY last_peered_at ASC NULLS FIRST \
         LIMIT 1 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(cutoff)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

/// Installs a freshly issued password hash, demoting the current one to
/// previous.
pub async fn rotate_password(
    ex: impl PgExecutor<'_>,
    hostname: &str,
    new_password_hash: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE peers SET \
             their_previous_password_hash = their_current_password_hash, \
             their_current_password_hash = $2, \
             last_peered_at = $3 \
         WHERE hostname = $1",
    )
    .bind(hostname)
    .bind(new_password_hash)
    .bind(now)
    .execute(ex)
    .await?;
    Ok(())
}

/// Restores the pre-rotation state after the peer rejected the new
/// password.
pub async fn restore_password(ex: impl PgExecutor<'_>, peer: &PeerRow) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE peers SET \
             their_current_password_hash = $2, \
             their_previous_password_hash = $3, \
             last_peered_at = $4 \
         WHERE hostname = $1",
    )
    .bind(&peer.hostname)
    .bind(&peer.their_current_password_hash)
    .bind(&peer.their_previous_password_hash)
    .bind(peer.last_peered_at)
    .execute(ex)
    .await?;
    Ok(())
}
