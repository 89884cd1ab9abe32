//! Relational persistence layer.
//!
//! The database is the source of truth for the whole registry; object
//! storage only holds payload bytes. This crate wraps a Postgres pool and
//! exposes one function per query the janitor needs, grouped by entity.
//!
//! Two claiming disciplines are used so that any number of janitor workers
//! can run concurrently without stepping on each other:
//!
//! - Short jobs open a transaction and select their work row with
//!   `FOR UPDATE SKIP LOCKED`; the row stays locked until the job commits.
//! - Long jobs (sync, GC, storage sweep) claim by atomically advancing the
//!   row's `next_*_at` timestamp in a single `UPDATE … RETURNING`
//!   statement, so no lock is held across network or storage calls. A
//!   failure is retried on the next pass.
//!
//! The schema itself is owned by the migration component; `schema.sql` in
//! this crate is reference documentation only.

pub mod accounts;
pub mod blobs;
pub mod manifests;
pub mod peers;
pub mod repos;
pub mod security;
pub mod unknowns;
pub mod uploads;

mod error;
pub use error::DbError;

use sqlx::postgres::{PgPool, Postgres};
use sqlx::Transaction;

pub use accounts::AccountRow;
pub use blobs::{BlobMountRow, BlobRow};
pub use manifests::{ManifestRow, ManifestWithRepo, TagRow};
pub use peers::PeerRow;
pub use repos::RepoRow;
pub use security::TrivySecurityInfoRow;
pub use unknowns::{UnknownBlobRow, UnknownManifestRow, UnknownTrivyReportRow};
pub use uploads::UploadRow;

/// Handle on the registry database.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, DbError> {
        Ok(self.pool.begin().await?)
    }
}
