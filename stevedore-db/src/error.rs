/// Error type of the persistence layer.
///
/// Unexpected database errors propagate as `Sqlx`; `NotFound` is reserved
/// for lookups where the caller supplied an id that must exist (e.g.
/// resolving an upload's repo to its account).
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(&'static str),
}
