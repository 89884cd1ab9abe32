//! Data types shared between the janitor, the database layer and the
//! outbound clients.
//!
//! Everything in here is plain serializable data. Row structs live in
//! `stevedore-db`; this crate only knows about the value types that appear
//! inside rows (policies, statuses, digests) and on the wire.

mod digest;
pub use digest::*;

mod gc;
pub use gc::*;

mod identity;
pub use identity::*;

mod peering;
pub use peering::*;

mod rbac;
pub use rbac::*;

mod security;
pub use security::*;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

// Account names become DNS labels and path components; repo names follow
// the distribution spec's path grammar.
static ACCOUNT_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9](?:[a-z0-9-]{0,46}[a-z0-9])?$").unwrap());
static REPO_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$").unwrap()
});

pub fn is_valid_account_name(name: &str) -> bool {
    ACCOUNT_NAME_REGEX.is_match(name)
}

pub fn is_valid_repo_name(name: &str) -> bool {
    name.len() <= 256 && REPO_NAME_REGEX.is_match(name)
}

/// How an account relates to its upstream, derived from the account row.
///
/// An account is a replica iff it names an upstream peer or an external
/// primary; the two are mutually exclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicationMode {
    /// A primary account without any upstream.
    None,
    /// Replica of another registry in the same peer group. Manifests are
    /// fetched on first use.
    OnFirstUse { upstream_hostname: String },
    /// Replica of an external (non-peered) registry.
    FromExternalOnFirstUse { upstream_url: String },
}

impl ReplicationMode {
    pub fn is_replica(&self) -> bool {
        !matches!(self, ReplicationMode::None)
    }

    /// Whether replica-side sync writes `last_pulled_at` timestamps back to
    /// the primary. External primaries are not ours to write to.
    pub fn merges_last_pulled(&self) -> bool {
        matches!(self, ReplicationMode::OnFirstUse { .. })
    }
}

/// A duration as it appears in policy JSON, e.g. `{"value": 10, "unit": "d"}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationSpec {
    pub value: u64,
    pub unit: DurationUnit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurationUnit {
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "m")]
    Minutes,
    #[serde(rename = "h")]
    Hours,
    #[serde(rename = "d")]
    Days,
    #[serde(rename = "w")]
    Weeks,
}

impl DurationSpec {
    pub fn as_chrono(&self) -> chrono::Duration {
        let secs = match self.unit {
            DurationUnit::Seconds => 1,
            DurationUnit::Minutes => 60,
            DurationUnit::Hours => 3600,
            DurationUnit::Days => 86400,
            DurationUnit::Weeks => 7 * 86400,
        };
        chrono::Duration::seconds((self.value * secs) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_name_validation() {
        assert!(is_valid_account_name("abcde"));
        assert!(is_valid_account_name("team-1"));
        assert!(!is_valid_account_name(""));
        assert!(!is_valid_account_name("-leading"));
        assert!(!is_valid_account_name("trailing-"));
        assert!(!is_valid_account_name("UpperCase"));
        assert!(!is_valid_account_name(&"a".repeat(49)));
    }

    #[test]
    fn repo_name_validation() {
        assert!(is_valid_repo_name("alpine"));
        assert!(is_valid_repo_name("library/alpine"));
        assert!(is_valid_repo_name("a/b-c/d_e.f"));
        assert!(!is_valid_repo_name(""));
        assert!(!is_valid_repo_name("/leading"));
        assert!(!is_valid_repo_name("trailing/"));
        assert!(!is_valid_repo_name("double..dot"));
        assert!(!is_valid_repo_name(&"a/".repeat(200)));
    }

    #[test]
    fn duration_spec_json_format() {
        let spec: DurationSpec = serde_json::from_str(r#"{"value":10,"unit":"d"}"#).unwrap();
        assert_eq!(spec.value, 10);
        assert_eq!(spec.unit, DurationUnit::Days);
        assert_eq!(spec.as_chrono(), chrono::Duration::days(10));

        let spec: DurationSpec = serde_json::from_str(r#"{"value":90,"unit":"s"}"#).unwrap();
        assert_eq!(spec.as_chrono(), chrono::Duration::seconds(90));
    }
}
