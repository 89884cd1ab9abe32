use anyhow::{bail, format_err, Context, Error};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One entry of an account's ordered garbage collection policy list.
///
/// Policies are stored as JSON on the account row and evaluated in order
/// for every manifest of every matching repository. The first matching
/// `protect` policy wins; otherwise the first matching `delete` policy
/// deletes the manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GcPolicy {
    /// Regex that repository names must match.
    pub match_repository: String,
    /// Regex that repository names must not match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_repository: Option<String>,
    /// Regex that at least one tag name must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_tag: Option<String>,
    /// Regex that no tag name may match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_tag: Option<String>,
    /// Policy only applies to manifests without any tag.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub only_untagged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_constraint: Option<GcTimeConstraint>,
    pub action: GcAction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcAction {
    Protect,
    Delete,
}

/// Restricts a policy to manifests inside or outside a time window.
///
/// Exactly one of `newer_than`/`older_than` must be set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GcTimeConstraint {
    pub on: GcTimeField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newer_than: Option<crate::DurationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub older_than: Option<crate::DurationSpec>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcTimeField {
    PushedAt,
    LastPulledAt,
}

/// A [GcPolicy] with its regexes compiled, ready for evaluation.
pub struct CompiledGcPolicy {
    pub policy: GcPolicy,
    match_repository: Regex,
    except_repository: Option<Regex>,
    match_tag: Option<Regex>,
    except_tag: Option<Regex>,
}

// Policy regexes are anchored on both ends so that "foo" does not
// accidentally match "foobar/baz".
fn compile_anchored(field: &str, pattern: &str) -> Result<Regex, Error> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|err| format_err!("invalid regex in {field}: {err}"))
}

impl GcPolicy {
    /// Parses the `gc_policies_json` column of an account row.
    pub fn parse_list(json: &str) -> Result<Vec<GcPolicy>, Error> {
        if json.is_empty() || json == "[]" {
            return Ok(Vec::new());
        }
        serde_json::from_str(json).context("cannot parse GC policies")
    }

    /// Validates the policy and compiles its regexes.
    pub fn compile(&self) -> Result<CompiledGcPolicy, Error> {
        if let Some(tc) = &self.time_constraint {
            match (tc.newer_than, tc.older_than) {
                (None, None) => {
                    bail!("time constraint needs one of \"newer_than\" and \"older_than\"")
                }
                (Some(_), Some(_)) => {
                    bail!("time constraint accepts only one of \"newer_than\" and \"older_than\"")
                }
                _ => (),
            }
        }
        if self.only_untagged && (self.match_tag.is_some() || self.except_tag.is_some()) {
            bail!("\"only_untagged\" cannot be combined with tag regexes");
        }

        Ok(CompiledGcPolicy {
            match_repository: compile_anchored("match_repository", &self.match_repository)?,
            except_repository: self
                .except_repository
                .as_deref()
                .map(|p| compile_anchored("except_repository", p))
                .transpose()?,
            match_tag: self
                .match_tag
                .as_deref()
                .map(|p| compile_anchored("match_tag", p))
                .transpose()?,
            except_tag: self
                .except_tag
                .as_deref()
                .map(|p| compile_anchored("except_tag", p))
                .transpose()?,
            policy: self.clone(),
        })
    }
}

impl CompiledGcPolicy {
    pub fn matches_repository(&self, repo_name: &str) -> bool {
        if !self.match_repository.is_match(repo_name) {
            return false;
        }
        if let Some(except) = &self.except_repository {
            if except.is_match(repo_name) {
                return false;
            }
        }
        true
    }

    /// Whether the tag set of a manifest satisfies this policy.
    pub fn matches_tags(&self, tag_names: &[String]) -> bool {
        if self.policy.only_untagged && !tag_names.is_empty() {
            return false;
        }
        if let Some(match_tag) = &self.match_tag {
            if !tag_names.iter().any(|t| match_tag.is_match(t)) {
                return false;
            }
        }
        if let Some(except_tag) = &self.except_tag {
            if tag_names.iter().any(|t| except_tag.is_match(t)) {
                return false;
            }
        }
        true
    }

    /// Whether the manifest's timestamps satisfy the time constraint.
    ///
    /// A `NULL` timestamp counts as older than everything, so an
    /// `older_than` constraint matches a manifest that was never pulled.
    pub fn matches_time(
        &self,
        pushed_at: DateTime<Utc>,
        last_pulled_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let tc = match &self.policy.time_constraint {
            Some(tc) => tc,
            None => return true,
        };
        let value = match tc.on {
            GcTimeField::PushedAt => Some(pushed_at),
            GcTimeField::LastPulledAt => last_pulled_at,
        };
        if let Some(spec) = tc.newer_than {
            return match value {
                Some(ts) => ts > now - spec.as_chrono(),
                None => false,
            };
        }
        if let Some(spec) = tc.older_than {
            return match value {
                Some(ts) => ts < now - spec.as_chrono(),
                None => true,
            };
        }
        true
    }
}

/// Why a manifest survived garbage collection, serialized into the
/// `gc_status_json` column for display in the UI.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GcStatus {
    /// Deletion was held off because the manifest was pushed very recently
    /// and may not have been tagged yet.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub protected_by_recent_upload: bool,
    /// The manifest is referenced as a child by another manifest.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub protected_by_parent: bool,
    /// The first matching `protect` policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protected_by_policy: Option<GcPolicy>,
    /// All `delete` policies that matched (empty when no policy applied).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relevant_policies: Vec<GcPolicy>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_json(extra: &str) -> String {
        format!(r#"{{"match_repository": "library/.*", "action": "delete"{extra}}}"#)
    }

    #[test]
    fn policy_repository_matching_is_anchored() {
        let policy: GcPolicy = serde_json::from_str(&policy_json("")).unwrap();
        let compiled = policy.compile().unwrap();

        assert!(compiled.matches_repository("library/alpine"));
        assert!(!compiled.matches_repository("prefix/library/alpine"));
        assert!(!compiled.matches_repository("library"));
    }

    #[test]
    fn policy_except_repository() {
        let policy: GcPolicy =
            serde_json::from_str(&policy_json(r#", "except_repository": "library/keep-.*""#))
                .unwrap();
        let compiled = policy.compile().unwrap();

        assert!(compiled.matches_repository("library/alpine"));
        assert!(!compiled.matches_repository("library/keep-me"));
    }

    #[test]
    fn policy_tag_matching() {
        let policy: GcPolicy = serde_json::from_str(&policy_json(
            r#", "match_tag": "nightly-.*", "except_tag": "nightly-keep""#,
        ))
        .unwrap();
        let compiled = policy.compile().unwrap();

        assert!(compiled.matches_tags(&["nightly-20250101".into()]));
        assert!(!compiled.matches_tags(&["v1.2.3".into()]));
        assert!(!compiled.matches_tags(&["nightly-20250101".into(), "nightly-keep".into()]));
    }

    #[test]
    fn policy_only_untagged() {
        let policy: GcPolicy =
            serde_json::from_str(&policy_json(r#", "only_untagged": true"#)).unwrap();
        let compiled = policy.compile().unwrap();

        assert!(compiled.matches_tags(&[]));
        assert!(!compiled.matches_tags(&["latest".into()]));
    }

    #[test]
    fn policy_time_constraints() {
        let now = Utc::now();
        let policy: GcPolicy = serde_json::from_str(&policy_json(
            r#", "time_constraint": {"on": "last_pulled_at", "older_than": {"value": 7, "unit": "d"}}"#,
        ))
        .unwrap();
        let compiled = policy.compile().unwrap();

        // pulled yesterday: not old enough
        assert!(!compiled.matches_time(now, Some(now - chrono::Duration::days(1)), now));
        // pulled a month ago
        assert!(compiled.matches_time(now, Some(now - chrono::Duration::days(30)), now));
        // never pulled counts as infinitely old
        assert!(compiled.matches_time(now, None, now));
    }

    #[test]
    fn policy_validation_rejects_nonsense() {
        let policy: GcPolicy = serde_json::from_str(&policy_json(
            r#", "time_constraint": {"on": "pushed_at"}"#,
        ))
        .unwrap();
        assert!(policy.compile().is_err());

        let policy: GcPolicy = serde_json::from_str(&policy_json(
            r#", "time_constraint": {"on": "pushed_at", "newer_than": {"value": 1, "unit": "h"}, "older_than": {"value": 2, "unit": "h"}}"#,
        ))
        .unwrap();
        assert!(policy.compile().is_err());

        let policy: GcPolicy =
            serde_json::from_str(&policy_json(r#", "only_untagged": true, "match_tag": "x""#))
                .unwrap();
        assert!(policy.compile().is_err());

        let policy: GcPolicy =
            serde_json::from_str(r#"{"match_repository": "*broken", "action": "delete"}"#).unwrap();
        assert!(policy.compile().is_err());
    }
}
