use std::fmt;
use std::str::FromStr;

use anyhow::{bail, format_err, Context, Error};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Aggregated vulnerability status of a manifest.
///
/// The variants form a lattice; merging (e.g. across the children of an
/// image list) takes the maximum in the order listed here. `Rotten` ranks
/// above `Critical` because an end-of-support-life base image cannot be
/// fixed by patching. `Pending` ranks highest so that a list manifest
/// whose children are not all scanned yet does not report a final result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VulnStatus {
    Clean,
    Low,
    Medium,
    High,
    Critical,
    Rotten,
    Unsupported,
    Error,
    Pending,
}

impl VulnStatus {
    pub fn merge(self, other: VulnStatus) -> VulnStatus {
        self.max(other)
    }

    /// The plain severity levels that a scanner report can assign to a
    /// single finding. Excludes the bookkeeping variants.
    pub fn is_severity(&self) -> bool {
        matches!(
            self,
            VulnStatus::Clean
                | VulnStatus::Low
                | VulnStatus::Medium
                | VulnStatus::High
                | VulnStatus::Critical
        )
    }
}

impl fmt::Display for VulnStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            VulnStatus::Clean => "Clean",
            VulnStatus::Low => "Low",
            VulnStatus::Medium => "Medium",
            VulnStatus::High => "High",
            VulnStatus::Critical => "Critical",
            VulnStatus::Rotten => "Rotten",
            VulnStatus::Unsupported => "Unsupported",
            VulnStatus::Error => "Error",
            VulnStatus::Pending => "Pending",
        };
        f.write_str(s)
    }
}

impl FromStr for VulnStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "Clean" => VulnStatus::Clean,
            "Low" => VulnStatus::Low,
            "Medium" => VulnStatus::Medium,
            "High" => VulnStatus::High,
            "Critical" => VulnStatus::Critical,
            "Rotten" => VulnStatus::Rotten,
            "Unsupported" => VulnStatus::Unsupported,
            "Error" => VulnStatus::Error,
            "Pending" => VulnStatus::Pending,
            other => bail!("unknown vulnerability status: {:?}", other),
        })
    }
}

/// One entry of an account's security scan policy list.
///
/// Policies adjust scanner findings before the aggregate status is
/// computed: a finding can be ignored outright or its severity lowered.
/// Raising a severity is not allowed, so a policy can never make an image
/// look worse than the scanner said.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecurityScanPolicy {
    /// Regex that repository names must match.
    pub match_repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_repository: Option<String>,
    /// Regex on vulnerability IDs, e.g. `CVE-2024-.*`.
    pub match_vulnerability_id: String,
    /// Only apply while no fixed version has been released.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub only_if_no_fix_released: bool,
    pub action: SecurityScanPolicyAction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecurityScanPolicyAction {
    /// Human readable justification, mandatory for auditability.
    pub assessment: String,
    /// Drop matching findings from the aggregate entirely.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignore: bool,
    /// Override the severity of matching findings. Must be a plain
    /// severity and must not be higher than what the scanner reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<VulnStatus>,
}

pub struct CompiledSecurityScanPolicy {
    pub policy: SecurityScanPolicy,
    match_repository: Regex,
    except_repository: Option<Regex>,
    match_vulnerability_id: Regex,
}

impl SecurityScanPolicy {
    /// Parses the `security_scan_policies_json` column of an account row.
    pub fn parse_list(json: &str) -> Result<Vec<SecurityScanPolicy>, Error> {
        if json.is_empty() || json == "[]" {
            return Ok(Vec::new());
        }
        serde_json::from_str(json).context("cannot parse security scan policies")
    }

    pub fn compile(&self) -> Result<CompiledSecurityScanPolicy, Error> {
        if self.action.assessment.is_empty() {
            bail!("security scan policy needs a non-empty assessment");
        }
        match (self.action.ignore, self.action.severity) {
            (false, None) => bail!("security scan policy action needs \"ignore\" or \"severity\""),
            (true, Some(_)) => {
                bail!("security scan policy action accepts only one of \"ignore\" and \"severity\"")
            }
            _ => (),
        }
        if let Some(severity) = self.action.severity {
            if !severity.is_severity() {
                bail!("{severity} is not a valid severity override");
            }
        }

        let anchored = |field: &str, pattern: &str| {
            Regex::new(&format!("^(?:{pattern})$"))
                .map_err(|err| format_err!("invalid regex in {field}: {err}"))
        };
        Ok(CompiledSecurityScanPolicy {
            match_repository: anchored("match_repository", &self.match_repository)?,
            except_repository: self
                .except_repository
                .as_deref()
                .map(|p| anchored("except_repository", p))
                .transpose()?,
            match_vulnerability_id: anchored(
                "match_vulnerability_id",
                &self.match_vulnerability_id,
            )?,
            policy: self.clone(),
        })
    }
}

impl CompiledSecurityScanPolicy {
    pub fn matches(&self, repo_name: &str, vulnerability_id: &str, fix_released: bool) -> bool {
        if !self.match_repository.is_match(repo_name) {
            return false;
        }
        if let Some(except) = &self.except_repository {
            if except.is_match(repo_name) {
                return false;
            }
        }
        if !self.match_vulnerability_id.is_match(vulnerability_id) {
            return false;
        }
        if self.policy.only_if_no_fix_released && fix_released {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vuln_status_merge_order() {
        use VulnStatus::*;

        assert_eq!(Clean.merge(Low), Low);
        assert_eq!(High.merge(Medium), High);
        assert_eq!(Critical.merge(Rotten), Rotten);
        assert_eq!(Rotten.merge(Unsupported), Unsupported);
        assert_eq!(Error.merge(Critical), Error);
        assert_eq!(Pending.merge(Error), Pending);
    }

    #[test]
    fn vuln_status_string_round_trip() {
        for status in [
            VulnStatus::Clean,
            VulnStatus::Critical,
            VulnStatus::Rotten,
            VulnStatus::Pending,
        ] {
            assert_eq!(status.to_string().parse::<VulnStatus>().unwrap(), status);
        }
        assert!("Terrible".parse::<VulnStatus>().is_err());
    }

    fn ignore_policy() -> SecurityScanPolicy {
        serde_json::from_str(
            r#"{
                "match_repository": ".*",
                "match_vulnerability_id": "CVE-2024-1234",
                "action": {"assessment": "not reachable in our builds", "ignore": true}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn policy_matching() {
        let compiled = ignore_policy().compile().unwrap();
        assert!(compiled.matches("library/alpine", "CVE-2024-1234", false));
        assert!(!compiled.matches("library/alpine", "CVE-2024-9999", false));
    }

    #[test]
    fn policy_fix_released_filter() {
        let mut policy = ignore_policy();
        policy.only_if_no_fix_released = true;
        let compiled = policy.compile().unwrap();
        assert!(compiled.matches("x", "CVE-2024-1234", false));
        assert!(!compiled.matches("x", "CVE-2024-1234", true));
    }

    #[test]
    fn policy_validation() {
        let mut policy = ignore_policy();
        policy.action.assessment = String::new();
        assert!(policy.compile().is_err());

        let mut policy = ignore_policy();
        policy.action.ignore = false;
        assert!(policy.compile().is_err());

        let mut policy = ignore_policy();
        policy.action.ignore = false;
        policy.action.severity = Some(VulnStatus::Rotten);
        assert!(policy.compile().is_err());

        let mut policy = ignore_policy();
        policy.action.ignore = false;
        policy.action.severity = Some(VulnStatus::Low);
        assert!(policy.compile().is_ok());
    }
}
