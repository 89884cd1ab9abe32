use anyhow::{bail, format_err, Context, Error};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One entry of an account's RBAC policy list.
///
/// The janitor never evaluates these itself (authorization happens in the
/// API layer), but the account enforcer validates them before storing
/// what the account management driver supplies, so that a typo in a
/// driver-side regex surfaces as an enforcement failure instead of a
/// broken API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RbacPolicy {
    /// Regex that repository names must match for the policy to apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_repository: Option<String>,
    /// Regex on the authenticated user name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_username: Option<String>,
    pub permissions: Vec<RbacPermission>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RbacPermission {
    Pull,
    Push,
    Delete,
    AnonymousPull,
    AnonymousFirstPull,
}

impl RbacPermission {
    pub fn is_anonymous(&self) -> bool {
        matches!(
            self,
            RbacPermission::AnonymousPull | RbacPermission::AnonymousFirstPull
        )
    }
}

impl RbacPolicy {
    /// Parses the `rbac_policies_json` column of an account row.
    pub fn parse_list(json: &str) -> Result<Vec<RbacPolicy>, Error> {
        if json.is_empty() || json == "[]" {
            return Ok(Vec::new());
        }
        serde_json::from_str(json).context("cannot parse RBAC policies")
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.permissions.is_empty() {
            bail!("RBAC policy grants no permissions");
        }
        if self.match_repository.is_none() && self.match_username.is_none() {
            bail!("RBAC policy needs at least one of \"match_repository\" and \"match_username\"");
        }

        let has_anonymous = self.permissions.iter().any(RbacPermission::is_anonymous);
        let has_named = self.permissions.iter().any(|p| !p.is_anonymous());
        if has_anonymous && self.match_username.is_some() {
            bail!("RBAC policy with anonymous permissions cannot match user names");
        }
        if has_anonymous && has_named {
            bail!("RBAC policy cannot mix anonymous and authenticated permissions");
        }
        if has_named && self.match_username.is_none() {
            bail!("RBAC policy with authenticated permissions needs \"match_username\"");
        }

        for (field, pattern) in [
            ("match_repository", &self.match_repository),
            ("match_username", &self.match_username),
        ] {
            if let Some(pattern) = pattern {
                Regex::new(&format!("^(?:{pattern})$"))
                    .map_err(|err| format_err!("invalid regex in {field}: {err}"))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(json: &str) -> RbacPolicy {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn valid_policies() {
        policy(
            r#"{
                "match_repository": "library/.*",
                "match_username": ".*@ci",
                "permissions": ["pull", "push"]
            }"#,
        )
        .validate()
        .unwrap();

        policy(
            r#"{
                "match_repository": "public/.*",
                "permissions": ["anonymous_pull"]
            }"#,
        )
        .validate()
        .unwrap();
    }

    #[test]
    fn invalid_policies() {
        // no permissions
        assert!(policy(r#"{"match_repository": ".*", "permissions": []}"#)
            .validate()
            .is_err());
        // no matchers at all
        assert!(policy(r#"{"permissions": ["pull"]}"#).validate().is_err());
        // anonymous permissions cannot be user-scoped
        assert!(policy(
            r#"{
                "match_repository": ".*",
                "match_username": "alice",
                "permissions": ["anonymous_pull"]
            }"#,
        )
        .validate()
        .is_err());
        // authenticated permissions need a username matcher
        assert!(
            policy(r#"{"match_repository": ".*", "permissions": ["push"]}"#)
                .validate()
                .is_err()
        );
        // broken regex
        assert!(policy(
            r#"{"match_repository": "*oops", "permissions": ["anonymous_pull"]}"#,
        )
        .validate()
        .is_err());
    }

    #[test]
    fn permission_wire_names() {
        let policy = policy(
            r#"{"match_repository": ".*", "permissions": ["anonymous_first_pull"]}"#,
        );
        assert_eq!(policy.permissions, vec![RbacPermission::AnonymousFirstPull]);
        let json = serde_json::to_string(&policy.permissions).unwrap();
        assert_eq!(json, r#"["anonymous_first_pull"]"#);
    }
}
