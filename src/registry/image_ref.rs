//! Image references as handed to the scanner and written to logs.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};

use stevedore_api_types::{is_valid_account_name, is_valid_repo_name, Digest};

/// A fully qualified reference to one image: `account/repo@sha256:…` or
/// `account/repo:tag`. The account is always the first path segment; the
/// rest of the path is the repository name within the account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    pub account_name: String,
    pub repo_name: String,
    pub reference: ManifestRef,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestRef {
    Digest(Digest),
    Tag(String),
}

impl ImageRef {
    pub fn by_digest(account_name: &str, repo_name: &str, digest: Digest) -> Self {
        Self {
            account_name: account_name.to_string(),
            repo_name: repo_name.to_string(),
            reference: ManifestRef::Digest(digest),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.reference {
            ManifestRef::Digest(digest) => {
                write!(f, "{}/{}@{}", self.account_name, self.repo_name, digest)
            }
            ManifestRef::Tag(tag) => {
                write!(f, "{}/{}:{}", self.account_name, self.repo_name, tag)
            }
        }
    }
}

impl FromStr for ImageRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (path, reference) = if let Some((path, digest)) = s.split_once('@') {
            (path, ManifestRef::Digest(digest.parse()?))
        } else if let Some((path, tag)) = s.rsplit_once(':') {
            if tag.is_empty() || tag.len() > 128 {
                bail!("invalid tag in image reference: {s:?}");
            }
            (path, ManifestRef::Tag(tag.to_string()))
        } else {
            bail!("image reference has neither tag nor digest: {s:?}");
        };

        let (account_name, repo_name) = match path.split_once('/') {
            Some(parts) => parts,
            None => bail!("image reference is missing the account: {s:?}"),
        };
        if !is_valid_account_name(account_name) {
            bail!("invalid account name in image reference: {account_name:?}");
        }
        if !is_valid_repo_name(repo_name) {
            bail!("invalid repository name in image reference: {repo_name:?}");
        }

        Ok(ImageRef {
            account_name: account_name.to_string(),
            repo_name: repo_name.to_string(),
            reference,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn round_trip_by_digest() {
        let reference: ImageRef = format!("abcde/library/alpine@{DIGEST}").parse().unwrap();
        assert_eq!(reference.account_name, "abcde");
        assert_eq!(reference.repo_name, "library/alpine");
        assert_eq!(
            reference.to_string(),
            format!("abcde/library/alpine@{DIGEST}"),
        );
    }

    #[test]
    fn round_trip_by_tag() {
        let reference: ImageRef = "abcde/app:v1.2".parse().unwrap();
        assert_eq!(reference.reference, ManifestRef::Tag("v1.2".to_string()));
        assert_eq!(reference.to_string(), "abcde/app:v1.2");
    }

    #[test]
    fn rejects_malformed_references() {
        assert!("no-reference".parse::<ImageRef>().is_err());
        assert!("missing-account@sha256:0000".parse::<ImageRef>().is_err());
        assert!("abcde/app:".parse::<ImageRef>().is_err());
        assert!(format!("UPPER/app@{DIGEST}").parse::<ImageRef>().is_err());
    }
}
