//! Parsing of image manifests into their reference sets.
//!
//! The janitor never interprets manifests beyond what reconciliation
//! needs: which blobs and child manifests they reference, and how large
//! the described image is. Four media types are understood, the two
//! Docker schema 2 types and their OCI equivalents.

use std::collections::BTreeSet;

use anyhow::{bail, format_err, Error};
use serde::Deserialize;

use stevedore_api_types::Digest;

pub mod media_types {
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

    pub fn is_image_list(media_type: &str) -> bool {
        media_type == DOCKER_MANIFEST_LIST || media_type == OCI_INDEX
    }
}

/// What reconciliation needs to know about one manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedManifest {
    /// Total image size: the manifest bytes plus all referenced blobs
    /// resp. the descriptor sizes of all referenced child manifests.
    pub size_bytes: u64,
    /// Digests of the config and layer blobs. Empty for image lists.
    pub blob_digests: BTreeSet<String>,
    /// Digests of child manifests. Empty for plain image manifests.
    pub child_digests: BTreeSet<String>,
}

#[derive(Deserialize)]
struct Descriptor {
    digest: String,
    size: u64,
    #[serde(default)]
    platform: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ImageManifest {
    config: Descriptor,
    layers: Vec<Descriptor>,
}

#[derive(Deserialize)]
struct ImageList {
    manifests: Vec<Descriptor>,
}

fn checked_digest(raw: &str) -> Result<String, Error> {
    let digest: Digest = raw
        .parse()
        .map_err(|err| format_err!("manifest contains invalid reference: {err}"))?;
    Ok(digest.to_string())
}

/// Parses manifest bytes according to the media type stored for them.
pub fn parse_manifest(media_type: &str, contents: &[u8]) -> Result<ParsedManifest, Error> {
    match media_type {
        media_types::DOCKER_MANIFEST | media_types::OCI_MANIFEST => {
            let manifest: ImageManifest = serde_json::from_slice(contents)?;

            let mut size_bytes = contents.len() as u64 + manifest.config.size;
            let mut blob_digests = BTreeSet::new();
            blob_digests.insert(checked_digest(&manifest.config.digest)?);
            for layer in &manifest.layers {
                size_bytes += layer.size;
                blob_digests.insert(checked_digest(&layer.digest)?);
            }

            Ok(ParsedManifest {
                size_bytes,
                blob_digests,
                child_digests: BTreeSet::new(),
            })
        }
        media_types::DOCKER_MANIFEST_LIST | media_types::OCI_INDEX => {
            let list: ImageList = serde_json::from_slice(contents)?;

            let mut size_bytes = contents.len() as u64;
            let mut child_digests = BTreeSet::new();
            for entry in &list.manifests {
                // Entries without a platform are attestation artifacts;
                // they are not replicated as child manifests, so they do
                // not contribute references.
                if entry.platform.is_none() {
                    continue;
                }
                size_bytes += entry.size;
                child_digests.insert(checked_digest(&entry.digest)?);
            }

            Ok(ParsedManifest {
                size_bytes,
                blob_digests: BTreeSet::new(),
                child_digests,
            })
        }
        other => bail!("unsupported manifest media type: {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 1469,
            "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000001"
        },
        "layers": [
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": 2000,
                "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000002"
            },
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": 3000,
                "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000003"
            }
        ]
    }"#;

    const OCI_INDEX_WITH_ATTESTATION: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "size": 100,
                "digest": "sha256:00000000000000000000000000000000000000000000000000000000000000aa",
                "platform": {"architecture": "amd64", "os": "linux"}
            },
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "size": 120,
                "digest": "sha256:00000000000000000000000000000000000000000000000000000000000000bb",
                "platform": {"architecture": "arm64", "os": "linux"}
            },
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "size": 80,
                "digest": "sha256:00000000000000000000000000000000000000000000000000000000000000cc",
                "annotations": {"vnd.docker.reference.type": "attestation-manifest"}
            }
        ]
    }"#;

    #[test]
    fn parse_image_manifest() {
        let parsed =
            parse_manifest(media_types::DOCKER_MANIFEST, IMAGE_MANIFEST.as_bytes()).unwrap();
        assert_eq!(parsed.blob_digests.len(), 3);
        assert!(parsed.child_digests.is_empty());
        assert_eq!(
            parsed.size_bytes,
            IMAGE_MANIFEST.len() as u64 + 1469 + 2000 + 3000,
        );
    }

    #[test]
    fn parse_index_skips_platformless_entries() {
        let parsed = parse_manifest(
            media_types::OCI_INDEX,
            OCI_INDEX_WITH_ATTESTATION.as_bytes(),
        )
        .unwrap();
        assert!(parsed.blob_digests.is_empty());
        assert_eq!(parsed.child_digests.len(), 2);
        assert!(!parsed.child_digests.contains(
            "sha256:00000000000000000000000000000000000000000000000000000000000000cc"
        ));
        assert_eq!(
            parsed.size_bytes,
            OCI_INDEX_WITH_ATTESTATION.len() as u64 + 100 + 120,
        );
    }

    #[test]
    fn parse_rejects_unknown_media_type() {
        assert!(parse_manifest("application/json", b"{}").is_err());
    }

    #[test]
    fn parse_rejects_invalid_digests() {
        let doctored = IMAGE_MANIFEST.replace("sha256:", "md5:");
        assert!(parse_manifest(media_types::DOCKER_MANIFEST, doctored.as_bytes()).is_err());
    }
}
