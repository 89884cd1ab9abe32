//! Client for the peer API of other registries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use stevedore_api_types::PeeringRequest;

/// Errors from talking to a peer.
///
/// `NotFound` is a *successful* answer from the peer saying the resource
/// does not exist; callers that delete local state based on it must not
/// confuse it with a transport failure, which says nothing about the
/// resource at all.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("not found on peer")]
    NotFound,

    #[error("peer returned unexpected status {0}")]
    UnexpectedStatus(StatusCode),

    #[error("cannot reach peer: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerTag {
    pub name: String,
    pub digest: String,
}

/// Payload of the last-pulled merge endpoint. Timestamps are keyed by
/// manifest digest resp. tag name; the receiving side takes the maximum
/// with its own values.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LastPulledMerge {
    pub manifests: HashMap<String, DateTime<Utc>>,
    pub tags: HashMap<String, DateTime<Utc>>,
}

impl LastPulledMerge {
    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty() && self.tags.is_empty()
    }
}

#[async_trait]
pub trait PeerApi: Send + Sync {
    /// Whether the primary still has this manifest. `Ok(false)` is a
    /// definitive "deleted upstream"; transport problems surface as
    /// errors instead.
    async fn check_manifest(&self, repo_full_name: &str, digest: &str)
        -> Result<bool, PeerError>;

    async fn get_tags(&self, repo_full_name: &str) -> Result<Vec<PeerTag>, PeerError>;

    /// The only write a replica ever performs against its primary.
    async fn merge_last_pulled(
        &self,
        repo_full_name: &str,
        merge: &LastPulledMerge,
    ) -> Result<(), PeerError>;

    /// Announces a freshly issued replication password. The peer answers
    /// `204 No Content` once it has stored the credentials.
    async fn post_peering(&self, req: &PeeringRequest) -> Result<(), PeerError>;

    /// Obtains a sublease token that authorizes creating a replica of the
    /// named account on this registry.
    async fn get_sublease_token(&self, account_name: &str) -> Result<String, PeerError>;
}

/// Replication credentials for authenticating against one peer.
#[derive(Clone, Debug)]
pub struct ReplicationCredentials {
    pub username: String,
    pub password: String,
    /// Password from one rotation earlier. Retried once on 401, which
    /// bridges the window where the peer has rotated but we have not yet
    /// observed it.
    pub previous_password: Option<String>,
}

pub struct HttpPeerClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Option<ReplicationCredentials>,
}

impl HttpPeerClient {
    pub fn new(base_url: Url, credentials: Option<ReplicationCredentials>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            credentials,
        }
    }

    fn url(&self, path: &str) -> Result<Url, PeerError> {
        self.base_url
            .join(path)
            .map_err(|_| PeerError::UnexpectedStatus(StatusCode::BAD_REQUEST))
    }

    /// Sends the request, retrying once with the previous password when
    /// the current one is rejected.
    async fn send(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, PeerError> {
        let creds = match &self.credentials {
            Some(creds) => creds,
            None => return Ok(build().send().await?),
        };

        let response = build()
            .basic_auth(&creds.username, Some(&creds.password))
            .send()
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(previous) = &creds.previous_password {
                return Ok(build()
                    .basic_auth(&creds.username, Some(previous))
                    .send()
                    .await?);
            }
        }
        Ok(response)
    }
}

#[async_trait]
impl PeerApi for HttpPeerClient {
    async fn check_manifest(
        &self,
        repo_full_name: &str,
        digest: &str,
    ) -> Result<bool, PeerError> {
        let url = self.url(&format!("v2/{repo_full_name}/manifests/{digest}"))?;
        let response = self.send(|| self.http.head(url.clone())).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(PeerError::UnexpectedStatus(status)),
        }
    }

    async fn get_tags(&self, repo_full_name: &str) -> Result<Vec<PeerTag>, PeerError> {
        #[derive(Deserialize)]
        struct TagList {
            tags: Vec<PeerTag>,
        }

        let url = self.url(&format!("stevedore/v1/repos/{repo_full_name}/tags"))?;
        let response = self.send(|| self.http.get(url.clone())).await?;
        if response.status() != StatusCode::OK {
            return Err(PeerError::UnexpectedStatus(response.status()));
        }
        let list: TagList = response.json().await?;
        Ok(list.tags)
    }

    async fn merge_last_pulled(
        &self,
        repo_full_name: &str,
        merge: &LastPulledMerge,
    ) -> Result<(), PeerError> {
        let url = self.url(&format!(
            "stevedore/v1/repos/{repo_full_name}/last-pulled"
        ))?;
        let response = self
            .send(|| self.http.post(url.clone()).json(merge))
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(PeerError::UnexpectedStatus(status)),
        }
    }

    async fn post_peering(&self, req: &PeeringRequest) -> Result<(), PeerError> {
        let url = self.url("stevedore/v1/auth/peering")?;
        let response = self.send(|| self.http.post(url.clone()).json(req)).await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(()),
            status => Err(PeerError::UnexpectedStatus(status)),
        }
    }

    async fn get_sublease_token(&self, account_name: &str) -> Result<String, PeerError> {
        #[derive(Deserialize)]
        struct SubleaseResponse {
            sublease_token: String,
        }

        let url = self.url(&format!("stevedore/v1/accounts/{account_name}/sublease"))?;
        let response = self.send(|| self.http.post(url.clone())).await?;
        if response.status() != StatusCode::OK {
            return Err(PeerError::UnexpectedStatus(response.status()));
        }
        let body: SubleaseResponse = response.json().await?;
        Ok(body.sublease_token)
    }
}

/// Hands out [PeerApi] clients by peer hostname.
pub trait PeerConnector: Send + Sync {
    fn connect(&self, hostname: &str) -> Result<Arc<dyn PeerApi>, anyhow::Error>;
}

/// Production connector. Credentials are registered by the embedding
/// process as it learns them; peers without registered credentials get an
/// anonymous client, which suffices for the peering endpoint.
pub struct HttpPeerConnector {
    scheme: &'static str,
    credentials: Mutex<HashMap<String, ReplicationCredentials>>,
}

impl HttpPeerConnector {
    pub fn new() -> Self {
        Self {
            scheme: "https",
            credentials: Mutex::new(HashMap::new()),
        }
    }

    /// Plain HTTP, for test setups only.
    pub fn new_insecure() -> Self {
        Self {
            scheme: "http",
            ..Self::new()
        }
    }

    pub fn set_credentials(&self, hostname: &str, credentials: ReplicationCredentials) {
        self.credentials
            .lock()
            .unwrap()
            .insert(hostname.to_string(), credentials);
    }
}

impl Default for HttpPeerConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerConnector for HttpPeerConnector {
    fn connect(&self, hostname: &str) -> Result<Arc<dyn PeerApi>, anyhow::Error> {
        let credentials = self.credentials.lock().unwrap().get(hostname).cloned();
        // external primaries are stored as full URLs, peers as bare
        // hostnames
        let base_url = if hostname.contains("://") {
            Url::parse(hostname)?
        } else {
            Url::parse(&format!("{}://{}/", self.scheme, hostname))?
        };
        Ok(Arc::new(HttpPeerClient::new(base_url, credentials)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_pulled_merge_wire_format() {
        let mut merge = LastPulledMerge::default();
        assert!(merge.is_empty());

        let at: DateTime<Utc> = "2025-03-01T10:00:00Z".parse().unwrap();
        merge.manifests.insert("sha256:abc".to_string(), at);
        merge.tags.insert("latest".to_string(), at);
        assert!(!merge.is_empty());

        let json = serde_json::to_value(&merge).unwrap();
        assert_eq!(json["manifests"]["sha256:abc"], "2025-03-01T10:00:00Z");
        assert_eq!(json["tags"]["latest"], "2025-03-01T10:00:00Z");

        let back: LastPulledMerge = serde_json::from_value(json).unwrap();
        assert_eq!(back.manifests.len(), 1);
        assert_eq!(back.tags.get("latest"), Some(&at));
    }
}
