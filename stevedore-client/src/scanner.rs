//! Client for the vulnerability scanner sidecar.
//!
//! The sidecar wraps Trivy: it pulls the image through the registry with
//! the token we hand it and returns the raw report JSON. The janitor
//! stores the payload verbatim (after policy enrichment) and never
//! interprets more of it than it has to.

use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("scanner returned unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    #[error("cannot reach scanner: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait ScannerApi: Send + Sync {
    /// Submits one manifest for scanning and waits for the report.
    /// `image_ref` is a full reference like `account/repo@sha256:…`;
    /// `pull_token` lets the scanner pull from the registry.
    async fn scan_manifest(
        &self,
        image_ref: &str,
        pull_token: &str,
    ) -> Result<serde_json::Value, ScannerError>;
}

pub struct HttpScannerClient {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpScannerClient {
    pub fn new(base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl ScannerApi for HttpScannerClient {
    async fn scan_manifest(
        &self,
        image_ref: &str,
        pull_token: &str,
    ) -> Result<serde_json::Value, ScannerError> {
        let mut url = self
            .base_url
            .join("trivy")
            .map_err(|_| ScannerError::UnexpectedStatus(StatusCode::BAD_REQUEST, String::new()))?;
        url.query_pairs_mut()
            .append_pair("image", image_ref)
            .append_pair("format", "json");

        let response = self
            .http
            .get(url)
            .bearer_auth(pull_token)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ScannerError::UnexpectedStatus(status, body));
        }
        Ok(response.json().await?)
    }
}
