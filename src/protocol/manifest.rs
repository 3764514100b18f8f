//! Application manifests.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ManifestConfig;
use crate::error::ManifestError;

/// Metadata an app publishes about itself. Snapshotted into the registry on
/// connect and never refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    pub icon_url: Url,
    pub url: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_of_use_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_policy_url: Option<Url>,
}

impl Manifest {
    pub fn from_json(source: &Url, body: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Manifest =
            serde_json::from_slice(body).map_err(|e| ManifestError::Malformed {
                url: source.to_string(),
                reason: e.to_string(),
            })?;
        if manifest.name.trim().is_empty() {
            return Err(ManifestError::Malformed {
                url: source.to_string(),
                reason: "name is empty".to_string(),
            });
        }
        Ok(manifest)
    }

    /// Host the app proves ownership against in `ton_proof`.
    pub fn domain(&self) -> String {
        self.url.host_str().unwrap_or_default().to_string()
    }
}

#[async_trait]
pub trait ManifestLoader: Send + Sync {
    /// Single fetch; retry policy belongs to the caller.
    async fn load(&self, url: &Url) -> Result<Manifest, ManifestError>;
}

pub struct HttpManifestLoader {
    client: Client,
    max_bytes: usize,
}

impl HttpManifestLoader {
    pub fn new(config: &ManifestConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_millis(config.timeout_ms))
                .build()
                .unwrap_or_else(|_| Client::new()),
            max_bytes: config.max_bytes,
        }
    }
}

#[async_trait]
impl ManifestLoader for HttpManifestLoader {
    async fn load(&self, url: &Url) -> Result<Manifest, ManifestError> {
        let unreachable = |reason: String| ManifestError::Unreachable {
            url: url.to_string(),
            reason,
        };
        let too_large = || ManifestError::Malformed {
            url: url.to_string(),
            reason: format!("manifest exceeds {} bytes", self.max_bytes),
        };

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(unreachable(format!("HTTP {status}")));
        }
        if response
            .content_length()
            .is_some_and(|length| length > self.max_bytes as u64)
        {
            return Err(too_large());
        }

        // Content-Length may be absent or wrong.
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| unreachable(e.to_string()))?
        {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        let manifest = Manifest::from_json(url, &body)?;
        tracing::debug!(manifest_url = %url, app = %manifest.name, "Loaded app manifest");
        Ok(manifest)
    }
}
