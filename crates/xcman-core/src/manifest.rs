use std::collections::BTreeSet;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compare::is_server_version_higher;
use crate::packages::NOT_INSTALLED;
use crate::retry::RetryPolicy;

/// Connect and read timeout for manifest requests.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// One app build as published in the manifest, plus what this session
/// learned about it locally. Rebuilt from scratch on every fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    pub name: String,
    pub package_id: String,
    pub latest_version: String,
    pub apk_path: String,
    pub compatible_models: BTreeSet<String>,
    pub min_platform_version: String,
    pub installed_version: String,
    pub highest_server_version: String,
    pub resolved_download_name: String,
}

impl AppDescriptor {
    #[must_use]
    pub fn is_outdated(&self) -> bool {
        is_server_version_higher(
            &self.installed_version,
            &self.highest_server_version,
            &self.package_id,
        )
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        !crate::packages::is_not_installed(&self.installed_version)
    }
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    apps: Vec<RawApp>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawApp {
    name: String,
    package: String,
    latest_version: String,
    apk_path: String,
    #[serde(default)]
    compatible_models: BTreeSet<String>,
    #[serde(default)]
    min_android_version: String,
}

impl From<RawApp> for AppDescriptor {
    fn from(raw: RawApp) -> Self {
        Self {
            highest_server_version: raw.latest_version.clone(),
            name: raw.name,
            package_id: raw.package,
            latest_version: raw.latest_version,
            apk_path: raw.apk_path,
            compatible_models: raw.compatible_models,
            min_platform_version: raw.min_android_version,
            installed_version: NOT_INSTALLED.to_string(),
            resolved_download_name: String::new(),
        }
    }
}

/// Decode a manifest document. Unknown fields are ignored.
///
/// # Errors
/// Returns an error when the body is not a manifest JSON object.
pub fn parse_manifest(body: &str) -> Result<Vec<AppDescriptor>, serde_json::Error> {
    let manifest: RawManifest = serde_json::from_str(body)?;
    Ok(manifest.apps.into_iter().map(AppDescriptor::from).collect())
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to build manifest HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("failed to fetch {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} responded with HTTP {status}{body_snippet}")]
    HttpStatus {
        url: String,
        status: reqwest::StatusCode,
        body_snippet: String,
    },
    #[error("failed to parse manifest from {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest at {url} lists no apps")]
    Empty { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEndpoints {
    pub manifest_url: String,
    pub supplementary_url: String,
}

#[derive(Debug, Clone)]
pub struct ManifestClient {
    client: reqwest::Client,
    endpoints: ManifestEndpoints,
}

impl ManifestClient {
    /// Build a client with the fixed connect/read timeouts.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(endpoints: ManifestEndpoints) -> Result<Self, ManifestError> {
        Self::with_timeout(endpoints, FETCH_TIMEOUT)
    }

    /// Like [`ManifestClient::new`] with a custom timeout.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_timeout(
        endpoints: ManifestEndpoints,
        timeout: Duration,
    ) -> Result<Self, ManifestError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(format!("xcman/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ManifestError::ClientBuild)?;
        Ok(Self::with_client(client, endpoints))
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client, endpoints: ManifestEndpoints) -> Self {
        Self { client, endpoints }
    }

    #[must_use]
    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    #[must_use]
    pub fn endpoints(&self) -> &ManifestEndpoints {
        &self.endpoints
    }

    /// Fetch and decode the manifest once. An empty app list is returned
    /// as-is; [`ManifestClient::fetch_manifest_with_retry`] rejects it.
    ///
    /// # Errors
    /// Returns an error on transport failure, non-success status, or a body
    /// that does not decode.
    pub async fn fetch_manifest(&self) -> Result<Vec<AppDescriptor>, ManifestError> {
        let url = &self.endpoints.manifest_url;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| ManifestError::Request {
                url: url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body_snippet = response
                .text()
                .await
                .ok()
                .map(|body| response_snippet(&body, 160))
                .unwrap_or_default();
            return Err(ManifestError::HttpStatus {
                url: url.clone(),
                status,
                body_snippet,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|source| ManifestError::Request {
                url: url.clone(),
                source,
            })?;

        parse_manifest(&body).map_err(|source| ManifestError::Parse {
            url: url.clone(),
            source,
        })
    }

    /// Fetch the manifest under `policy`, treating an empty app list like
    /// any other failed attempt.
    ///
    /// # Errors
    /// Returns the last attempt's error once the retry budget is spent.
    pub async fn fetch_manifest_with_retry(
        &self,
        policy: &RetryPolicy,
    ) -> Result<Vec<AppDescriptor>, ManifestError> {
        let descriptors = policy
            .run("manifest fetch", move || async move {
                let descriptors = self.fetch_manifest().await?;
                if descriptors.is_empty() {
                    return Err(ManifestError::Empty {
                        url: self.endpoints.manifest_url.clone(),
                    });
                }
                Ok(descriptors)
            })
            .await?;

        info!("Fetched manifest with {} entries", descriptors.len());
        Ok(descriptors)
    }

    /// Fetch the single-line XCGuide version published outside the
    /// manifest. Any failure yields `None`.
    pub async fn fetch_supplementary_version(&self) -> Option<String> {
        let url = &self.endpoints.supplementary_url;
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(error) => {
                debug!("Supplementary version fetch failed: {error}");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(
                "Supplementary version fetch returned HTTP {}",
                response.status()
            );
            return None;
        }

        let body = response.text().await.ok()?;
        first_line(&body)
    }
}

fn first_line(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(ToString::to_string)
}

fn response_snippet(body: &str, max_chars: usize) -> String {
    let snippet: String = body.chars().take(max_chars).collect();
    if snippet.is_empty() {
        String::new()
    } else {
        format!(": {snippet}")
    }
}
