//! ---
//! rcs_section: "02-upgrade-engine"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "OTA upgrade orchestration for dual-bank devices."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
//! Resolution of the release manifest for the configured update channel.

use rcs_common::config::UpgradeConfig;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::download::Downloader;
use crate::error::{Result, UpgradeError};
use crate::manifest::VersionManifestEntry;
use crate::state::{ChannelConfig, LatestVersionStatus, StateStore, VersionRecord};

/// Finds, downloads and caches the latest release manifest.
#[derive(Debug, Clone)]
pub struct VersionResolver {
    no_redirect: Client,
    client: Client,
    downloader: Downloader,
    official_url: String,
    fallback_url: String,
    manifest_file_name: String,
}

impl VersionResolver {
    pub fn new(config: &UpgradeConfig) -> Result<Self> {
        let no_redirect = Client::builder()
            .redirect(Policy::none())
            .timeout(config.http_timeout)
            .build()?;
        let client = Client::builder().timeout(config.http_timeout).build()?;
        Ok(Self {
            no_redirect,
            downloader: Downloader::from_client(client.clone()),
            client,
            official_url: config.official_url.clone(),
            fallback_url: config.fallback_url.trim_end_matches('/').to_owned(),
            manifest_file_name: config.manifest_file_name.clone(),
        })
    }

    /// URL of the release manifest for `channel`.
    ///
    /// Custom channels point straight at their manifest. The official channel
    /// follows the release redirector by hand and falls back to the secondary
    /// endpoint when that fails.
    pub async fn manifest_url(&self, channel: &ChannelConfig) -> Result<String> {
        if let Some(url) = channel.custom_manifest_url() {
            debug!(channel = channel.channel_id, url, "using custom channel manifest");
            return Ok(url.to_owned());
        }
        match self.official_manifest_url().await {
            Ok(url) => Ok(url),
            Err(err) => {
                warn!(error = %err, "release redirector failed, using fallback endpoint");
                self.fallback_manifest_url().await
            }
        }
    }

    async fn official_manifest_url(&self) -> Result<String> {
        let response = self.no_redirect.get(&self.official_url).send().await?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                UpgradeError::Network(format!(
                    "{} answered {} without a redirect location",
                    self.official_url,
                    response.status()
                ))
            })?;
        let location = response
            .url()
            .join(location)
            .map_err(|err| UpgradeError::Network(format!("bad redirect location: {err}")))?;
        Ok(release_asset_url(location.as_str(), &self.manifest_file_name))
    }

    async fn fallback_manifest_url(&self) -> Result<String> {
        let url = format!("{}/latest", self.fallback_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpgradeError::Network(format!("GET {url} returned {status}")));
        }
        let body = response.text().await?;
        let version = body.trim();
        if version.is_empty() {
            return Err(UpgradeError::Network(format!("{url} returned no version")));
        }
        Ok(format!(
            "{}/{}/{}",
            self.fallback_url, version, self.manifest_file_name
        ))
    }

    /// Resolve, download and parse the latest manifest, caching the manifest,
    /// the version record and the package base URL in `store`.
    pub async fn query_latest(&self, store: &StateStore) -> Result<VersionManifestEntry> {
        let channel = store.read_channel();
        let manifest_url = self.manifest_url(&channel).await?;
        let manifest_path = store.manifest_path();
        self.downloader
            .download_file(&manifest_url, &manifest_path)
            .await?;
        let entry = VersionManifestEntry::from_file(&manifest_path)?;

        store.write_version(&VersionRecord {
            os_name: entry.os_name.clone(),
            os_version: entry.os_version.clone(),
            status: LatestVersionStatus::Available,
        })?;
        let base = base_url(&manifest_url, &self.manifest_file_name);
        store.write_base_url(&base)?;
        info!(
            os = %entry.os_name,
            version = %entry.os_version,
            package = %entry.file_name,
            base_url = %base,
            "latest release resolved"
        );
        Ok(entry)
    }
}

/// Rewrite a release tag page URL into the download URL of `asset`.
pub fn release_asset_url(location: &str, asset: &str) -> String {
    let download = location.replacen("/tag/", "/download/", 1);
    format!("{}/{}", download.trim_end_matches('/'), asset)
}

/// Manifest URL without its trailing `/<manifest file name>`.
pub fn base_url(manifest_url: &str, manifest_file_name: &str) -> String {
    let suffix = format!("/{manifest_file_name}");
    manifest_url
        .strip_suffix(&suffix)
        .unwrap_or(manifest_url)
        .to_owned()
}
