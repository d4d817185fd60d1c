//! ---
//! rcs_section: "02-upgrade-engine"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "OTA upgrade orchestration for dual-bank devices."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
//! File-backed upgrade state shared between the running session and any
//! process that wants to observe it.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rcs_common::config::PathsConfig;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use tracing::{debug, warn};

use crate::error::Result;

const CHANNEL_FILE: &str = "upgrade";
const VERSION_FILE: &str = "version.json";
const BASE_URL_FILE: &str = "url.txt";
const PROGRESS_FILE: &str = "upgrade.prog";
const CANCEL_MARKER: &str = "upgrade.cancel";
const DONE_MARKER: &str = "upgrade.done";

/// Update channel selection, persisted as `<channelId>[,<overrideURL>]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub channel_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_url: Option<String>,
}

impl ChannelConfig {
    pub fn new(channel_id: i32, override_url: Option<String>) -> Self {
        let override_url = override_url.filter(|url| !url.trim().is_empty());
        Self {
            channel_id,
            override_url,
        }
    }

    /// Parse the on-disk record. An unparsable id reads as the official channel.
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.trim().splitn(2, ',');
        let channel_id = parts
            .next()
            .and_then(|id| id.trim().parse().ok())
            .unwrap_or_default();
        let override_url = parts.next().map(|url| url.trim().to_owned());
        Self::new(channel_id, override_url)
    }

    pub fn to_record(&self) -> String {
        match &self.override_url {
            Some(url) => format!("{},{}", self.channel_id, url),
            None => self.channel_id.to_string(),
        }
    }

    /// Manifest URL of a custom channel. Channel 0 always uses the official source.
    pub fn custom_manifest_url(&self) -> Option<&str> {
        if self.channel_id == 0 {
            return None;
        }
        self.override_url.as_deref()
    }
}

/// Phase of the current (or last) upgrade session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeStatus {
    #[default]
    Idle,
    Download,
    Upgrade,
    Failed,
    Cancelled,
    Done,
}

impl fmt::Display for UpgradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UpgradeStatus::Idle => "idle",
            UpgradeStatus::Download => "download",
            UpgradeStatus::Upgrade => "upgrade",
            UpgradeStatus::Failed => "failed",
            UpgradeStatus::Cancelled => "cancelled",
            UpgradeStatus::Done => "done",
        };
        f.write_str(label)
    }
}

/// Persisted progress record, `{"progress": <0-100>, "status": "<phase>"}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProgress {
    #[serde(rename = "progress")]
    pub percent: u8,
    pub status: UpgradeStatus,
}

impl UpdateProgress {
    pub fn new(percent: u8, status: UpgradeStatus) -> Self {
        Self {
            percent: percent.min(100),
            status,
        }
    }
}

/// Availability code reported by the latest-version query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum LatestVersionStatus {
    Available = 1,
    Upgrading = 2,
    Querying = 3,
}

/// Cached result of the last successful version query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    #[serde(default)]
    pub os_name: String,
    #[serde(default)]
    pub os_version: String,
    pub status: LatestVersionStatus,
}

impl VersionRecord {
    pub fn querying() -> Self {
        Self {
            os_name: String::new(),
            os_version: String::new(),
            status: LatestVersionStatus::Querying,
        }
    }
}

/// Durable markers describing channel, cached version and session progress.
#[derive(Debug, Clone)]
pub struct StateStore {
    config_dir: PathBuf,
    files_dir: PathBuf,
    download_dir: PathBuf,
    work_dir: PathBuf,
    manifest_file_name: String,
}

impl StateStore {
    pub fn new(paths: &PathsConfig, manifest_file_name: impl Into<String>) -> Self {
        Self {
            config_dir: paths.config_dir.clone(),
            files_dir: paths.files_dir.clone(),
            download_dir: paths.download_dir.clone(),
            work_dir: paths.work_dir.clone(),
            manifest_file_name: manifest_file_name.into(),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.config_dir,
            &self.files_dir,
            &self.download_dir,
            &self.work_dir,
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn manifest_file_name(&self) -> &str {
        &self.manifest_file_name
    }

    /// Cached download-level manifest.
    pub fn manifest_path(&self) -> PathBuf {
        self.files_dir.join(&self.manifest_file_name)
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn cancel_marker_path(&self) -> PathBuf {
        self.work_dir.join(CANCEL_MARKER)
    }

    fn channel_path(&self) -> PathBuf {
        self.config_dir.join(CHANNEL_FILE)
    }

    fn version_path(&self) -> PathBuf {
        self.files_dir.join(VERSION_FILE)
    }

    fn base_url_path(&self) -> PathBuf {
        self.files_dir.join(BASE_URL_FILE)
    }

    fn progress_path(&self) -> PathBuf {
        self.work_dir.join(PROGRESS_FILE)
    }

    fn done_marker_path(&self) -> PathBuf {
        self.work_dir.join(DONE_MARKER)
    }

    /// Absent or unreadable record means channel 0 without override.
    pub fn read_channel(&self) -> ChannelConfig {
        match fs::read_to_string(self.channel_path()) {
            Ok(raw) => ChannelConfig::parse(&raw),
            Err(_) => ChannelConfig::default(),
        }
    }

    pub fn write_channel(&self, channel: &ChannelConfig) -> Result<()> {
        write_atomic(&self.channel_path(), channel.to_record().as_bytes())?;
        debug!(channel = channel.channel_id, url = ?channel.override_url, "channel persisted");
        Ok(())
    }

    /// Cached version, ignoring records that carry no OS name.
    pub fn read_version(&self) -> Option<VersionRecord> {
        let raw = fs::read(self.version_path()).ok()?;
        let record: VersionRecord = serde_json::from_slice(&raw).ok()?;
        if record.os_name.is_empty() {
            return None;
        }
        Some(record)
    }

    pub fn write_version(&self, record: &VersionRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        write_atomic(&self.version_path(), &bytes)?;
        Ok(())
    }

    pub fn read_base_url(&self) -> Option<String> {
        let raw = fs::read_to_string(self.base_url_path()).ok()?;
        let url = raw.trim();
        if url.is_empty() {
            None
        } else {
            Some(url.to_owned())
        }
    }

    pub fn write_base_url(&self, url: &str) -> Result<()> {
        write_atomic(&self.base_url_path(), url.as_bytes())?;
        Ok(())
    }

    /// Overwrite the progress record via write-then-rename.
    pub fn update_progress(&self, percent: u8, status: UpgradeStatus) -> Result<()> {
        let progress = UpdateProgress::new(percent, status);
        let bytes = serde_json::to_vec(&progress)?;
        write_atomic(&self.progress_path(), &bytes)?;
        Ok(())
    }

    /// Progress as observed by status queries.
    ///
    /// A pending cancel marker wins over the record. Missing or corrupt records
    /// read as idle rather than failing the caller.
    pub fn read_progress(&self) -> UpdateProgress {
        if self.is_cancel_requested() {
            return UpdateProgress::new(0, UpgradeStatus::Cancelled);
        }
        self.read_progress_record().unwrap_or_default()
    }

    /// Percent of the last written record, regardless of cancel markers.
    pub fn last_reported_percent(&self) -> u8 {
        self.read_progress_record()
            .map(|progress| progress.percent)
            .unwrap_or_default()
    }

    fn read_progress_record(&self) -> Option<UpdateProgress> {
        let raw = fs::read(self.progress_path()).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(progress) => Some(progress),
            Err(err) => {
                warn!(path = %self.progress_path().display(), error = %err, "ignoring unparsable progress record");
                None
            }
        }
    }

    pub fn mark_cancelled(&self) -> Result<()> {
        write_atomic(&self.cancel_marker_path(), b"1")?;
        Ok(())
    }

    /// Forget the last session's progress; reads fall back to idle.
    pub fn clear_progress(&self) -> Result<()> {
        remove_if_exists(&self.progress_path())?;
        Ok(())
    }

    pub fn clear_cancel_marker(&self) -> Result<()> {
        remove_if_exists(&self.cancel_marker_path())?;
        Ok(())
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_marker_path().exists()
    }

    pub fn mark_done(&self) -> Result<()> {
        write_atomic(&self.done_marker_path(), b"1")?;
        Ok(())
    }

    /// An upgrade completed and the device must restart to boot it.
    pub fn is_done(&self) -> bool {
        self.done_marker_path().exists()
    }

    /// Drop the terminal markers of a previous session.
    pub fn clear_session_markers(&self) -> Result<()> {
        for path in [
            self.cancel_marker_path(),
            self.done_marker_path(),
            self.progress_path(),
        ] {
            remove_if_exists(&path)?;
        }
        Ok(())
    }

    /// Forget cached manifest, version and base URL along with partial downloads.
    pub fn clean_cache(&self) -> Result<()> {
        if self.files_dir.exists() {
            fs::remove_dir_all(&self.files_dir)?;
        }
        fs::create_dir_all(&self.files_dir)?;
        if self.download_dir.exists() {
            for entry in fs::read_dir(&self.download_dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
        }
        debug!(files_dir = %self.files_dir.display(), "upgrade cache cleaned");
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Write to a sibling temp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
