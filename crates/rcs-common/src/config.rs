//! ---
//! rcs_section: "01-core-functionality"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "Shared primitives and utilities for the supervisor runtime."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("/var/log/supervisor")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_official_url() -> String {
    "https://github.com/Seeed-Studio/reCamera-OS/releases/latest".to_owned()
}

fn default_fallback_url() -> String {
    "https://files.seeedstudio.com/reCamera".to_owned()
}

fn default_manifest_file_name() -> String {
    "sg2002_recamera_emmc_md5sum.txt".to_owned()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/recamera.conf")
}

fn default_files_dir() -> PathBuf {
    PathBuf::from("/tmp/upgrade")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("/userdata/.upgrade")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/tmp/supervisor")
}

fn default_staging_mount() -> PathBuf {
    PathBuf::from("/tmp/recovery_mount")
}

fn default_fip_device() -> PathBuf {
    PathBuf::from("/dev/mmcblk0boot0")
}

fn default_boot_device() -> PathBuf {
    PathBuf::from("/dev/mmcblk0p1")
}

fn default_rootfs_a() -> PathBuf {
    PathBuf::from("/dev/mmcblk0p3")
}

fn default_rootfs_b() -> PathBuf {
    PathBuf::from("/dev/mmcblk0p4")
}

fn default_recovery_device() -> PathBuf {
    PathBuf::from("/dev/mmcblk0p5")
}

fn default_fip_force_ro() -> PathBuf {
    PathBuf::from("/sys/block/mmcblk0boot0/force_ro")
}

fn default_staging_fs_type() -> String {
    "ext4".to_owned()
}

fn default_boot_failed_limit() -> u32 {
    5
}

/// Primary configuration object for the supervisor runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub upgrade: UpgradeConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub partitions: PartitionConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file was found and built-in defaults are in effect.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "RCS_CONFIG";

    /// Load configuration, respecting the `RCS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// Unlike an explicit `RCS_CONFIG`, missing candidates are not an error: the
    /// device ships with working defaults and the file only overrides them.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found, using defaults"
        );
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.upgrade.validate()?;
        self.partitions.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Where release manifests are resolved from.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// "Latest release" redirector of the official channel.
    #[serde(default = "default_official_url")]
    pub official_url: String,
    /// Secondary endpoint; `<fallback_url>/latest` returns a bare version string.
    #[serde(default = "default_fallback_url")]
    pub fallback_url: String,
    /// File name of the download-level checksum manifest.
    #[serde(default = "default_manifest_file_name")]
    pub manifest_file_name: String,
    #[serde(default = "default_http_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub http_timeout: Duration,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            official_url: default_official_url(),
            fallback_url: default_fallback_url(),
            manifest_file_name: default_manifest_file_name(),
            http_timeout: default_http_timeout(),
        }
    }
}

impl UpgradeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.manifest_file_name.trim().is_empty() {
            return Err(anyhow!("upgrade.manifest_file_name must not be empty"));
        }
        for (field, value) in [
            ("official_url", &self.official_url),
            ("fallback_url", &self.fallback_url),
        ] {
            Url::parse(value)
                .with_context(|| format!("upgrade.{field} is not a valid URL: {value}"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Persistent configuration directory (channel record).
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Cached manifest, version record and base URL.
    #[serde(default = "default_files_dir")]
    pub files_dir: PathBuf,
    /// Temporary location of the package while it downloads.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Progress, cancel and done markers.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_staging_mount")]
    pub staging_mount: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            files_dir: default_files_dir(),
            download_dir: default_download_dir(),
            work_dir: default_work_dir(),
            staging_mount: default_staging_mount(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    #[serde(default = "default_fip_device")]
    pub fip: PathBuf,
    #[serde(default = "default_boot_device")]
    pub boot: PathBuf,
    #[serde(default = "default_rootfs_a")]
    pub rootfs_a: PathBuf,
    #[serde(default = "default_rootfs_b")]
    pub rootfs_b: PathBuf,
    #[serde(default = "default_recovery_device")]
    pub recovery: PathBuf,
    /// sysfs toggle guarding the FIP boot partition.
    #[serde(default = "default_fip_force_ro")]
    pub fip_force_ro: PathBuf,
    #[serde(default = "default_staging_fs_type")]
    pub staging_fs_type: String,
    #[serde(default = "default_boot_failed_limit")]
    pub boot_failed_limit: u32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            fip: default_fip_device(),
            boot: default_boot_device(),
            rootfs_a: default_rootfs_a(),
            rootfs_b: default_rootfs_b(),
            recovery: default_recovery_device(),
            fip_force_ro: default_fip_force_ro(),
            staging_fs_type: default_staging_fs_type(),
            boot_failed_limit: default_boot_failed_limit(),
        }
    }
}

impl PartitionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rootfs_a == self.rootfs_b {
            return Err(anyhow!(
                "rootfs banks must be distinct devices, both are {}",
                self.rootfs_a.display()
            ));
        }
        if self.recovery == self.rootfs_a || self.recovery == self.rootfs_b {
            return Err(anyhow!(
                "recovery partition {} overlaps a rootfs bank",
                self.recovery.display()
            ));
        }
        if self.staging_fs_type.trim().is_empty() {
            return Err(anyhow!("partitions.staging_fs_type must not be empty"));
        }
        if self.boot_failed_limit == 0 {
            return Err(anyhow!("partitions.boot_failed_limit must be at least 1"));
        }
        Ok(())
    }
}
