//! ---
//! rcs_section: "02-upgrade-engine"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "OTA upgrade orchestration for dual-bank devices."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcs_common::config::PartitionConfig;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::system::BlockStorage;

pub const FIP_IMAGE: &str = "fip.bin";
pub const BOOT_IMAGE: &str = "boot.emmc";
pub const ROOTFS_IMAGE: &str = "rootfs_ext4.emmc";

/// One of the two root filesystem banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Bank {
    A,
    B,
}

impl Bank {
    pub fn other(self) -> Bank {
        match self {
            Bank::A => Bank::B,
            Bank::B => Bank::A,
        }
    }

    /// Value of the bootloader's `use_part_b` selector for this bank.
    pub fn selector(self) -> &'static str {
        match self {
            Bank::A => "0",
            Bank::B => "1",
        }
    }

    pub fn from_selector(value: &str) -> Bank {
        if value.trim() == "1" {
            Bank::B
        } else {
            Bank::A
        }
    }
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bank::A => f.write_str("A"),
            Bank::B => f.write_str("B"),
        }
    }
}

/// A package image and where it is flashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// File name inside the OTA archive.
    pub source_name: &'static str,
    pub device: PathBuf,
    /// A failed required image fails the session; others are skipped with a warning.
    pub required: bool,
    /// sysfs write-protect toggle lifted for the duration of the write.
    pub write_protect: Option<PathBuf>,
    /// Progress reported before the image is written.
    pub progress: u8,
}

/// Static mapping of images to the device's partitions.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    pub fip: PathBuf,
    pub boot: PathBuf,
    pub rootfs_a: PathBuf,
    pub rootfs_b: PathBuf,
    pub recovery: PathBuf,
    pub fip_force_ro: PathBuf,
    pub staging_fs_type: String,
    pub staging_mount: PathBuf,
}

impl PartitionPlan {
    pub fn from_config(config: &PartitionConfig, staging_mount: impl Into<PathBuf>) -> Self {
        Self {
            fip: config.fip.clone(),
            boot: config.boot.clone(),
            rootfs_a: config.rootfs_a.clone(),
            rootfs_b: config.rootfs_b.clone(),
            recovery: config.recovery.clone(),
            fip_force_ro: config.fip_force_ro.clone(),
            staging_fs_type: config.staging_fs_type.clone(),
            staging_mount: staging_mount.into(),
        }
    }

    pub fn rootfs(&self, bank: Bank) -> &Path {
        match bank {
            Bank::A => &self.rootfs_a,
            Bank::B => &self.rootfs_b,
        }
    }

    /// Bank currently mounted as `/`, comparing resolved device paths.
    pub fn live_bank(&self, root_device: &Path) -> Bank {
        if resolve(root_device) == resolve(&self.rootfs_b) {
            Bank::B
        } else {
            Bank::A
        }
    }

    /// The bank that is not live; the only valid rootfs write target.
    pub fn target_bank(&self, root_device: &Path) -> Bank {
        self.live_bank(root_device).other()
    }

    /// Images to flash, in order, with `target` as the rootfs destination.
    pub fn images(&self, target: Bank) -> Vec<ImageDescriptor> {
        vec![
            ImageDescriptor {
                source_name: FIP_IMAGE,
                device: self.fip.clone(),
                required: false,
                write_protect: Some(self.fip_force_ro.clone()),
                progress: 55,
            },
            ImageDescriptor {
                source_name: BOOT_IMAGE,
                device: self.boot.clone(),
                required: false,
                write_protect: None,
                progress: 60,
            },
            ImageDescriptor {
                source_name: ROOTFS_IMAGE,
                device: self.rootfs(target).to_path_buf(),
                required: true,
                write_protect: None,
                progress: 65,
            },
        ]
    }
}

fn resolve(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Recovery partition mounted as package staging; unmounted on drop.
#[derive(Debug)]
pub struct StagingMount {
    storage: Arc<dyn BlockStorage>,
    mount_point: PathBuf,
}

impl StagingMount {
    /// Format the recovery partition when it does not carry the staging
    /// filesystem yet, then mount it.
    pub fn acquire(storage: Arc<dyn BlockStorage>, plan: &PartitionPlan) -> Result<Self> {
        let current = storage.filesystem_type(&plan.recovery);
        if current.as_deref() != Some(plan.staging_fs_type.as_str()) {
            warn!(
                device = %plan.recovery.display(),
                found = ?current,
                fs_type = %plan.staging_fs_type,
                "formatting staging partition"
            );
            storage.format(&plan.recovery, &plan.staging_fs_type)?;
        }
        fs::create_dir_all(&plan.staging_mount)?;
        storage.mount(&plan.recovery, &plan.staging_mount)?;
        info!(device = %plan.recovery.display(), mount = %plan.staging_mount.display(), "staging partition mounted");
        Ok(Self {
            storage,
            mount_point: plan.staging_mount.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.mount_point
    }
}

impl Drop for StagingMount {
    fn drop(&mut self) {
        if let Err(err) = self.storage.unmount(&self.mount_point) {
            warn!(mount = %self.mount_point.display(), error = %err, "failed unmounting staging partition");
            return;
        }
        if let Err(err) = fs::remove_dir(&self.mount_point) {
            debug!(mount = %self.mount_point.display(), error = %err, "staging mount point left in place");
        }
    }
}
