//! ---
//! rcs_section: "02-upgrade-engine"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "OTA upgrade orchestration for dual-bank devices."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
//! Over-the-air upgrade engine for the reCamera supervisor.
//!
//! A session resolves the latest release for the configured channel, downloads
//! and checksums the package, stages it on the recovery partition, writes each
//! image to its partition while hashing the written bytes, and only then flips
//! the bootloader to the freshly written root filesystem bank. Every step is
//! mirrored into the [`StateStore`] so status queries never touch the session.

pub mod boot;
pub mod download;
pub mod error;
pub mod install;
pub mod manifest;
pub mod metrics;
pub mod orchestrator;
pub mod partition;
pub mod resolver;
pub mod state;
pub mod system;

pub use boot::BootSwitch;
pub use download::{verify_md5, CancelToken, Downloader, ProgressRange};
pub use error::{Result, UpgradeError};
pub use manifest::{PackageManifest, VersionManifestEntry};
pub use orchestrator::{SessionHandle, SessionOutcome, UpgradeManager};
pub use partition::{Bank, ImageDescriptor, PartitionPlan, StagingMount};
pub use resolver::VersionResolver;
pub use state::{
    ChannelConfig, LatestVersionStatus, StateStore, UpdateProgress, UpgradeStatus, VersionRecord,
};
pub use system::{BlockStorage, BootEnv, CommandExecutor, DeviceTools, ShellExecutor};
