//! ---
//! rcs_section: "01-core-functionality"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "Shared primitives and utilities for the supervisor runtime."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
//! Shared primitives for the reCamera supervisor workspace.
//! This crate exposes configuration loading, logging, and version metadata
//! utilities consumed by the upgrade engine and the daemon binary.

pub mod config;
pub mod logging;
pub mod version;

pub use config::{
    AppConfig, LoadedAppConfig, LoggingConfig, PartitionConfig, PathsConfig, UpgradeConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use version::VersionInfo;
