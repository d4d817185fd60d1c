//! ---
//! rcs_section: "02-upgrade-engine"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "OTA upgrade orchestration for dual-bank devices."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
use thiserror::Error;

pub type Result<T> = std::result::Result<T, UpgradeError>;

#[derive(Debug, Error)]
pub enum UpgradeError {
    /// Transport failure, redirect problem or non-2xx status.
    #[error("network error: {0}")]
    Network(String),
    #[error("checksum mismatch for {subject}: expected {expected}, got {actual}")]
    Integrity {
        subject: String,
        expected: String,
        actual: String,
    },
    /// Format, mount, unmount or raw write failure on a block device.
    #[error("partition error: {0}")]
    Partition(String),
    #[error("state conflict: {0}")]
    StateConflict(&'static str),
    #[error("upgrade cancelled")]
    Cancelled,
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("package archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl From<reqwest::Error> for UpgradeError {
    fn from(err: reqwest::Error) -> Self {
        UpgradeError::Network(err.to_string())
    }
}

impl UpgradeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpgradeError::Cancelled)
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, UpgradeError::Integrity { .. })
    }

    pub fn is_state_conflict(&self) -> bool {
        matches!(self, UpgradeError::StateConflict(_))
    }
}
