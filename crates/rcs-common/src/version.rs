//! ---
//! rcs_section: "01-core-functionality"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "Build metadata for the supervisor binaries."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---

/// Compile-time version metadata of the supervisor.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    /// Workspace semantic version.
    pub semver: String,
    /// Cargo profile used during compilation.
    pub profile: String,
}

impl VersionInfo {
    #[must_use]
    pub fn current() -> Self {
        let profile = if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        };
        Self {
            semver: env!("CARGO_PKG_VERSION").to_owned(),
            profile: profile.to_owned(),
        }
    }

    /// Human readable banner used in logging surfaces.
    #[must_use]
    pub fn banner(&self) -> String {
        format!("reCamera supervisor v{} ({})", self.semver, self.profile)
    }
}
