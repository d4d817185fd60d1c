//! ---
//! rcs_section: "02-upgrade-engine"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "OTA upgrade orchestration for dual-bank devices."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
//! Checksum manifests at both levels: the release manifest naming the OTA
//! package, and the `md5sum.txt` shipped inside the package.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, UpgradeError};

/// Name of the per-image manifest inside the OTA archive.
pub const PACKAGE_MANIFEST_NAME: &str = "md5sum.txt";

static PACKAGE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*([0-9A-Fa-f]{32})\s+(\S+ota\.zip)\s*$")
        .expect("package manifest pattern compiles")
});

/// The OTA package line of a release manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionManifestEntry {
    /// Lowercase hex MD5 of the package.
    pub md5: String,
    pub file_name: String,
    pub os_name: String,
    pub os_version: String,
}

impl VersionManifestEntry {
    /// Find and parse the `<md5>  <name>ota.zip` line of a release manifest.
    ///
    /// The file name is split on `_`; the second token is the OS name and the
    /// third its version (`sg2002_reCamera_1.2.3_ota.zip`).
    pub fn parse(text: &str) -> Result<Self> {
        let captures = PACKAGE_LINE.captures(text).ok_or_else(|| {
            UpgradeError::Manifest("no `<md5> <name>ota.zip` line found".to_owned())
        })?;
        let md5 = captures[1].to_ascii_lowercase();
        let file_name = captures[2].to_owned();

        let mut tokens = file_name.split('_').skip(1);
        let (os_name, os_version) = match (tokens.next(), tokens.next()) {
            (Some(name), Some(version)) if !name.is_empty() && !version.is_empty() => {
                (name.to_owned(), version.to_owned())
            }
            _ => {
                return Err(UpgradeError::Manifest(format!(
                    "package name {file_name} does not carry OS name and version"
                )))
            }
        };

        Ok(Self {
            md5,
            file_name,
            os_name,
            os_version,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }
}

/// Image name to expected MD5, read from the package's own manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageManifest {
    digests: BTreeMap<String, String>,
}

impl PackageManifest {
    /// Parse `<md5> <fileName>` lines; lines with fewer fields are skipped.
    pub fn parse<R: Read>(reader: R) -> Result<Self> {
        let mut digests = BTreeMap::new();
        for line in BufReader::new(reader).lines() {
            let line = line?;
            let mut fields = line.split_whitespace();
            if let (Some(md5), Some(name)) = (fields.next(), fields.next()) {
                digests.insert(name.to_owned(), md5.to_ascii_lowercase());
            }
        }
        Ok(Self { digests })
    }

    pub fn expected_md5(&self, file_name: &str) -> Option<&str> {
        self.digests.get(file_name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}
