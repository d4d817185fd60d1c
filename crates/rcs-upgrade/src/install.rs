//! ---
//! rcs_section: "02-upgrade-engine"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "OTA upgrade orchestration for dual-bank devices."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
//! Flashing of package images onto raw partitions.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tracing::{info, warn};
use zip::ZipArchive;

use crate::error::{Result, UpgradeError};
use crate::manifest::{PackageManifest, PACKAGE_MANIFEST_NAME};
use crate::partition::ImageDescriptor;
use crate::state::{StateStore, UpgradeStatus};

/// Writer that hashes every byte it forwards.
struct HashingWriter<W> {
    inner: W,
    hasher: Md5,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
        }
    }

    fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Lifts a sysfs write-protect toggle and restores it on drop.
struct WriteProtectGuard {
    path: PathBuf,
}

impl WriteProtectGuard {
    fn lift(path: &Path) -> Result<Self> {
        fs::write(path, b"0").map_err(|err| {
            UpgradeError::Partition(format!(
                "clearing write protection {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for WriteProtectGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::write(&self.path, b"1") {
            warn!(path = %self.path.display(), error = %err, "failed restoring write protection");
        }
    }
}

/// An opened OTA archive together with its per-image manifest.
pub struct PackageInstaller<R> {
    archive: ZipArchive<R>,
    manifest: PackageManifest,
}

impl PackageInstaller<File> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| {
            UpgradeError::Partition(format!("OTA package {} unavailable: {err}", path.display()))
        })?;
        Self::from_reader(file)
    }
}

impl<R: Read + Seek> PackageInstaller<R> {
    pub fn from_reader(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader)?;
        let manifest = match archive.by_name(PACKAGE_MANIFEST_NAME) {
            Ok(entry) => PackageManifest::parse(entry)?,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(UpgradeError::Manifest(format!(
                    "package has no {PACKAGE_MANIFEST_NAME}"
                )))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self { archive, manifest })
    }

    pub fn manifest(&self) -> &PackageManifest {
        &self.manifest
    }

    /// Stream one image onto its device, hashing what is written, and check
    /// the digest against the package manifest.
    pub fn write_image(&mut self, image: &ImageDescriptor) -> Result<u64> {
        let expected = self
            .manifest
            .expected_md5(image.source_name)
            .ok_or_else(|| {
                UpgradeError::Manifest(format!("no checksum listed for {}", image.source_name))
            })?
            .to_owned();
        let mut entry = match self.archive.by_name(image.source_name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(UpgradeError::Manifest(format!(
                    "{} missing from package",
                    image.source_name
                )))
            }
            Err(err) => return Err(err.into()),
        };

        let _protect = match &image.write_protect {
            Some(path) => Some(WriteProtectGuard::lift(path)?),
            None => None,
        };
        let device = OpenOptions::new()
            .write(true)
            .open(&image.device)
            .map_err(|err| {
                UpgradeError::Partition(format!("open {}: {err}", image.device.display()))
            })?;
        let mut writer = HashingWriter::new(device);
        let written = io::copy(&mut entry, &mut writer).map_err(|err| {
            UpgradeError::Partition(format!("write {}: {err}", image.device.display()))
        })?;
        writer.flush()?;
        let (device, actual) = writer.finish();
        device.sync_all().map_err(|err| {
            UpgradeError::Partition(format!("sync {}: {err}", image.device.display()))
        })?;

        if actual != expected {
            return Err(UpgradeError::Integrity {
                subject: image.source_name.to_owned(),
                expected,
                actual,
            });
        }
        info!(
            image = image.source_name,
            device = %image.device.display(),
            bytes = written,
            "image written and verified"
        );
        Ok(written)
    }

    /// Flash every image in order. Optional images that fail are logged and
    /// skipped; a failing required image aborts with its error.
    pub fn install_all(&mut self, images: &[ImageDescriptor], store: &StateStore) -> Result<()> {
        for image in images {
            store.update_progress(image.progress, UpgradeStatus::Upgrade)?;
            match self.write_image(image) {
                Ok(_) => {}
                Err(err) if !image.required => {
                    warn!(image = image.source_name, error = %err, "optional image skipped");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
