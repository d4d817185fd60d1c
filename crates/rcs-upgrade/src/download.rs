//! ---
//! rcs_section: "02-upgrade-engine"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "Cancellable package transfer and MD5 verification."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use md5::{Digest, Md5};
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, UpgradeError};

/// Granularity of progress reporting and cancellation checks.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Cooperative cancellation shared between a session and its controllers.
///
/// Besides the in-memory flag the token can watch a marker file, so a second
/// process can stop a download by writing the marker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    marker: Option<PathBuf>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_marker(marker: impl Into<PathBuf>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            marker: Some(marker.into()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.marker {
            Some(marker) if marker.exists() => {
                self.flag.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(UpgradeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Slice of the overall progress bar a transfer maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressRange {
    pub start: u8,
    pub end: u8,
}

impl ProgressRange {
    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    /// `start + (done / total) * (end - start)`, truncated.
    pub fn at(&self, done: u64, total: u64) -> u8 {
        if total == 0 {
            return self.start;
        }
        let span = u64::from(self.end.saturating_sub(self.start));
        let offset = done.min(total).saturating_mul(span) / total;
        self.start.saturating_add(offset as u8)
    }
}

/// HTTP transfers of manifests and packages.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
}

impl Downloader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Fetch `url` into `dest` in one go. Non-2xx responses are network errors.
    pub async fn download_file(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpgradeError::Network(format!("GET {url} returned {status}")));
        }
        let body = response.bytes().await?;
        tokio::fs::write(dest, &body).await?;
        debug!(url, dest = %dest.display(), bytes = body.len(), "file downloaded");
        Ok(())
    }

    /// Stream `url` into `dest`, handing each percent above `range.start` to
    /// `report` as it is reached.
    ///
    /// Cancellation is checked after every chunk of at most [`CHUNK_SIZE`]
    /// bytes. A cancelled or failed transfer leaves the partial file behind for
    /// the caller to discard. Without a content length `report` is never
    /// called; progress only moves at phase boundaries.
    pub async fn download_file_with_progress<F>(
        &self,
        url: &str,
        dest: &Path,
        range: ProgressRange,
        cancel: &CancelToken,
        mut report: F,
    ) -> Result<u64>
    where
        F: FnMut(u8) -> Result<()>,
    {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpgradeError::Network(format!("GET {url} returned {status}")));
        }
        let total = response.content_length().filter(|len| *len > 0);
        let mut out = tokio::fs::File::create(dest).await?;
        let mut downloaded: u64 = 0;
        let mut last_reported = range.start;

        info!(url, dest = %dest.display(), total = ?total, "package download started");
        while let Some(bytes) = response.chunk().await? {
            for piece in bytes.chunks(CHUNK_SIZE) {
                cancel.check()?;
                out.write_all(piece).await?;
                downloaded += piece.len() as u64;
                if let Some(total) = total {
                    let percent = range.at(downloaded, total);
                    if percent > last_reported {
                        report(percent)?;
                        last_reported = percent;
                    }
                }
            }
        }
        out.flush().await?;
        out.sync_all().await?;
        cancel.check()?;

        if let Some(total) = total {
            if downloaded != total {
                return Err(UpgradeError::Network(format!(
                    "transfer of {url} ended after {downloaded} of {total} bytes"
                )));
            }
        }
        info!(url, bytes = downloaded, "package download finished");
        Ok(downloaded)
    }
}

/// Hash the whole file and compare with `expected` (hex, any case).
pub fn verify_md5(path: &Path, expected: &str) -> Result<()> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    std::io::copy(&mut file, &mut hasher)?;
    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(UpgradeError::Integrity {
            subject: path.display().to_string(),
            expected: expected.trim().to_ascii_lowercase(),
            actual,
        });
    }
    Ok(())
}

/// [`verify_md5`], deleting the file when it does not match.
pub fn verify_or_discard(path: &Path, expected: &str) -> Result<()> {
    let result = verify_md5(path, expected);
    if let Err(err) = &result {
        if err.is_integrity() {
            warn!(path = %path.display(), error = %err, "discarding corrupt download");
            if let Err(remove_err) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %remove_err, "failed removing corrupt download");
            }
        }
    }
    result
}
