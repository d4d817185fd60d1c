//! ---
//! rcs_section: "02-upgrade-engine"
//! rcs_subsection: "tests"
//! rcs_type: "source"
//! rcs_scope: "test"
//! rcs_description: "Shared fixtures for upgrade engine integration tests."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fs;
use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use rcs_common::config::AppConfig;
use rcs_upgrade::{BlockStorage, BootEnv, Result, UpgradeError, UpgradeManager};
use tempfile::TempDir;
use zip::write::FileOptions;
use zip::ZipWriter;

pub const PACKAGE_NAME: &str = "sg2002_reCamera_0.2.0_ota.zip";
pub const FIP: &[u8] = b"fip firmware 0.2.0";
pub const BOOT: &[u8] = b"kernel and dtb 0.2.0";
pub const ROOTFS: &[u8] = b"ext4 root filesystem 0.2.0";

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// OTA zip with the given images; `checksums` overrides listed digests.
pub fn build_package(checksums: &[(&str, &str)]) -> Vec<u8> {
    let images: [(&str, &[u8]); 3] = [
        ("fip.bin", FIP),
        ("boot.emmc", BOOT),
        ("rootfs_ext4.emmc", ROOTFS),
    ];
    let mut manifest = String::new();
    for (name, data) in images {
        let digest = checksums
            .iter()
            .find(|(listed, _)| *listed == name)
            .map(|(_, digest)| digest.to_string())
            .unwrap_or_else(|| md5_hex(data));
        manifest.push_str(&format!("{digest}  {name}\n"));
    }

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("md5sum.txt", FileOptions::default())
        .unwrap();
    writer.write_all(manifest.as_bytes()).unwrap();
    for (name, data) in images {
        writer.start_file(name, FileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Package body sent in pieces with a pause between them.
#[derive(Debug, Clone, Copy)]
pub struct Trickle {
    pub piece: usize,
    pub pause: Duration,
    /// Send `Content-Length`; otherwise the body is chunked.
    pub known_length: bool,
}

/// Release server: a redirector, a fallback endpoint and one release.
#[derive(Debug)]
pub struct ReleaseServer {
    pub package: Vec<u8>,
    pub manifest_file_name: String,
    pub package_delay: Duration,
    pub trickle: Option<Trickle>,
}

impl ReleaseServer {
    pub fn new(package: Vec<u8>, manifest_file_name: &str) -> Self {
        Self {
            package,
            manifest_file_name: manifest_file_name.to_owned(),
            package_delay: Duration::ZERO,
            trickle: None,
        }
    }

    pub fn with_trickle(mut self, trickle: Trickle) -> Self {
        self.trickle = Some(trickle);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.package_delay = delay;
        self
    }

    pub async fn spawn(self) -> SocketAddr {
        let manifest_route = format!("/releases/download/0.2.0/{}", self.manifest_file_name);
        let package_route = format!("/releases/download/0.2.0/{PACKAGE_NAME}");
        let app = Router::new()
            .route("/releases/latest", get(redirect_latest))
            .route("/missing", get(not_found))
            .route("/fallback/latest", get(fallback_latest))
            .route(&manifest_route, get(release_manifest))
            .route(&package_route, get(release_package))
            .with_state(Arc::new(self));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

async fn redirect_latest() -> impl IntoResponse {
    (
        StatusCode::FOUND,
        [(header::LOCATION, "/releases/tag/0.2.0")],
    )
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn fallback_latest() -> &'static str {
    "0.3.0\n"
}

async fn release_manifest(State(server): State<Arc<ReleaseServer>>) -> String {
    format!("{}  {}\n", md5_hex(&server.package), PACKAGE_NAME)
}

async fn release_package(State(server): State<Arc<ReleaseServer>>) -> Response {
    tokio::time::sleep(server.package_delay).await;
    let Some(trickle) = server.trickle else {
        return server.package.clone().into_response();
    };

    let total = server.package.len();
    let pieces = stream::unfold((server, 0usize), move |(server, offset)| async move {
        if offset >= server.package.len() {
            return None;
        }
        if offset > 0 {
            tokio::time::sleep(trickle.pause).await;
        }
        let end = (offset + trickle.piece).min(server.package.len());
        let piece = Bytes::copy_from_slice(&server.package[offset..end]);
        Some((Ok::<_, Infallible>(piece), (server, end)))
    });
    let mut response = Body::from_stream(pieces).into_response();
    if trickle.known_length {
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(total));
    }
    response
}

pub fn package_url(addr: SocketAddr) -> String {
    format!("http://{addr}/releases/download/0.2.0/{PACKAGE_NAME}")
}

/// Block devices backed by plain files; the staging mount is a directory.
///
/// Like the kernel, `unmount` refuses while this process still holds a file
/// open below the mount point.
#[derive(Debug)]
pub struct FileStorage {
    pub root_device: PathBuf,
    pub mounts: Mutex<Vec<PathBuf>>,
    pub formats: Mutex<usize>,
    pub mount_delay: Duration,
    /// When each mount started and finished.
    pub mount_windows: Mutex<Vec<(Instant, Instant)>>,
    /// Files found open by a refused unmount.
    pub busy_unmounts: Mutex<Vec<PathBuf>>,
}

impl FileStorage {
    pub fn new(root_device: PathBuf, mount_delay: Duration) -> Self {
        Self {
            root_device,
            mounts: Mutex::new(Vec::new()),
            formats: Mutex::new(0),
            mount_delay,
            mount_windows: Mutex::new(Vec::new()),
            busy_unmounts: Mutex::new(Vec::new()),
        }
    }
}

fn open_files_under(target: &Path) -> Vec<PathBuf> {
    let target = fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());
    let Ok(entries) = fs::read_dir("/proc/self/fd") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| fs::read_link(entry.path()).ok())
        .filter(|path| path.starts_with(&target))
        .collect()
}

impl BlockStorage for FileStorage {
    fn filesystem_type(&self, _device: &Path) -> Option<String> {
        (*self.formats.lock() > 0).then(|| "ext4".to_owned())
    }

    fn format(&self, _device: &Path, _fs_type: &str) -> Result<()> {
        *self.formats.lock() += 1;
        Ok(())
    }

    fn mount(&self, _device: &Path, target: &Path) -> Result<()> {
        let started = Instant::now();
        std::thread::sleep(self.mount_delay);
        self.mounts.lock().push(target.to_path_buf());
        self.mount_windows.lock().push((started, Instant::now()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let busy = open_files_under(target);
        if busy.is_empty() {
            return Ok(());
        }
        self.busy_unmounts.lock().extend(busy);
        Err(UpgradeError::Partition(format!(
            "{}: target is busy",
            target.display()
        )))
    }

    fn root_device(&self) -> Result<PathBuf> {
        Ok(self.root_device.clone())
    }
}

#[derive(Debug, Default)]
pub struct MemoryEnv {
    pub vars: Mutex<BTreeMap<String, String>>,
}

impl MemoryEnv {
    pub fn get(&self, name: &str) -> Option<String> {
        self.vars.lock().get(name).cloned()
    }
}

impl BootEnv for MemoryEnv {
    fn read_var(&self, name: &str) -> Result<Option<String>> {
        Ok(self.get(name))
    }

    fn write_var(&self, name: &str, value: &str) -> Result<()> {
        self.vars.lock().insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    fn clear_var(&self, name: &str) -> Result<()> {
        self.vars.lock().remove(name);
        Ok(())
    }
}

/// A device laid out in a temp dir, with bank A live.
pub struct Device {
    pub dir: TempDir,
    pub config: AppConfig,
    pub storage: Arc<FileStorage>,
    pub env: Arc<MemoryEnv>,
}

impl Device {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let mut config = AppConfig::default();
        config.paths.config_dir = root.join("conf");
        config.paths.files_dir = root.join("files");
        config.paths.download_dir = root.join("download");
        config.paths.work_dir = root.join("work");
        config.paths.staging_mount = root.join("staging");
        config.partitions.fip = root.join("mmcblk0boot0");
        config.partitions.boot = root.join("mmcblk0p1");
        config.partitions.recovery = root.join("mmcblk0p2");
        config.partitions.rootfs_a = root.join("mmcblk0p3");
        config.partitions.rootfs_b = root.join("mmcblk0p4");
        config.partitions.fip_force_ro = root.join("force_ro");
        config.upgrade.http_timeout = Duration::from_secs(5);

        for device in [
            &config.partitions.fip,
            &config.partitions.boot,
            &config.partitions.recovery,
            &config.partitions.rootfs_a,
            &config.partitions.rootfs_b,
        ] {
            fs::write(device, b"").unwrap();
        }
        fs::write(&config.partitions.fip_force_ro, b"1").unwrap();

        let storage = Arc::new(FileStorage::new(
            config.partitions.rootfs_a.clone(),
            Duration::ZERO,
        ));
        Self {
            dir,
            config,
            storage,
            env: Arc::new(MemoryEnv::default()),
        }
    }

    /// Make every mount block the calling thread for `delay`.
    pub fn with_mount_delay(mut self, delay: Duration) -> Self {
        self.storage = Arc::new(FileStorage::new(
            self.config.partitions.rootfs_a.clone(),
            delay,
        ));
        self
    }

    pub fn serve_from(&mut self, addr: SocketAddr) {
        self.config.upgrade.official_url = format!("http://{addr}/releases/latest");
        self.config.upgrade.fallback_url = format!("http://{addr}/fallback");
    }

    pub fn manager(&self) -> UpgradeManager {
        UpgradeManager::with_devices(&self.config, self.storage.clone(), self.env.clone()).unwrap()
    }

    pub fn read(&self, device: &Path) -> Vec<u8> {
        fs::read(device).unwrap()
    }
}
