//! ---
//! rcs_section: "02-upgrade-engine"
//! rcs_subsection: "tests"
//! rcs_type: "source"
//! rcs_scope: "test"
//! rcs_description: "Manifest resolution across official, fallback and custom channels."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
mod common;

use common::{build_package, Device, ReleaseServer, PACKAGE_NAME};
use rcs_upgrade::{ChannelConfig, LatestVersionStatus, StateStore, VersionResolver};

#[tokio::test]
async fn official_channel_follows_release_redirect() {
    let mut device = Device::new();
    let name = device.config.upgrade.manifest_file_name.clone();
    let addr = ReleaseServer::new(build_package(&[]), &name).spawn().await;
    device.serve_from(addr);
    let resolver = VersionResolver::new(&device.config.upgrade).unwrap();

    let url = resolver
        .manifest_url(&ChannelConfig::default())
        .await
        .unwrap();
    assert_eq!(url, format!("http://{addr}/releases/download/0.2.0/{name}"));
}

#[tokio::test]
async fn missing_redirect_uses_fallback_endpoint() {
    let mut device = Device::new();
    let name = device.config.upgrade.manifest_file_name.clone();
    let addr = ReleaseServer::new(build_package(&[]), &name).spawn().await;
    device.serve_from(addr);
    device.config.upgrade.official_url = format!("http://{addr}/missing");
    let resolver = VersionResolver::new(&device.config.upgrade).unwrap();

    let url = resolver
        .manifest_url(&ChannelConfig::default())
        .await
        .unwrap();
    assert_eq!(url, format!("http://{addr}/fallback/0.3.0/{name}"));
}

#[tokio::test]
async fn custom_channel_url_is_used_verbatim() {
    let device = Device::new();
    let resolver = VersionResolver::new(&device.config.upgrade).unwrap();
    let channel = ChannelConfig::new(1, Some("http://mirror.local/os/md5sum.txt".into()));

    let url = resolver.manifest_url(&channel).await.unwrap();
    assert_eq!(url, "http://mirror.local/os/md5sum.txt");
}

#[tokio::test]
async fn query_caches_version_and_base_url() {
    let mut device = Device::new();
    let name = device.config.upgrade.manifest_file_name.clone();
    let addr = ReleaseServer::new(build_package(&[]), &name).spawn().await;
    device.serve_from(addr);
    let store = StateStore::new(&device.config.paths, name.clone());
    store.ensure_dirs().unwrap();
    let resolver = VersionResolver::new(&device.config.upgrade).unwrap();

    let entry = resolver.query_latest(&store).await.unwrap();
    assert_eq!(entry.file_name, PACKAGE_NAME);
    assert_eq!(entry.os_version, "0.2.0");
    assert!(store.manifest_path().exists());

    let record = store.read_version().unwrap();
    assert_eq!(record.os_name, "reCamera");
    assert_eq!(record.status, LatestVersionStatus::Available);
    assert_eq!(
        store.read_base_url().as_deref(),
        Some(format!("http://{addr}/releases/download/0.2.0").as_str())
    );
}

#[tokio::test]
async fn channel_update_is_idempotent() {
    let device = Device::new();
    let manager = device.manager();

    let first = manager
        .update_channel(1, Some("http://mirror.local/md5sum.txt".into()))
        .unwrap();
    let second = manager
        .update_channel(1, Some("http://mirror.local/md5sum.txt".into()))
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(manager.get_channel(), first);

    let official = manager.update_channel(0, Some(String::new())).unwrap();
    assert_eq!(official, ChannelConfig::default());
    assert_eq!(manager.get_channel().custom_manifest_url(), None);
}
