//! ---
//! rcs_section: "02-upgrade-engine"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "OTA upgrade orchestration for dual-bank devices."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
//! Upgrade sessions: `idle -> download (0-50%) -> upgrade (50-100%) -> done | failed | cancelled`.
//!
//! Only one session runs per process. Cancellation is honoured between
//! download chunks and once more before the upgrade phase; partition writes
//! and the boot switch always run to completion or failure.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rcs_common::config::AppConfig;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::boot::BootSwitch;
use crate::download::{verify_or_discard, CancelToken, Downloader, ProgressRange};
use crate::error::{Result, UpgradeError};
use crate::install::PackageInstaller;
use crate::manifest::VersionManifestEntry;
use crate::metrics;
use crate::partition::{Bank, PartitionPlan, StagingMount};
use crate::resolver::VersionResolver;
use crate::state::{
    ChannelConfig, LatestVersionStatus, StateStore, UpdateProgress, UpgradeStatus, VersionRecord,
};
use crate::system::{BlockStorage, BootEnv, CommandExecutor, DeviceTools};

const DOWNLOAD_RANGE: ProgressRange = ProgressRange::new(0, 50);
const UPGRADE_START: u8 = 50;
const SWITCH_PROGRESS: u8 = 95;
const DONE_PROGRESS: u8 = 100;

#[derive(Debug, Default)]
struct SessionFlags {
    downloading: bool,
    upgrading: bool,
    cancel: Option<CancelToken>,
}

impl SessionFlags {
    fn active(&self) -> bool {
        self.downloading || self.upgrading
    }
}

#[derive(Debug)]
struct ManagerInner {
    store: StateStore,
    resolver: VersionResolver,
    downloader: Downloader,
    storage: Arc<dyn BlockStorage>,
    boot: BootSwitch,
    plan: PartitionPlan,
    flags: Mutex<SessionFlags>,
    querying: AtomicBool,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Done,
    Cancelled,
    Failed(String),
}

impl SessionOutcome {
    pub fn status(&self) -> UpgradeStatus {
        match self {
            SessionOutcome::Done => UpgradeStatus::Done,
            SessionOutcome::Cancelled => UpgradeStatus::Cancelled,
            SessionOutcome::Failed(_) => UpgradeStatus::Failed,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            SessionOutcome::Done => "done",
            SessionOutcome::Cancelled => "cancelled",
            SessionOutcome::Failed(_) => "failed",
        }
    }
}

/// Handle on a running session. Dropping it detaches the session; its result
/// is still recorded in the state store.
#[derive(Debug)]
pub struct SessionHandle {
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub async fn wait(self) -> SessionOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => SessionOutcome::Failed(format!("session task aborted: {err}")),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Clears the session flags however the session ends.
struct FlagsReset(Arc<ManagerInner>);

impl Drop for FlagsReset {
    fn drop(&mut self) {
        let mut flags = self.0.flags.lock();
        flags.downloading = false;
        flags.upgrading = false;
        flags.cancel = None;
    }
}

/// Run device or hashing work off the async workers.
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| UpgradeError::Partition(format!("blocking task aborted: {err}")))?
}

/// The upgrade engine. Construct once at startup and share by clone.
#[derive(Debug, Clone)]
pub struct UpgradeManager {
    inner: Arc<ManagerInner>,
}

impl UpgradeManager {
    /// Manager driving real devices through `executor`.
    pub fn new(config: &AppConfig, executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        let tools = Arc::new(DeviceTools::new(executor));
        Self::with_devices(config, tools.clone(), tools)
    }

    pub fn with_devices(
        config: &AppConfig,
        storage: Arc<dyn BlockStorage>,
        boot_env: Arc<dyn BootEnv>,
    ) -> Result<Self> {
        config
            .partitions
            .validate()
            .map_err(|err| UpgradeError::Partition(err.to_string()))?;
        let store = StateStore::new(&config.paths, config.upgrade.manifest_file_name.clone());
        store.ensure_dirs()?;
        let inner = ManagerInner {
            store,
            resolver: VersionResolver::new(&config.upgrade)?,
            downloader: Downloader::new(config.upgrade.http_timeout)?,
            storage,
            boot: BootSwitch::new(boot_env, config.partitions.boot_failed_limit),
            plan: PartitionPlan::from_config(&config.partitions, config.paths.staging_mount.clone()),
            flags: Mutex::new(SessionFlags::default()),
            querying: AtomicBool::new(false),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    /// A session of this process is downloading or flashing.
    pub fn is_upgrading(&self) -> bool {
        self.inner.flags.lock().active()
    }

    /// An upgrade completed; a restart boots the new bank.
    pub fn is_upgrade_done(&self) -> bool {
        self.inner.store.is_done()
    }

    pub fn get_channel(&self) -> ChannelConfig {
        self.inner.store.read_channel()
    }

    /// Persist a new channel and drop everything cached for the old one.
    pub fn update_channel(&self, channel_id: i32, url: Option<String>) -> Result<ChannelConfig> {
        let flags = self.inner.flags.lock();
        if flags.active() {
            return Err(UpgradeError::StateConflict(
                "channel cannot change while an upgrade is running",
            ));
        }
        let channel = ChannelConfig::new(channel_id, url);
        self.inner.store.write_channel(&channel)?;
        self.inner.store.clean_cache()?;
        self.inner.store.clear_progress()?;
        drop(flags);
        info!(channel = channel.channel_id, url = ?channel.override_url, "update channel changed");
        Ok(channel)
    }

    pub fn clean(&self) -> Result<()> {
        self.inner.store.clean_cache()
    }

    /// Availability of a newer release.
    ///
    /// Reports upgrading while a session runs and the cached release when one
    /// is known. Otherwise a background query is started and `querying` is
    /// returned; callers poll again.
    pub fn latest_version_status(&self) -> VersionRecord {
        if self.is_upgrading() {
            return VersionRecord {
                status: LatestVersionStatus::Upgrading,
                ..VersionRecord::querying()
            };
        }
        if let Some(mut record) = self.inner.store.read_version() {
            record.status = LatestVersionStatus::Available;
            return record;
        }
        self.spawn_background_query();
        VersionRecord::querying()
    }

    fn spawn_background_query(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime available for background version query");
            return;
        };
        if self.inner.querying.swap(true, Ordering::SeqCst) {
            debug!("version query already in flight");
            return;
        }
        let manager = self.clone();
        runtime.spawn(async move {
            if let Err(err) = manager.query_latest_version().await {
                warn!(error = %err, "background version query failed");
            }
            manager.inner.querying.store(false, Ordering::SeqCst);
        });
    }

    /// Resolve and cache the latest release for the current channel.
    pub async fn query_latest_version(&self) -> Result<VersionManifestEntry> {
        self.inner.resolver.query_latest(&self.inner.store).await
    }

    /// Start an upgrade session in the background and return immediately.
    ///
    /// Fails with [`UpgradeError::StateConflict`] while another session runs,
    /// leaving that session's progress untouched, and when called outside a
    /// tokio runtime.
    pub fn update_system(&self) -> Result<SessionHandle> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            UpgradeError::StateConflict("upgrade sessions need an async runtime")
        })?;
        let token = {
            let mut flags = self.inner.flags.lock();
            if flags.active() {
                return Err(UpgradeError::StateConflict(
                    "an upgrade session is already running",
                ));
            }
            self.inner.store.clear_session_markers()?;
            self.inner
                .store
                .update_progress(0, UpgradeStatus::Download)?;
            let token = CancelToken::with_marker(self.inner.store.cancel_marker_path());
            flags.downloading = true;
            flags.cancel = Some(token.clone());
            token
        };
        metrics::record_started();
        info!("upgrade session started");

        let manager = self.clone();
        let task = runtime.spawn(async move { manager.run_session(token).await });
        Ok(SessionHandle { task })
    }

    /// Progress as seen by status queries, readable from any process.
    pub fn progress(&self) -> UpdateProgress {
        self.inner.store.read_progress()
    }

    /// Request cancellation of the running session.
    ///
    /// Only a download in progress reacts; once flashing started the session
    /// runs to its natural end.
    pub fn cancel_update(&self) -> Result<()> {
        {
            let flags = self.inner.flags.lock();
            if let Some(token) = &flags.cancel {
                token.cancel();
            }
            if flags.upgrading {
                warn!("cancel requested while flashing; partition writes are not interruptible");
            }
        }
        self.inner.store.mark_cancelled()?;
        info!("upgrade cancellation requested");
        Ok(())
    }

    /// Bank the bootloader starts next.
    pub fn active_bank(&self) -> Result<Bank> {
        self.inner.boot.active_bank()
    }

    pub fn factory_reset(&self) -> Result<()> {
        self.inner.boot.factory_reset()
    }

    async fn run_session(self, token: CancelToken) -> SessionOutcome {
        let _reset = FlagsReset(self.inner.clone());
        let result = self.run_pipeline(&token).await;
        self.finish(result)
    }

    async fn run_pipeline(&self, token: &CancelToken) -> Result<()> {
        self.download_phase(token).await?;
        token.check()?;

        {
            let mut flags = self.inner.flags.lock();
            flags.downloading = false;
            flags.upgrading = true;
        }
        self.inner
            .store
            .update_progress(UPGRADE_START, UpgradeStatus::Upgrade)?;

        let manager = self.clone();
        run_blocking(move || manager.install_phase()).await
    }

    /// Fetch and verify the package, then stage it on the recovery partition.
    async fn download_phase(&self, token: &CancelToken) -> Result<()> {
        let storage = self.inner.storage.clone();
        let plan = self.inner.plan.clone();
        let staging = run_blocking(move || StagingMount::acquire(storage, &plan)).await?;
        let result = self.fetch_into(staging.path(), token).await;
        run_blocking(move || {
            drop(staging);
            Ok(())
        })
        .await?;
        result
    }

    async fn fetch_into(&self, staging: &Path, token: &CancelToken) -> Result<()> {
        let store = &self.inner.store;
        let cached = VersionManifestEntry::from_file(&store.manifest_path())
            .ok()
            .zip(store.read_base_url());
        let (entry, base_url) = match cached {
            Some(cached) => cached,
            None => {
                debug!("no cached release, resolving latest");
                let entry = self.query_latest_version().await?;
                let base_url = store.read_base_url().ok_or_else(|| {
                    UpgradeError::Network("package base URL was not recorded".to_owned())
                })?;
                (entry, base_url)
            }
        };

        let url = format!("{}/{}", base_url, entry.file_name);
        tokio::fs::create_dir_all(store.download_dir()).await?;
        let download = store.download_dir().join(&entry.file_name);
        let transfer = self
            .inner
            .downloader
            .download_file_with_progress(&url, &download, DOWNLOAD_RANGE, token, |percent| {
                store.update_progress(percent, UpgradeStatus::Download)
            })
            .await;
        if let Err(err) = transfer {
            if let Err(remove_err) = tokio::fs::remove_file(&download).await {
                debug!(path = %download.display(), error = %remove_err, "no partial download to remove");
            }
            return Err(err);
        }
        let (package, md5) = (download.clone(), entry.md5.clone());
        run_blocking(move || verify_or_discard(&package, &md5)).await?;

        // Staged copies let a later session flash without downloading again.
        tokio::fs::copy(&download, staging.join(&entry.file_name)).await?;
        tokio::fs::copy(
            store.manifest_path(),
            staging.join(store.manifest_file_name()),
        )
        .await?;
        if let Err(err) = tokio::fs::remove_file(&download).await {
            warn!(path = %download.display(), error = %err, "failed removing downloaded package");
        }
        store.update_progress(DOWNLOAD_RANGE.end, UpgradeStatus::Download)?;
        info!(package = %entry.file_name, version = %entry.os_version, "package verified and staged");
        Ok(())
    }

    /// Flash the staged package to the inactive bank and switch to it.
    fn install_phase(&self) -> Result<()> {
        let staging = StagingMount::acquire(self.inner.storage.clone(), &self.inner.plan)?;
        // Every file opened under the mount is closed by the time this returns.
        self.install_from(staging.path())
    }

    fn install_from(&self, staging: &Path) -> Result<()> {
        let store = &self.inner.store;
        let entry = VersionManifestEntry::from_file(&staging.join(store.manifest_file_name()))?;
        let mut installer = PackageInstaller::open(&staging.join(&entry.file_name))?;

        let root = self.inner.storage.root_device()?;
        let target = self.inner.plan.target_bank(&root);
        info!(
            root = %root.display(),
            target = %target,
            device = %self.inner.plan.rootfs(target).display(),
            "flashing inactive bank"
        );
        installer.install_all(&self.inner.plan.images(target), store)?;
        // Release the archive before the staging partition is unmounted.
        drop(installer);

        store.update_progress(SWITCH_PROGRESS, UpgradeStatus::Upgrade)?;
        self.inner.boot.switch_partition(target)
    }

    fn finish(&self, result: Result<()>) -> SessionOutcome {
        let store = &self.inner.store;
        let outcome = match result {
            Ok(()) => SessionOutcome::Done,
            Err(UpgradeError::Cancelled) => SessionOutcome::Cancelled,
            Err(err) => SessionOutcome::Failed(err.to_string()),
        };
        let recorded = match &outcome {
            SessionOutcome::Done => {
                info!("upgrade complete, restart required");
                store
                    .update_progress(DONE_PROGRESS, UpgradeStatus::Done)
                    .and_then(|()| store.mark_done())
            }
            SessionOutcome::Cancelled => {
                info!("upgrade cancelled");
                store.update_progress(0, UpgradeStatus::Cancelled)
            }
            SessionOutcome::Failed(reason) => {
                let percent = store.last_reported_percent();
                error!(percent, error = %reason, "upgrade failed");
                store.update_progress(percent, UpgradeStatus::Failed)
            }
        };
        if let Err(err) = recorded {
            error!(error = %err, outcome = outcome.label(), "failed recording session outcome");
        }
        if outcome != SessionOutcome::Cancelled && store.is_cancel_requested() {
            // The request arrived too late to stop anything.
            if let Err(err) = store.clear_cancel_marker() {
                warn!(error = %err, "failed clearing stale cancel marker");
            }
        }
        metrics::record_outcome(outcome.label());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, Default)]
    struct NullStorage;

    impl BlockStorage for NullStorage {
        fn filesystem_type(&self, _device: &Path) -> Option<String> {
            Some("ext4".to_owned())
        }
        fn format(&self, _device: &Path, _fs_type: &str) -> Result<()> {
            Ok(())
        }
        fn mount(&self, _device: &Path, _target: &Path) -> Result<()> {
            Ok(())
        }
        fn unmount(&self, _target: &Path) -> Result<()> {
            Ok(())
        }
        fn root_device(&self) -> Result<PathBuf> {
            Ok(PathBuf::from("/dev/mmcblk0p5"))
        }
    }

    #[derive(Debug, Default)]
    struct MemoryEnv {
        vars: Mutex<BTreeMap<String, String>>,
    }

    impl BootEnv for MemoryEnv {
        fn read_var(&self, name: &str) -> Result<Option<String>> {
            Ok(self.vars.lock().get(name).cloned())
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

    fn manager() -> (TempDir, UpgradeManager) {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.config_dir = dir.path().join("conf");
        config.paths.files_dir = dir.path().join("files");
        config.paths.download_dir = dir.path().join("download");
        config.paths.work_dir = dir.path().join("work");
        config.paths.staging_mount = dir.path().join("mnt");
        let manager = UpgradeManager::with_devices(
            &config,
            Arc::new(NullStorage),
            Arc::new(MemoryEnv::default()),
        )
        .unwrap();
        (dir, manager)
    }

    #[test]
    fn outcomes_map_to_terminal_status() {
        assert_eq!(SessionOutcome::Done.status(), UpgradeStatus::Done);
        assert_eq!(SessionOutcome::Cancelled.status(), UpgradeStatus::Cancelled);
        assert_eq!(
            SessionOutcome::Failed("boom".into()).status(),
            UpgradeStatus::Failed
        );
    }

    #[test]
    fn channel_change_is_rejected_while_session_active() {
        let (_dir, manager) = manager();
        manager.inner.flags.lock().upgrading = true;
        let err = manager.update_channel(1, None).unwrap_err();
        assert!(err.is_state_conflict());
        assert_eq!(manager.get_channel(), ChannelConfig::default());
    }

    #[test]
    fn channel_change_drops_cached_release() {
        let (_dir, manager) = manager();
        let store = manager.store();
        store.update_progress(100, UpgradeStatus::Done).unwrap();
        store
            .write_version(&VersionRecord {
                os_name: "reCamera".into(),
                os_version: "0.1.0".into(),
                status: LatestVersionStatus::Available,
            })
            .unwrap();

        let channel = manager
            .update_channel(1, Some("http://mirror/md5sum.txt".into()))
            .unwrap();
        assert_eq!(manager.get_channel(), channel);
        assert!(store.read_version().is_none());
        assert_eq!(manager.progress(), UpdateProgress::default());
    }

    #[test]
    fn cached_release_is_reported_available() {
        let (_dir, manager) = manager();
        manager
            .store()
            .write_version(&VersionRecord {
                os_name: "reCamera".into(),
                os_version: "0.2.0".into(),
                status: LatestVersionStatus::Querying,
            })
            .unwrap();
        let record = manager.latest_version_status();
        assert_eq!(record.status, LatestVersionStatus::Available);
        assert_eq!(record.os_version, "0.2.0");
    }

    #[test]
    fn running_session_reports_upgrading() {
        let (_dir, manager) = manager();
        manager.inner.flags.lock().downloading = true;
        assert!(manager.is_upgrading());
        assert_eq!(
            manager.latest_version_status().status,
            LatestVersionStatus::Upgrading
        );
    }

    #[test]
    fn cancel_without_session_only_marks() {
        let (_dir, manager) = manager();
        manager.cancel_update().unwrap();
        assert_eq!(
            manager.progress(),
            UpdateProgress::new(0, UpgradeStatus::Cancelled)
        );
        assert!(!manager.is_upgrading());
    }

    #[test]
    fn session_outside_runtime_is_refused() {
        let (_dir, manager) = manager();
        let err = manager.update_system().unwrap_err();
        assert!(err.is_state_conflict());
        assert!(!manager.is_upgrading());
        assert_eq!(manager.progress(), UpdateProgress::default());
    }

    #[test]
    fn late_cancel_does_not_mask_success() {
        let (_dir, manager) = manager();
        manager.store().mark_cancelled().unwrap();
        assert_eq!(manager.finish(Ok(())), SessionOutcome::Done);
        assert_eq!(
            manager.progress(),
            UpdateProgress::new(100, UpgradeStatus::Done)
        );
        assert!(manager.is_upgrade_done());
    }

    #[test]
    fn failure_keeps_last_percent() {
        let (_dir, manager) = manager();
        manager
            .store()
            .update_progress(65, UpgradeStatus::Upgrade)
            .unwrap();
        let outcome = manager.finish(Err(UpgradeError::Partition("rootfs".into())));
        assert!(matches!(outcome, SessionOutcome::Failed(_)));
        assert_eq!(
            manager.progress(),
            UpdateProgress::new(65, UpgradeStatus::Failed)
        );
        assert!(!manager.is_upgrade_done());
    }
}
