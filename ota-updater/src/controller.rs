//! Update lifecycle controller.
//!
//! The controller is the single owner of the update registry. Every command
//! and every worker callback mutates the registry under one write lock and
//! publishes the resulting events before releasing it, so the order observers
//! see is the order mutations were applied.
//!
//! Workers (one tokio task per transfer, verification or installation) carry
//! the generation number of the operation that spawned them. A callback whose
//! generation no longer matches the record (paused, deleted, restarted) is
//! dropped, which keeps late progress from a cancelled worker out of the
//! event stream.
//!
//! Cancellation is cooperative, so a cancelled worker may still be running
//! when the next command on the same lane arrives. Transfer and install
//! workers therefore chain: each one awaits the task it replaced before it
//! touches the artifact or the installer.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::device::{InstallBlocker, InstallGuard};
use crate::error::{InstallError, Result, TransferError, UpdaterError, VerifyError};
use crate::events::{EventChannel, Reason, ReasonCode, Subscription, UpdateEvent, DEFAULT_EVENT_CAPACITY};
use crate::presenter::{derive_view, UpdateView, ViewContext};
use crate::status::{PersistentStatus, UpdateStatus};
use crate::traits::{
    CancelFlag, Collaborators, DeviceConditions, DownloadRequest, Downloader, InstallListener,
    InstallRequest, Installer, ResponseInfo, StatusStore, TransferListener, Verifier,
};
use crate::types::{BuildInfo, LocalImport, StoredUpdate, UpdateInfo, LOCAL_ID};

/// Settings the controller needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Directory that holds downloaded artifacts.
    pub download_dir: PathBuf,
    /// Delete the artifact once it has been installed.
    pub auto_delete_updates: bool,
    /// The running build, used for restore and install eligibility.
    pub build: BuildInfo,
    pub event_capacity: usize,
    /// Battery thresholds checked before installing.
    pub install_guard: InstallGuard,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("/data/updates"),
            auto_delete_updates: false,
            build: BuildInfo::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            install_guard: InstallGuard::default(),
        }
    }
}

struct Entry {
    update: UpdateInfo,
    generation: u64,
}

struct ActiveDownload {
    download_id: String,
    generation: u64,
    cancel: CancelFlag,
}

struct ActiveInstall {
    download_id: String,
    generation: u64,
    /// `None` while suspended.
    cancel: Option<CancelFlag>,
    is_ab: bool,
}

impl ActiveInstall {
    fn is_suspended(&self) -> bool {
        self.cancel.is_none()
    }
}

#[derive(Default)]
struct Registry {
    updates: HashMap<String, Entry>,
    download: Option<ActiveDownload>,
    verifying: HashSet<String>,
    install: Option<ActiveInstall>,
    reboot_pending: Option<String>,
    next_generation: u64,
    /// Last spawned transfer task, possibly still winding down.
    download_worker: Option<JoinHandle<()>>,
    /// Last spawned install task, possibly still winding down.
    install_worker: Option<JoinHandle<()>>,
}

impl Registry {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Run `check` against a known update, then move it to a new generation.
    fn claim(
        &mut self,
        download_id: &str,
        check: impl FnOnce(&UpdateInfo) -> Result<()>,
    ) -> Result<&mut Entry> {
        let entry = self
            .updates
            .get_mut(download_id)
            .ok_or_else(|| UpdaterError::NotFound(download_id.to_string()))?;
        check(&entry.update)?;
        self.next_generation += 1;
        entry.generation = self.next_generation;
        Ok(entry)
    }

    /// Entry for a callback, if the callback's operation is still current.
    fn current(&mut self, download_id: &str, generation: u64) -> Option<&mut Entry> {
        self.updates
            .get_mut(download_id)
            .filter(|entry| entry.generation == generation)
    }

    fn is_downloading(&self, download_id: &str) -> bool {
        self.download
            .as_ref()
            .is_some_and(|d| d.download_id == download_id)
    }

    fn is_installing(&self, download_id: &str) -> bool {
        self.install
            .as_ref()
            .is_some_and(|i| i.download_id == download_id)
    }

    fn is_busy_with(&self, download_id: &str) -> bool {
        self.is_downloading(download_id)
            || self.verifying.contains(download_id)
            || self.is_installing(download_id)
    }

    fn is_busy(&self) -> bool {
        self.download.is_some() || !self.verifying.is_empty() || self.install.is_some()
    }

    fn view_context(
        &self,
        update: &UpdateInfo,
        build: &BuildInfo,
        install_blocker: Option<InstallBlocker>,
    ) -> ViewContext {
        let id = update.download_id.as_str();
        ViewContext {
            is_downloading: self.is_downloading(id),
            is_verifying: self.verifying.contains(id),
            is_installing: self.is_installing(id),
            is_installing_ab: self.install.as_ref().is_some_and(|i| i.is_ab),
            any_verifying: !self.verifying.is_empty(),
            waiting_for_reboot: self.reboot_pending.as_deref() == Some(id),
            busy: self.is_busy(),
            can_install: crate::presenter::can_install(update, build),
            install_blocker,
        }
    }
}

/// What a transfer worker does once its predecessor has exited.
enum TransferStart {
    Fetch(DownloadRequest),
    /// The artifact is already complete.
    Verify(UpdateInfo),
    /// Paused or deleted while waiting.
    Stale,
}

/// What a download worker does after its transfer returned.
enum TransferOutcome {
    Verify(UpdateInfo),
    Done,
    /// The record is gone; the worker cleans up its destination.
    Orphaned,
}

struct Shared {
    registry: RwLock<Registry>,
    events: EventChannel,
    options: ControllerOptions,
    downloader: Arc<dyn Downloader>,
    verifier: Arc<dyn Verifier>,
    installer: Arc<dyn Installer>,
    store: Arc<dyn StatusStore>,
    device: Arc<dyn DeviceConditions>,
}

/// Authoritative registry of known updates. Cheap to clone; all clones share
/// the same state.
#[derive(Clone)]
pub struct UpdaterController {
    shared: Arc<Shared>,
}

impl UpdaterController {
    pub fn new(options: ControllerOptions, collaborators: &Collaborators) -> Self {
        info!(
            download_dir = %options.download_dir.display(),
            build_version = %options.build.version,
            installer_ab = collaborators.installer.is_ab(),
            "Creating updater controller"
        );

        Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(Registry::default()),
                events: EventChannel::new(options.event_capacity),
                options,
                downloader: Arc::clone(&collaborators.downloader),
                verifier: Arc::clone(&collaborators.verifier),
                installer: Arc::clone(&collaborators.installer),
                store: Arc::clone(&collaborators.store),
                device: Arc::clone(&collaborators.device),
            }),
        }
    }

    pub fn build(&self) -> &BuildInfo {
        &self.shared.options.build
    }

    pub fn download_dir(&self) -> &Path {
        &self.shared.options.download_dir
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Snapshot of every known update plus a subscription that starts right
    /// after it.
    ///
    /// Both are taken under one registry read lock. Mutations publish while
    /// holding the write lock, so every event published before the snapshot is
    /// reflected in it and every later event arrives on the subscription.
    pub fn attach(&self) -> (Vec<UpdateInfo>, Subscription) {
        let reg = self.shared.read();
        let subscription = self.shared.events.subscribe();
        let snapshot = reg.updates.values().map(|e| e.update.clone()).collect();
        (snapshot, subscription)
    }

    /// Subscribe without a snapshot.
    pub fn subscribe(&self) -> Subscription {
        self.shared.events.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.shared.events.subscriber_count()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_update(&self, download_id: &str) -> Option<UpdateInfo> {
        self.shared
            .read()
            .updates
            .get(download_id)
            .map(|e| e.update.clone())
    }

    /// All known updates, in no particular order.
    pub fn get_updates(&self) -> Vec<UpdateInfo> {
        self.shared
            .read()
            .updates
            .values()
            .map(|e| e.update.clone())
            .collect()
    }

    /// A transfer is running for this update. A paused download is not.
    pub fn is_downloading(&self, download_id: &str) -> bool {
        self.shared.read().is_downloading(download_id)
    }

    pub fn has_active_downloads(&self) -> bool {
        self.shared.read().download.is_some()
    }

    pub fn is_verifying(&self, download_id: &str) -> bool {
        self.shared.read().verifying.contains(download_id)
    }

    pub fn is_any_verifying(&self) -> bool {
        !self.shared.read().verifying.is_empty()
    }

    /// The install slot belongs to this update, running or suspended.
    pub fn is_installing(&self, download_id: &str) -> bool {
        self.shared.read().is_installing(download_id)
    }

    pub fn is_any_installing(&self) -> bool {
        self.shared.read().install.is_some()
    }

    pub fn is_installing_ab(&self) -> bool {
        self.shared
            .read()
            .install
            .as_ref()
            .is_some_and(|i| i.is_ab)
    }

    pub fn is_waiting_for_reboot(&self, download_id: &str) -> bool {
        self.shared.read().reboot_pending.as_deref() == Some(download_id)
    }

    /// Any download, verification or installation is in flight.
    pub fn is_busy(&self) -> bool {
        self.shared.read().is_busy()
    }

    /// The device condition that currently forbids installing, if any.
    pub fn install_blocker(&self) -> Option<InstallBlocker> {
        self.shared.install_blocker()
    }

    /// Presenter decisions for one update, derived under one read lock.
    /// Unknown ids yield the steady "check for updates" view.
    pub fn view(&self, download_id: &str) -> UpdateView {
        let blocker = self.shared.install_blocker();
        let reg = self.shared.read();
        match reg.updates.get(download_id) {
            Some(entry) => {
                let ctx = reg.view_context(&entry.update, &self.shared.options.build, blocker);
                derive_view(Some(&entry.update), &ctx)
            }
            None => derive_view(None, &ViewContext::default()),
        }
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        match self.shared.store.last_check() {
            Ok(at) => at,
            Err(e) => {
                warn!(error = %e, "Failed to read last check time");
                None
            }
        }
    }

    /// Record a successful update check.
    pub fn record_check(&self, at: DateTime<Utc>) -> Result<()> {
        self.shared.store.set_last_check(at)?;
        Ok(())
    }

    // =========================================================================
    // Registry maintenance
    // =========================================================================

    /// Register an update discovered on the server.
    ///
    /// Returns `true` for a previously unseen id. For a known id only the
    /// server metadata is merged; status and progress are untouched.
    pub fn add_update(&self, update: UpdateInfo) -> bool {
        let mut update = update;
        if update.file.is_relative() {
            update.file = self.shared.options.download_dir.join(&update.file);
        }

        let mut reg = self.shared.write();
        if let Some(entry) = reg.updates.get_mut(&update.download_id) {
            entry.update.merge_metadata(&update);
            if entry.update.persistent_status != PersistentStatus::Unknown {
                self.shared.persist(&entry.update);
            }
            debug!(download_id = %update.download_id, "Merged update metadata");
            return false;
        }

        update.status = UpdateStatus::Unknown;
        update.persistent_status = PersistentStatus::Unknown;
        update.reset_download();
        update.install_progress = 0;
        update.finalizing = false;

        info!(
            download_id = %update.download_id,
            version = %update.version,
            size = update.file_size,
            "New update available"
        );

        let generation = reg.next_generation();
        self.shared.publish_status(&update, None);
        reg.updates.insert(
            update.download_id.clone(),
            Entry { update, generation },
        );
        true
    }

    /// Mark which updates the server currently lists.
    ///
    /// With `purge_if_not_owned`, unlisted updates are removed unless they
    /// are the local import or a download, verification or installation is
    /// running for them. Each removal deletes the artifact and publishes
    /// `UpdateRemoved`.
    pub fn set_updates_available_online(&self, ids: &[String], purge_if_not_owned: bool) {
        let listed: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut orphaned = Vec::new();

        {
            let mut reg = self.shared.write();
            let mut known: Vec<String> = reg.updates.keys().cloned().collect();
            known.sort();

            for id in known {
                let online = listed.contains(id.as_str());
                let purge =
                    purge_if_not_owned && !online && id != LOCAL_ID && !reg.is_busy_with(&id);

                if purge {
                    if let Some(entry) = reg.updates.remove(&id) {
                        info!(download_id = %id, "Removing update no longer listed");
                        if let Err(e) = self.shared.store.remove_update(&id) {
                            warn!(download_id = %id, error = %e, "Failed to forget update");
                        }
                        if reg.reboot_pending.as_deref() == Some(id.as_str()) {
                            reg.reboot_pending = None;
                            self.shared.clear_reboot_pending();
                        }
                        self.shared.events.publish(UpdateEvent::UpdateRemoved {
                            download_id: id.clone(),
                        });
                        orphaned.push(entry.update.file);
                    }
                } else if let Some(entry) = reg.updates.get_mut(&id) {
                    entry.update.available_online = online;
                }
            }
        }

        for file in orphaned {
            remove_artifact(&file);
        }
    }

    /// Reload persisted updates after a restart.
    ///
    /// Records whose artifact vanished, that are already installed, or whose
    /// build is not newer than the running one are dropped, except the update
    /// a reboot is pending for. Returns the number of restored records.
    #[instrument(skip(self))]
    pub fn restore(&self) -> Result<usize> {
        let stored = self.shared.store.load_updates()?;
        let mut pending = self.shared.store.reboot_pending()?;
        let build = &self.shared.options.build;

        let mut restored = Vec::new();
        let mut dropped = Vec::new();

        for record in stored {
            let is_pending = pending.as_deref() == Some(record.download_id.as_str());
            let applied = record.timestamp <= build.timestamp;

            if is_pending {
                if applied {
                    info!(download_id = %record.download_id, "Rebooted into installed update");
                    pending = None;
                    self.shared.clear_reboot_pending();
                    dropped.push(record);
                } else {
                    restored.push(record.into_update_info(0));
                }
                continue;
            }

            let keep = match record.persistent_status {
                PersistentStatus::Unknown | PersistentStatus::Installed => false,
                PersistentStatus::Incomplete | PersistentStatus::Verified => {
                    !(applied && !build.allow_downgrading)
                }
            };
            let on_disk = std::fs::metadata(&record.file).map(|m| m.len()).ok();

            match on_disk {
                Some(len) if keep => restored.push(record.into_update_info(len)),
                _ => {
                    debug!(download_id = %record.download_id, "Dropping stale update");
                    dropped.push(record);
                }
            }
        }

        for record in &dropped {
            if let Err(e) = self.shared.store.remove_update(&record.download_id) {
                warn!(download_id = %record.download_id, error = %e, "Failed to forget update");
            }
            remove_artifact(&record.file);
        }

        let mut count = 0;
        let mut reg = self.shared.write();
        reg.reboot_pending = pending;
        for update in restored {
            if reg.updates.contains_key(&update.download_id) {
                continue;
            }
            let generation = reg.next_generation();
            self.shared.publish_status(&update, None);
            reg.updates.insert(
                update.download_id.clone(),
                Entry { update, generation },
            );
            count += 1;
        }

        info!(restored = count, dropped = dropped.len(), "Restored updater state");
        Ok(count)
    }

    /// Import a package from the local filesystem under [`LOCAL_ID`].
    ///
    /// The file is copied into the download directory and verified before it
    /// is registered as `VERIFIED`. A previous import is replaced.
    #[instrument(skip(self, meta))]
    pub async fn import_local(&self, source: &Path, meta: LocalImport) -> Result<UpdateInfo> {
        {
            let reg = self.shared.read();
            if reg.is_busy_with(LOCAL_ID) {
                return Err(UpdaterError::InstallInProgress(LOCAL_ID.to_string()));
            }
        }

        let download_dir = &self.shared.options.download_dir;
        tokio::fs::create_dir_all(download_dir).await?;

        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "update.zip".to_string());
        let destination = download_dir.join(format!("{}-{}", LOCAL_ID, file_name));
        if source != destination {
            tokio::fs::copy(source, &destination).await?;
        }
        let size = tokio::fs::metadata(&destination).await?.len();

        let mut update = UpdateInfo::new(LOCAL_ID, meta.name, meta.version, meta.timestamp, size)
            .with_file(destination.clone());

        if let Err(e) = self.shared.verifier.verify(&update, &destination).await {
            warn!(error = %e, "Local update failed verification");
            remove_artifact(&destination);
            return Err(e.into());
        }

        update.status = UpdateStatus::Verified;
        update.persistent_status = PersistentStatus::Verified;
        update.downloaded_bytes = size;
        update.progress = 100;

        let replaced = {
            let mut reg = self.shared.write();
            let generation = reg.next_generation();
            self.shared.persist(&update);
            self.shared.publish_status(&update, None);
            reg.updates
                .insert(
                    LOCAL_ID.to_string(),
                    Entry {
                        update: update.clone(),
                        generation,
                    },
                )
                .map(|old| old.update.file)
                .filter(|old| old != &destination)
        };

        if let Some(old) = replaced {
            remove_artifact(&old);
        }

        info!(size = size, version = %update.version, "Imported local update");
        Ok(update)
    }

    // =========================================================================
    // Download commands
    // =========================================================================

    /// Download an update from scratch. Returns once the transfer is
    /// scheduled.
    #[instrument(skip(self))]
    pub fn start_download(&self, download_id: &str) -> Result<()> {
        let mut reg = self.shared.write();
        if let Some(active) = &reg.download {
            return Err(UpdaterError::DownloadInProgress(active.download_id.clone()));
        }

        let entry = reg.claim(download_id, |update| {
            if !update.status.accepts_download() || update.is_local() {
                return Err(UpdaterError::InvalidState(format!(
                    "cannot download {} while {}",
                    download_id, update.status
                )));
            }
            Ok(())
        })?;
        let generation = entry.generation;
        entry.update.status = UpdateStatus::Starting;
        entry.update.reset_download();

        let request = DownloadRequest {
            download_id: download_id.to_string(),
            url: entry.update.url.clone(),
            destination: entry.update.file.clone(),
            offset: 0,
            expected_size: entry.update.file_size,
        };
        self.shared.publish_status(&entry.update, None);

        let cancel = CancelFlag::new();
        reg.download = Some(ActiveDownload {
            download_id: download_id.to_string(),
            generation,
            cancel: cancel.clone(),
        });

        info!(download_id = %download_id, url = %request.url, "Download started");
        self.spawn_download(&mut reg, request, generation, cancel, false);
        Ok(())
    }

    /// Halt the running transfer, keeping the partial file.
    #[instrument(skip(self))]
    pub fn pause_download(&self, download_id: &str) -> Result<()> {
        let mut reg = self.shared.write();
        let active = match reg.download.take() {
            Some(active) if active.download_id == download_id => active,
            other => {
                reg.download = other;
                return Err(UpdaterError::InvalidState(format!(
                    "{} is not downloading",
                    download_id
                )));
            }
        };
        active.cancel.cancel();

        let generation = reg.next_generation();
        if let Some(entry) = reg.updates.get_mut(download_id) {
            entry.generation = generation;
            if entry.update.persistent_status == PersistentStatus::Unknown {
                entry.update.status = UpdateStatus::Unknown;
                entry.update.reset_download();
            } else {
                entry.update.status = UpdateStatus::Downloading;
            }
            self.shared
                .publish_status(&entry.update, Some(Reason::new(ReasonCode::DownloadPaused)));
            info!(
                download_id = %download_id,
                downloaded = entry.update.downloaded_bytes,
                "Download paused"
            );
        }
        Ok(())
    }

    /// Continue a paused or failed download from the bytes already on disk.
    ///
    /// The offset is read once the previous transfer has exited. A complete
    /// file goes straight to verification.
    #[instrument(skip(self))]
    pub fn resume_download(&self, download_id: &str) -> Result<()> {
        let mut reg = self.shared.write();
        if let Some(active) = &reg.download {
            return Err(UpdaterError::DownloadInProgress(active.download_id.clone()));
        }

        let entry = reg.claim(download_id, |update| match update.status {
            UpdateStatus::Downloading | UpdateStatus::PausedError => Ok(()),
            status => Err(UpdaterError::InvalidState(format!(
                "cannot resume {} while {}",
                download_id, status
            ))),
        })?;
        let generation = entry.generation;
        entry.update.status = UpdateStatus::Starting;

        let request = DownloadRequest {
            download_id: download_id.to_string(),
            url: entry.update.url.clone(),
            destination: entry.update.file.clone(),
            offset: 0,
            expected_size: entry.update.file_size,
        };
        self.shared.publish_status(&entry.update, None);

        let cancel = CancelFlag::new();
        reg.download = Some(ActiveDownload {
            download_id: download_id.to_string(),
            generation,
            cancel: cancel.clone(),
        });

        info!(download_id = %download_id, "Download resumed");
        self.spawn_download(&mut reg, request, generation, cancel, true);
        Ok(())
    }

    /// Cancel whatever runs for the update, delete its artifact and remove it.
    #[instrument(skip(self))]
    pub fn delete_update(&self, download_id: &str) -> Result<()> {
        let file = {
            let mut reg = self.shared.write();
            let mut entry = reg
                .updates
                .remove(download_id)
                .ok_or_else(|| UpdaterError::NotFound(download_id.to_string()))?;

            if reg.is_downloading(download_id) {
                if let Some(active) = reg.download.take() {
                    active.cancel.cancel();
                }
            }
            if reg.is_installing(download_id) {
                if let Some(cancel) = reg.install.take().and_then(|i| i.cancel) {
                    cancel.cancel();
                }
            }
            reg.verifying.remove(download_id);
            if reg.reboot_pending.as_deref() == Some(download_id) {
                reg.reboot_pending = None;
                self.shared.clear_reboot_pending();
            }

            if let Err(e) = self.shared.store.remove_update(download_id) {
                warn!(download_id = %download_id, error = %e, "Failed to forget update");
            }

            entry.update.status = UpdateStatus::Deleted;
            entry.update.persistent_status = PersistentStatus::Unknown;
            entry.update.reset_download();
            self.shared
                .publish_status(&entry.update, Some(Reason::new(ReasonCode::Deleted)));
            self.shared.events.publish(UpdateEvent::UpdateRemoved {
                download_id: download_id.to_string(),
            });
            entry.update.file
        };

        remove_artifact(&file);
        info!(download_id = %download_id, "Update deleted");
        Ok(())
    }

    // =========================================================================
    // Install commands
    // =========================================================================

    /// Install a verified update.
    ///
    /// Refused with [`UpdaterError::InstallBlocked`] while the battery is
    /// too low or the scratch overlay is mounted.
    #[instrument(skip(self))]
    pub fn install_update(&self, download_id: &str) -> Result<()> {
        let blocker = self.shared.install_blocker();

        let mut reg = self.shared.write();
        if let Some(active) = &reg.install {
            return Err(UpdaterError::InstallInProgress(active.download_id.clone()));
        }

        let entry = reg.claim(download_id, |update| {
            let installable = update.persistent_status == PersistentStatus::Verified
                && matches!(
                    update.status,
                    UpdateStatus::Verified | UpdateStatus::InstallationFailed
                );
            if !installable {
                return Err(UpdaterError::InvalidState(format!(
                    "cannot install {} while {}",
                    download_id, update.status
                )));
            }
            match blocker {
                Some(blocker) => {
                    warn!(download_id = %download_id, reason = %blocker, "Installation refused");
                    Err(UpdaterError::InstallBlocked(blocker))
                }
                None => Ok(()),
            }
        })?;
        let generation = entry.generation;
        entry.update.status = UpdateStatus::Installing;
        entry.update.install_progress = 0;
        entry.update.finalizing = false;
        self.shared.publish_status(&entry.update, None);

        let request = InstallRequest {
            download_id: download_id.to_string(),
            version: entry.update.version.clone(),
            package: entry.update.file.clone(),
            resume: false,
        };

        let cancel = CancelFlag::new();
        reg.install = Some(ActiveInstall {
            download_id: download_id.to_string(),
            generation,
            cancel: Some(cancel.clone()),
            is_ab: self.shared.installer.is_ab(),
        });

        info!(download_id = %download_id, "Installation started");
        self.spawn_install(&mut reg, request, generation, cancel);
        Ok(())
    }

    /// Interrupt the running installation in a resumable way.
    #[instrument(skip(self))]
    pub fn suspend_installation(&self, download_id: &str) -> Result<()> {
        if !self.shared.installer.supports_suspend() {
            return Err(UpdaterError::Unsupported("suspend installation".to_string()));
        }

        let mut reg = self.shared.write();
        let running = reg
            .install
            .as_ref()
            .is_some_and(|i| i.download_id == download_id && !i.is_suspended());
        if !running {
            return Err(UpdaterError::InvalidState(format!(
                "{} is not installing",
                download_id
            )));
        }

        let generation = reg.next_generation();
        if let Some(install) = reg.install.as_mut() {
            if let Some(cancel) = install.cancel.take() {
                cancel.cancel();
            }
            install.generation = generation;
        }

        if let Some(entry) = reg.updates.get_mut(download_id) {
            entry.generation = generation;
            entry.update.status = UpdateStatus::InstallationSuspended;
            self.shared.publish_status(
                &entry.update,
                Some(Reason::new(ReasonCode::InstallationSuspended)),
            );
        }
        info!(download_id = %download_id, "Installation suspended");
        Ok(())
    }

    /// Continue a suspended installation. The device conditions are checked
    /// again, as for a fresh install.
    #[instrument(skip(self))]
    pub fn resume_installation(&self, download_id: &str) -> Result<()> {
        let blocker = self.shared.install_blocker();

        let mut reg = self.shared.write();
        let suspended = reg
            .install
            .as_ref()
            .is_some_and(|i| i.download_id == download_id && i.is_suspended());
        if !suspended {
            return Err(UpdaterError::InvalidState(format!(
                "{} is not suspended",
                download_id
            )));
        }
        if let Some(blocker) = blocker {
            warn!(download_id = %download_id, reason = %blocker, "Resume refused");
            return Err(UpdaterError::InstallBlocked(blocker));
        }

        let entry = reg.claim(download_id, |_| Ok(()))?;
        let generation = entry.generation;
        entry.update.status = UpdateStatus::Installing;
        self.shared.publish_status(&entry.update, None);

        let request = InstallRequest {
            download_id: download_id.to_string(),
            version: entry.update.version.clone(),
            package: entry.update.file.clone(),
            resume: true,
        };

        let cancel = CancelFlag::new();
        if let Some(install) = reg.install.as_mut() {
            install.generation = generation;
            install.cancel = Some(cancel.clone());
        }

        info!(download_id = %download_id, "Installation resumed");
        self.spawn_install(&mut reg, request, generation, cancel);
        Ok(())
    }

    /// Stop the active installation and roll the update back to `VERIFIED`.
    #[instrument(skip(self))]
    pub fn stop_installation(&self) -> Result<()> {
        let mut reg = self.shared.write();
        let active = reg.install.take().ok_or_else(|| {
            UpdaterError::InvalidState("no installation in progress".to_string())
        })?;
        if let Some(cancel) = &active.cancel {
            cancel.cancel();
        }

        let generation = reg.next_generation();
        if let Some(entry) = reg.updates.get_mut(&active.download_id) {
            entry.generation = generation;
            entry.update.status = UpdateStatus::Verified;
            entry.update.install_progress = 0;
            entry.update.finalizing = false;
            self.shared.publish_status(
                &entry.update,
                Some(Reason::new(ReasonCode::InstallationStopped)),
            );
        }
        info!(download_id = %active.download_id, "Installation stopped");
        Ok(())
    }

    /// Pass the performance preference to the installer.
    pub fn set_performance_mode(&self, enabled: bool) {
        debug!(enabled = enabled, "Setting install performance mode");
        self.shared.installer.set_performance_mode(enabled);
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Spawn a transfer task that first waits for the previous one to exit,
    /// so two writers never share a destination file. A resumed transfer
    /// continues from whatever that predecessor left on disk.
    fn spawn_download(
        &self,
        reg: &mut Registry,
        request: DownloadRequest,
        generation: u64,
        cancel: CancelFlag,
        resume: bool,
    ) {
        let previous = reg.download_worker.take();
        let shared = Arc::clone(&self.shared);
        reg.download_worker = Some(tokio::spawn(async move {
            wait_for(previous, "transfer").await;

            let mut request = request;
            if resume {
                request.offset = tokio::fs::metadata(&request.destination)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
            }
            let request = match shared.begin_transfer(request, generation) {
                TransferStart::Fetch(request) => request,
                TransferStart::Verify(update) => {
                    tokio::spawn(Shared::run_verification(shared, update, generation));
                    return;
                }
                TransferStart::Stale => return,
            };

            let callbacks = TransferCallbacks {
                shared: Arc::clone(&shared),
                download_id: request.download_id.clone(),
                generation,
            };
            let destination = request.destination.clone();
            let download_id = request.download_id.clone();

            let result = shared
                .downloader
                .download(request, &callbacks, cancel)
                .await;

            match shared.finish_transfer(&download_id, generation, result) {
                TransferOutcome::Verify(update) => {
                    tokio::spawn(Shared::run_verification(shared, update, generation));
                }
                TransferOutcome::Done => {}
                TransferOutcome::Orphaned => remove_artifact(&destination),
            }
        }));
    }

    /// Spawn an install task chained behind the previous one, so a resumed
    /// or restarted install never overlaps the one it replaces.
    fn spawn_install(
        &self,
        reg: &mut Registry,
        request: InstallRequest,
        generation: u64,
        cancel: CancelFlag,
    ) {
        let previous = reg.install_worker.take();
        let shared = Arc::clone(&self.shared);
        reg.install_worker = Some(tokio::spawn(async move {
            wait_for(previous, "install").await;
            if cancel.is_cancelled() {
                debug!(download_id = %request.download_id, "Install superseded before it started");
                return;
            }

            let callbacks = InstallCallbacks {
                shared: Arc::clone(&shared),
                download_id: request.download_id.clone(),
                generation,
            };
            let download_id = request.download_id.clone();

            let result = shared.installer.install(request, &callbacks, cancel).await;

            if let Some(artifact) = shared.finish_install(&download_id, generation, result) {
                info!(download_id = %download_id, "Deleting installed artifact");
                remove_artifact(&artifact);
            }
        }));
    }
}

async fn wait_for(previous: Option<JoinHandle<()>>, lane: &'static str) {
    if let Some(previous) = previous {
        if let Err(e) = previous.await {
            warn!(lane = lane, error = %e, "Previous worker ended abnormally");
        }
    }
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_status(&self, update: &UpdateInfo, reason: Option<Reason>) {
        self.events.publish(UpdateEvent::UpdateStatus {
            download_id: update.download_id.clone(),
            status: update.status,
            persistent_status: update.persistent_status,
            reason,
        });
    }

    /// Write the persistent projection, or forget it when nothing is on disk.
    fn persist(&self, update: &UpdateInfo) {
        let result = if update.persistent_status == PersistentStatus::Unknown {
            self.store.remove_update(&update.download_id)
        } else {
            self.store.save_update(&StoredUpdate::from(update))
        };
        if let Err(e) = result {
            warn!(download_id = %update.download_id, error = %e, "Failed to persist update status");
        }
    }

    fn install_blocker(&self) -> Option<InstallBlocker> {
        self.options.install_guard.check(self.device.as_ref())
    }

    /// Settle the offset of a transfer whose predecessor has exited.
    fn begin_transfer(&self, mut request: DownloadRequest, generation: u64) -> TransferStart {
        let mut reg = self.write();
        let download_id = request.download_id.clone();
        let Some(entry) = reg.current(&download_id, generation) else {
            debug!(download_id = %download_id, "Transfer superseded before it started");
            return TransferStart::Stale;
        };

        let size = entry.update.file_size;
        let offset = request.offset;
        if offset > 0 && size > 0 && offset >= size {
            info!(download_id = %download_id, "Artifact already complete, verifying");
            entry.update.status = UpdateStatus::Verifying;
            entry.update.downloaded_bytes = size;
            entry.update.progress = 100;
            self.publish_status(&entry.update, None);
            let snapshot = entry.update.clone();
            reg.verifying.insert(download_id);
            if reg.download.as_ref().is_some_and(|d| d.generation == generation) {
                reg.download = None;
            }
            return TransferStart::Verify(snapshot);
        }

        if offset > 0 {
            entry.update.downloaded_bytes = offset;
            entry.update.progress = entry.update.percent_of(offset);
            debug!(download_id = %download_id, offset = offset, "Continuing partial artifact");
        }
        request.expected_size = size;
        TransferStart::Fetch(request)
    }

    fn clear_reboot_pending(&self) {
        if let Err(e) = self.store.set_reboot_pending(None) {
            warn!(error = %e, "Failed to clear pending reboot");
        }
    }

    fn on_transfer_response(&self, download_id: &str, generation: u64, info: ResponseInfo) {
        let mut reg = self.write();
        let Some(entry) = reg.current(download_id, generation) else {
            return;
        };

        debug!(
            download_id = %download_id,
            status_code = info.status_code,
            resumed = info.resumed,
            "Transfer responded"
        );

        if !info.resumed {
            entry.update.reset_download();
        }
        if entry.update.file_size == 0 {
            if let Some(len) = info.content_length {
                entry.update.file_size = len + entry.update.downloaded_bytes;
            }
        }
        entry.update.status = UpdateStatus::Downloading;
        if entry.update.persistent_status != PersistentStatus::Incomplete {
            entry.update.persistent_status = PersistentStatus::Incomplete;
            self.persist(&entry.update);
        }
        self.publish_status(&entry.update, None);
    }

    fn on_transfer_progress(&self, download_id: &str, generation: u64, done: u64, total: u64) {
        let mut reg = self.write();
        let Some(entry) = reg.current(download_id, generation) else {
            return;
        };
        if !entry.update.status.is_download_phase() {
            return;
        }

        if entry.update.file_size == 0 {
            entry.update.file_size = total;
        }
        let done = done.max(entry.update.downloaded_bytes);
        entry.update.downloaded_bytes = done;
        entry.update.progress = entry.update.percent_of(done);

        self.events.publish(UpdateEvent::DownloadProgress {
            download_id: download_id.to_string(),
            progress: entry.update.progress,
            downloaded_bytes: done,
            total_bytes: entry.update.file_size,
        });
    }

    fn finish_transfer(
        &self,
        download_id: &str,
        generation: u64,
        result: std::result::Result<(), TransferError>,
    ) -> TransferOutcome {
        let mut reg = self.write();
        if reg.download.as_ref().is_some_and(|d| d.generation == generation) {
            reg.download = None;
        }

        if !reg.updates.contains_key(download_id) {
            return TransferOutcome::Orphaned;
        }
        let Some(entry) = reg.current(download_id, generation) else {
            debug!(download_id = %download_id, "Ignoring stale transfer result");
            return TransferOutcome::Done;
        };

        match result {
            Ok(()) => {
                info!(
                    download_id = %download_id,
                    bytes = entry.update.downloaded_bytes,
                    "Download complete"
                );
                entry.update.status = UpdateStatus::Verifying;
                self.publish_status(&entry.update, None);
                let snapshot = entry.update.clone();
                reg.verifying.insert(download_id.to_string());
                TransferOutcome::Verify(snapshot)
            }
            Err(TransferError::Cancelled) => {
                entry.update.status = if entry.update.persistent_status == PersistentStatus::Unknown
                {
                    UpdateStatus::Unknown
                } else {
                    UpdateStatus::Downloading
                };
                self.publish_status(&entry.update, Some(Reason::new(ReasonCode::DownloadPaused)));
                TransferOutcome::Done
            }
            Err(TransferError::Failed(message)) => {
                warn!(download_id = %download_id, error = %message, "Download failed");
                entry.update.status = UpdateStatus::PausedError;
                self.publish_status(
                    &entry.update,
                    Some(Reason::with_message(ReasonCode::DownloadFailed, message)),
                );
                TransferOutcome::Done
            }
        }
    }

    async fn run_verification(shared: Arc<Shared>, update: UpdateInfo, generation: u64) {
        debug!(download_id = %update.download_id, "Verifying artifact");
        let result = shared.verifier.verify(&update, &update.file).await;
        if shared.finish_verification(&update.download_id, generation, result) {
            remove_artifact(&update.file);
        }
    }

    /// Returns `true` when the artifact must be discarded.
    fn finish_verification(
        &self,
        download_id: &str,
        generation: u64,
        result: std::result::Result<(), VerifyError>,
    ) -> bool {
        let mut reg = self.write();
        if !reg.updates.contains_key(download_id) {
            return true;
        }
        let Some(entry) = reg.current(download_id, generation) else {
            return false;
        };

        let discard = match result {
            Ok(()) => {
                info!(download_id = %download_id, "Update verified");
                entry.update.status = UpdateStatus::Verified;
                entry.update.persistent_status = PersistentStatus::Verified;
                entry.update.downloaded_bytes = entry.update.file_size;
                entry.update.progress = 100;
                self.persist(&entry.update);
                self.publish_status(&entry.update, None);
                false
            }
            Err(e) => {
                warn!(download_id = %download_id, error = %e, "Verification failed");
                entry.update.status = UpdateStatus::VerificationFailed;
                entry.update.persistent_status = PersistentStatus::Unknown;
                entry.update.reset_download();
                self.persist(&entry.update);
                self.publish_status(
                    &entry.update,
                    Some(Reason::with_message(ReasonCode::VerificationFailed, e.to_string())),
                );
                true
            }
        };
        reg.verifying.remove(download_id);
        discard
    }

    fn on_install_progress(&self, download_id: &str, generation: u64, progress: u8, finalizing: bool) {
        let mut reg = self.write();
        let Some(entry) = reg.current(download_id, generation) else {
            return;
        };
        if entry.update.status != UpdateStatus::Installing {
            return;
        }

        entry.update.install_progress = progress.min(100).max(entry.update.install_progress);
        entry.update.finalizing = finalizing;
        self.events.publish(UpdateEvent::InstallProgress {
            download_id: download_id.to_string(),
            progress: entry.update.install_progress,
            finalizing,
        });
    }

    /// Returns the artifact path when it should be deleted after install.
    fn finish_install(
        &self,
        download_id: &str,
        generation: u64,
        result: std::result::Result<(), InstallError>,
    ) -> Option<PathBuf> {
        let mut reg = self.write();
        if reg.install.as_ref().is_some_and(|i| i.generation == generation) {
            reg.install = None;
        }
        let entry = reg.current(download_id, generation)?;

        match result {
            Ok(()) => {
                info!(download_id = %download_id, "Installation complete, reboot required");
                entry.update.status = UpdateStatus::Installed;
                entry.update.persistent_status = PersistentStatus::Installed;
                entry.update.install_progress = 100;
                entry.update.finalizing = false;
                self.persist(&entry.update);
                self.publish_status(&entry.update, None);
                let artifact = entry.update.file.clone();

                reg.reboot_pending = Some(download_id.to_string());
                if let Err(e) = self.store.set_reboot_pending(Some(download_id)) {
                    warn!(error = %e, "Failed to record pending reboot");
                }
                self.options.auto_delete_updates.then_some(artifact)
            }
            Err(InstallError::Stopped) => {
                entry.update.status = UpdateStatus::Verified;
                entry.update.install_progress = 0;
                entry.update.finalizing = false;
                self.publish_status(
                    &entry.update,
                    Some(Reason::new(ReasonCode::InstallationStopped)),
                );
                None
            }
            Err(InstallError::Failed(message)) => {
                warn!(download_id = %download_id, error = %message, "Installation failed");
                entry.update.status = UpdateStatus::InstallationFailed;
                entry.update.install_progress = 0;
                entry.update.finalizing = false;
                self.publish_status(
                    &entry.update,
                    Some(Reason::with_message(ReasonCode::InstallationFailed, message)),
                );
                None
            }
        }
    }
}

struct TransferCallbacks {
    shared: Arc<Shared>,
    download_id: String,
    generation: u64,
}

impl TransferListener for TransferCallbacks {
    fn on_response(&self, info: ResponseInfo) {
        self.shared
            .on_transfer_response(&self.download_id, self.generation, info);
    }

    fn on_progress(&self, done: u64, total: u64) {
        self.shared
            .on_transfer_progress(&self.download_id, self.generation, done, total);
    }
}

struct InstallCallbacks {
    shared: Arc<Shared>,
    download_id: String,
    generation: u64,
}

impl InstallListener for InstallCallbacks {
    fn on_progress(&self, progress: u8, finalizing: bool) {
        self.shared
            .on_install_progress(&self.download_id, self.generation, progress, finalizing);
    }
}

fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove artifact"),
    }
}
