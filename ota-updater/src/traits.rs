//! Collaborator abstractions consumed by the controller.
//!
//! The controller sequences operations and owns state; the byte transfer,
//! integrity check, installation mechanism and persistence live behind these
//! traits so they can be swapped (see [`crate::mock`] for test doubles).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{InstallError, Result, StoreError, TransferError, VerifyError};
use crate::types::{StoredUpdate, UpdateInfo};

/// Cooperative cancellation flag shared between the controller and a worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Download
// =============================================================================

/// One resumable transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub download_id: String,
    pub url: String,
    pub destination: PathBuf,
    /// Bytes already on disk. Zero truncates the destination.
    pub offset: u64,
    /// Expected total size, 0 when unknown.
    pub expected_size: u64,
}

/// What the server answered before the body started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    pub status_code: u16,
    pub content_length: Option<u64>,
    /// The transfer continues from the requested offset. `false` means the
    /// server ignored the range and the file is being rewritten from zero.
    pub resumed: bool,
}

/// Callbacks invoked from inside a transfer.
pub trait TransferListener: Send + Sync {
    fn on_response(&self, info: ResponseInfo);

    /// `done` counts every byte of the destination file, including the offset.
    fn on_progress(&self, done: u64, total: u64);
}

/// Resumable byte transfer.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Transfer `request.url` into `request.destination`.
    ///
    /// Returns `Err(TransferError::Cancelled)` once `cancel` is observed. The
    /// partial file is never removed by the downloader.
    async fn download(
        &self,
        request: DownloadRequest,
        listener: &dyn TransferListener,
        cancel: CancelFlag,
    ) -> std::result::Result<(), TransferError>;
}

// =============================================================================
// Verification
// =============================================================================

/// Integrity check of a downloaded artifact.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, update: &UpdateInfo, artifact: &Path) -> std::result::Result<(), VerifyError>;
}

// =============================================================================
// Installation
// =============================================================================

/// Install a verified artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub download_id: String,
    pub version: String,
    pub package: PathBuf,
    /// Continue a suspended installation instead of starting over.
    pub resume: bool,
}

/// Callbacks invoked from inside an installation.
pub trait InstallListener: Send + Sync {
    /// Overall progress 0-100. `finalizing` is set once an A/B install has
    /// written all bytes.
    fn on_progress(&self, progress: u8, finalizing: bool);
}

/// OS installation mechanism.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Returns `Err(InstallError::Stopped)` once `cancel` is observed; the
    /// package is left intact.
    async fn install(
        &self,
        request: InstallRequest,
        listener: &dyn InstallListener,
        cancel: CancelFlag,
    ) -> std::result::Result<(), InstallError>;

    /// Seamless install into the inactive slot.
    fn is_ab(&self) -> bool;

    /// A stopped install can be continued with `resume: true`.
    fn supports_suspend(&self) -> bool;

    /// Hint to trade system responsiveness for install speed.
    fn set_performance_mode(&self, enabled: bool);
}

// =============================================================================
// Persistence
// =============================================================================

/// Durable storage for persistent status, last check time and the pending
/// reboot marker.
///
/// Called while the controller holds its registry lock, so implementations
/// must not call back into the controller and should not wait on storage.
/// [`flush`](StatusStore::flush) is where a write-behind store catches up.
pub trait StatusStore: Send + Sync {
    fn load_updates(&self) -> std::result::Result<Vec<StoredUpdate>, StoreError>;

    fn save_update(&self, update: &StoredUpdate) -> std::result::Result<(), StoreError>;

    fn remove_update(&self, download_id: &str) -> std::result::Result<(), StoreError>;

    fn last_check(&self) -> std::result::Result<Option<DateTime<Utc>>, StoreError>;

    fn set_last_check(&self, at: DateTime<Utc>) -> std::result::Result<(), StoreError>;

    fn reboot_pending(&self) -> std::result::Result<Option<String>, StoreError>;

    fn set_reboot_pending(&self, download_id: Option<&str>) -> std::result::Result<(), StoreError>;

    /// Block until every accepted change is on durable storage.
    fn flush(&self) -> std::result::Result<(), StoreError> {
        Ok(())
    }
}

// =============================================================================
// Device
// =============================================================================

/// Charge level and power source of the device battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryState {
    pub percent: u8,
    /// Plugged into a charger
    pub charging: bool,
}

/// Live device state consulted before an installation starts.
pub trait DeviceConditions: Send + Sync {
    /// `None` when the device has no battery.
    fn battery(&self) -> Option<BatteryState>;

    fn is_scratch_mounted(&self) -> bool;
}

// =============================================================================
// Manifest
// =============================================================================

/// Source of the server update list.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetch the raw list document.
    async fn fetch(&self) -> Result<Vec<u8>>;
}

/// The set of collaborators a controller is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub downloader: Arc<dyn Downloader>,
    pub verifier: Arc<dyn Verifier>,
    pub installer: Arc<dyn Installer>,
    pub store: Arc<dyn StatusStore>,
    pub manifest_source: Arc<dyn ManifestSource>,
    pub device: Arc<dyn DeviceConditions>,
}
