//! In-memory collaborators for testing and development.
//!
//! These doubles simulate transfers, verification and installation without
//! network access or real partitions. Useful for:
//! - Unit and integration testing of the controller
//! - Running the daemon with `--dev` on a workstation
//!
//! Transfers and installs can be held at a given point and released later,
//! which lets tests observe intermediate states deterministically.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{InstallError, Result, TransferError, UpdaterError, VerifyError};
use crate::store::MemoryStore;
use crate::traits::{
    BatteryState, CancelFlag, Collaborators, DeviceConditions, DownloadRequest, Downloader,
    InstallListener, InstallRequest, Installer, ManifestSource, ResponseInfo, TransferListener,
    Verifier,
};
use crate::types::UpdateInfo;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Size used for transfers whose expected size is unknown.
const DEFAULT_TRANSFER_SIZE: u64 = 1000;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One-shot breakpoint: armed at a threshold, waits once reached until
/// released or cancelled.
#[derive(Default)]
struct Breakpoint {
    at: Mutex<Option<u64>>,
    held: AtomicBool,
    released: AtomicBool,
}

impl Breakpoint {
    fn arm(&self, at: Option<u64>) {
        self.released.store(false, Ordering::SeqCst);
        *lock(&self.at) = at;
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Returns `false` when cancelled while waiting.
    async fn pass(&self, position: u64, cancel: &CancelFlag) -> bool {
        let triggered = {
            let mut at = lock(&self.at);
            match *at {
                Some(threshold) if position >= threshold => {
                    *at = None;
                    true
                }
                _ => false,
            }
        };
        if !triggered {
            return true;
        }

        self.held.store(true, Ordering::SeqCst);
        let passed = loop {
            if cancel.is_cancelled() {
                break false;
            }
            if self.released.swap(false, Ordering::SeqCst) {
                break true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };
        self.held.store(false, Ordering::SeqCst);
        passed
    }
}

/// Counts calls running at the same time and remembers the peak.
#[derive(Default)]
struct Concurrency {
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct Running<'a>(&'a Concurrency);

impl Concurrency {
    fn enter(&self) -> Running<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Running(self)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Downloader
// =============================================================================

/// Simulated transfer that writes filler bytes to the destination.
pub struct MockDownloader {
    chunk_size: u64,
    delay: Duration,
    stop_delay: Duration,
    running: Concurrency,
    hold: Breakpoint,
    fail_at: Mutex<Option<u64>>,
    requests: Mutex<Vec<DownloadRequest>>,
}

impl MockDownloader {
    pub fn new() -> Self {
        Self {
            chunk_size: 100,
            delay: Duration::from_millis(1),
            stop_delay: Duration::ZERO,
            running: Concurrency::default(),
            hold: Breakpoint::default(),
            fail_at: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Linger this long after noticing cancellation before returning.
    pub fn with_stop_delay(mut self, stop_delay: Duration) -> Self {
        self.stop_delay = stop_delay;
        self
    }

    /// Most transfers that were ever running at once.
    pub fn max_concurrent(&self) -> usize {
        self.running.peak()
    }

    /// Wait once `bytes` are on disk until [`release`](Self::release) or
    /// cancellation.
    pub fn hold_at(&self, bytes: u64) {
        self.hold.arm(Some(bytes));
    }

    pub fn release(&self) {
        self.hold.release();
    }

    /// The transfer is currently waiting at its hold point.
    pub fn is_held(&self) -> bool {
        self.hold.is_held()
    }

    /// Fail the next transfer once `bytes` are on disk.
    pub fn fail_at(&self, bytes: u64) {
        *lock(&self.fail_at) = Some(bytes);
    }

    /// Every request received, oldest first.
    pub fn requests(&self) -> Vec<DownloadRequest> {
        lock(&self.requests).clone()
    }
}

impl Default for MockDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Downloader for MockDownloader {
    async fn download(
        &self,
        request: DownloadRequest,
        listener: &dyn TransferListener,
        cancel: CancelFlag,
    ) -> std::result::Result<(), TransferError> {
        let _running = self.running.enter();
        let result = self.transfer(request, listener, &cancel).await;
        if matches!(result, Err(TransferError::Cancelled)) {
            tokio::time::sleep(self.stop_delay).await;
        }
        result
    }
}

impl MockDownloader {
    async fn transfer(
        &self,
        request: DownloadRequest,
        listener: &dyn TransferListener,
        cancel: &CancelFlag,
    ) -> std::result::Result<(), TransferError> {
        debug!(download_id = %request.download_id, offset = request.offset, "Mock transfer");
        lock(&self.requests).push(request.clone());

        if let Some(parent) = request.destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::Failed(e.to_string()))?;
        }

        let total = if request.expected_size == 0 {
            DEFAULT_TRANSFER_SIZE
        } else {
            request.expected_size
        };
        let offset = request.offset.min(total);
        let resumed = offset > 0;

        let opened = if resumed {
            OpenOptions::new()
                .append(true)
                .open(&request.destination)
                .await
        } else {
            File::create(&request.destination).await
        };
        let mut file = opened.map_err(|e| TransferError::Failed(e.to_string()))?;

        listener.on_response(ResponseInfo {
            status_code: if resumed { 206 } else { 200 },
            content_length: Some(total - offset),
            resumed,
        });

        let mut done = offset;
        while done < total {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if !self.hold.pass(done, cancel).await {
                return Err(TransferError::Cancelled);
            }
            let failing = {
                let mut fail_at = lock(&self.fail_at);
                match *fail_at {
                    Some(at) if done >= at => {
                        *fail_at = None;
                        true
                    }
                    _ => false,
                }
            };
            if failing {
                return Err(TransferError::Failed("Connection reset by peer".to_string()));
            }

            let n = self.chunk_size.min(total - done);
            let chunk = vec![b'u'; n as usize];
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::Failed(e.to_string()))?;
            file.flush()
                .await
                .map_err(|e| TransferError::Failed(e.to_string()))?;
            done += n;
            listener.on_progress(done, total);

            tokio::time::sleep(self.delay).await;
        }

        Ok(())
    }
}

// =============================================================================
// Verifier
// =============================================================================

/// Accepts any readable artifact unless told to fail.
pub struct MockVerifier {
    fail: AtomicBool,
    hold: Breakpoint,
    calls: AtomicUsize,
}

impl MockVerifier {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            hold: Breakpoint::default(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Hold the next verification until [`release`](Self::release).
    pub fn hold(&self) {
        self.hold.arm(Some(0));
    }

    pub fn release(&self) {
        self.hold.release();
    }

    pub fn is_held(&self) -> bool {
        self.hold.is_held()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Verifier for MockVerifier {
    async fn verify(
        &self,
        update: &UpdateInfo,
        artifact: &Path,
    ) -> std::result::Result<(), VerifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.hold.pass(0, &CancelFlag::new()).await;

        let actual = fs::metadata(artifact)
            .await
            .map_err(|e| VerifyError::Unreadable(e.to_string()))?
            .len();
        if self.fail.load(Ordering::SeqCst) {
            return Err(VerifyError::ChecksumMismatch {
                expected: update.checksum.clone().unwrap_or_else(|| "mock".to_string()),
                actual: "corrupt".to_string(),
            });
        }
        if update.file_size > 0 && actual != update.file_size {
            return Err(VerifyError::SizeMismatch {
                expected: update.file_size,
                actual,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Installer
// =============================================================================

/// Simulated installer that walks through fixed progress steps.
pub struct MockInstaller {
    ab: bool,
    suspend: bool,
    delay: Duration,
    stop_delay: Duration,
    running: Concurrency,
    hold: Breakpoint,
    fail: AtomicBool,
    /// Step index reached by the last stopped install
    stopped_at: Mutex<Option<(String, usize)>>,
    performance_mode: Mutex<Option<bool>>,
    requests: Mutex<Vec<InstallRequest>>,
}

impl MockInstaller {
    /// A/B installer with suspend support.
    pub fn new() -> Self {
        Self {
            ab: true,
            suspend: true,
            delay: Duration::from_millis(1),
            stop_delay: Duration::ZERO,
            running: Concurrency::default(),
            hold: Breakpoint::default(),
            fail: AtomicBool::new(false),
            stopped_at: Mutex::new(None),
            performance_mode: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Legacy installer without suspend support.
    pub fn legacy() -> Self {
        Self {
            ab: false,
            suspend: false,
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Linger this long after being stopped before returning.
    pub fn with_stop_delay(mut self, stop_delay: Duration) -> Self {
        self.stop_delay = stop_delay;
        self
    }

    /// Most installs that were ever running at once.
    pub fn max_concurrent(&self) -> usize {
        self.running.peak()
    }

    /// Wait once `progress` has been reported until released or stopped.
    pub fn hold_at(&self, progress: u8) {
        self.hold.arm(Some(progress as u64));
    }

    pub fn release(&self) {
        self.hold.release();
    }

    pub fn is_held(&self) -> bool {
        self.hold.is_held()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Last performance mode requested, if any.
    pub fn performance_mode(&self) -> Option<bool> {
        *lock(&self.performance_mode)
    }

    pub fn requests(&self) -> Vec<InstallRequest> {
        lock(&self.requests).clone()
    }

    fn steps(&self) -> &'static [(u8, bool)] {
        if self.ab {
            &[(30, false), (60, false), (90, false), (95, true), (100, true)]
        } else {
            &[(25, false), (50, false), (75, false), (100, false)]
        }
    }
}

impl Default for MockInstaller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Installer for MockInstaller {
    async fn install(
        &self,
        request: InstallRequest,
        listener: &dyn InstallListener,
        cancel: CancelFlag,
    ) -> std::result::Result<(), InstallError> {
        let _running = self.running.enter();
        let result = self.apply(request, listener, &cancel).await;
        if matches!(result, Err(InstallError::Stopped)) {
            tokio::time::sleep(self.stop_delay).await;
        }
        result
    }

    fn is_ab(&self) -> bool {
        self.ab
    }

    fn supports_suspend(&self) -> bool {
        self.suspend
    }

    fn set_performance_mode(&self, enabled: bool) {
        *lock(&self.performance_mode) = Some(enabled);
    }
}

impl MockInstaller {
    async fn apply(
        &self,
        request: InstallRequest,
        listener: &dyn InstallListener,
        cancel: &CancelFlag,
    ) -> std::result::Result<(), InstallError> {
        lock(&self.requests).push(request.clone());

        if !request.package.exists() {
            return Err(InstallError::Failed(format!(
                "Package {} is missing",
                request.package.display()
            )));
        }

        let start = match lock(&self.stopped_at).take() {
            Some((id, step)) if request.resume && id == request.download_id => step,
            _ => 0,
        };

        let steps = self.steps();
        for (index, &(progress, finalizing)) in steps.iter().enumerate().skip(start) {
            if cancel.is_cancelled() {
                *lock(&self.stopped_at) = Some((request.download_id.clone(), index));
                return Err(InstallError::Stopped);
            }
            if self.fail.load(Ordering::SeqCst) && progress >= 50 {
                return Err(InstallError::Failed("Payload application failed".to_string()));
            }

            listener.on_progress(progress, finalizing);
            tokio::time::sleep(self.delay).await;

            if !self.hold.pass(progress as u64, cancel).await {
                *lock(&self.stopped_at) = Some((request.download_id.clone(), index + 1));
                return Err(InstallError::Stopped);
            }
        }

        info!(download_id = %request.download_id, "Mock install finished");
        Ok(())
    }
}

// =============================================================================
// Manifest source
// =============================================================================

/// Serves a fixed update list.
pub struct MockManifestSource {
    body: Mutex<Vec<u8>>,
    failing: AtomicBool,
    fetches: AtomicUsize,
}

impl MockManifestSource {
    pub fn new() -> Self {
        Self::with_body(br#"{"response": []}"#.to_vec())
    }

    pub fn with_body(body: Vec<u8>) -> Self {
        Self {
            body: Mutex::new(body),
            failing: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set_body(&self, body: impl Into<Vec<u8>>) {
        *lock(&self.body) = body.into();
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Default for MockManifestSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManifestSource for MockManifestSource {
    async fn fetch(&self) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpdaterError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "update server unreachable",
            )));
        }
        Ok(lock(&self.body).clone())
    }
}

// =============================================================================
// Device
// =============================================================================

/// Device state set directly by tests. Starts with no battery and no
/// scratch overlay, so installation is allowed.
#[derive(Default)]
pub struct MockDeviceConditions {
    battery: Mutex<Option<BatteryState>>,
    scratch_mounted: AtomicBool,
}

impl MockDeviceConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_battery(&self, percent: u8, charging: bool) {
        *lock(&self.battery) = Some(BatteryState { percent, charging });
    }

    pub fn set_scratch_mounted(&self, mounted: bool) {
        self.scratch_mounted.store(mounted, Ordering::SeqCst);
    }
}

impl DeviceConditions for MockDeviceConditions {
    fn battery(&self) -> Option<BatteryState> {
        *lock(&self.battery)
    }

    fn is_scratch_mounted(&self) -> bool {
        self.scratch_mounted.load(Ordering::SeqCst)
    }
}

impl Collaborators {
    /// Mock collaborators backed by an in-memory store.
    pub fn mock() -> Self {
        info!("Using mock updater collaborators");
        Self {
            downloader: Arc::new(
                MockDownloader::new()
                    .with_chunk_size(64 * 1024)
                    .with_delay(Duration::from_millis(20)),
            ),
            verifier: Arc::new(MockVerifier::new()),
            installer: Arc::new(MockInstaller::new().with_delay(Duration::from_millis(500))),
            store: Arc::new(MemoryStore::new()),
            manifest_source: Arc::new(MockManifestSource::new()),
            device: Arc::new(MockDeviceConditions::new()),
        }
    }
}
