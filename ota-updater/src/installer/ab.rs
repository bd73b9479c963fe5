//! A/B slot installer
//!
//! Install flow:
//! 1. Detect the booted slot from the kernel command line
//! 2. Stream the package into the INACTIVE slot, reporting progress
//! 3. Sync the slot and write the slot switch state (finalizing phase)
//! 4. The bootloader picks the new slot on the next reboot
//!
//! A stopped install remembers how far it got, so a resume continues writing
//! from that offset instead of starting over.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info, instrument, warn};

use crate::config::AbConfig;
use crate::error::InstallError;
use crate::traits::{CancelFlag, InstallListener, InstallRequest, Installer};

/// Share of the overall progress spent writing; the rest is finalization.
const WRITE_PHASE_PERCENT: u64 = 90;

const CHUNK_SIZE: usize = 256 * 1024;
const PERF_CHUNK_SIZE: usize = 1024 * 1024;

/// Partition slot identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    /// Get the opposite slot
    pub fn other(&self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// Suffix used by the bootloader for this slot
    pub fn suffix(&self) -> &'static str {
        match self {
            Slot::A => "_a",
            Slot::B => "_b",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::A => write!(f, "A"),
            Slot::B => write!(f, "B"),
        }
    }
}

/// Booted slot named by a kernel command line, if any.
pub fn parse_slot(cmdline: &str) -> Option<Slot> {
    cmdline.split_whitespace().find_map(|arg| {
        let (key, value) = arg.split_once('=')?;
        match (key, value) {
            ("androidboot.slot_suffix", "_a") | ("androidboot.slot", "a") => Some(Slot::A),
            ("androidboot.slot_suffix", "_b") | ("androidboot.slot", "b") => Some(Slot::B),
            ("root", v) if v.ends_with("system_a") => Some(Slot::A),
            ("root", v) if v.ends_with("system_b") => Some(Slot::B),
            _ => None,
        }
    })
}

/// Slot switch state persisted for the bootloader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbSlotState {
    /// Slot that was active before the update
    pub previous_slot: Slot,
    /// Slot to boot after the update
    pub target_slot: Slot,
    pub target_version: String,
    pub download_id: String,
    /// Number of boot attempts on the new slot
    pub boot_attempts: u32,
    /// Maximum boot attempts before rollback
    pub max_attempts: u32,
    /// The switch has not been confirmed by a successful boot yet
    pub pending: bool,
}

/// Installs packages into the inactive slot.
pub struct AbSlotInstaller {
    cmdline: PathBuf,
    slot_a: PathBuf,
    slot_b: PathBuf,
    state_file: PathBuf,
    performance_mode: AtomicBool,
    /// Download id and bytes written by the last stopped install
    suspended_at: Mutex<Option<(String, u64)>>,
}

impl AbSlotInstaller {
    pub fn new(config: &AbConfig) -> Self {
        Self {
            cmdline: config.cmdline.clone(),
            slot_a: config.slot_a.clone(),
            slot_b: config.slot_b.clone(),
            state_file: config.state_file.clone(),
            performance_mode: AtomicBool::new(false),
            suspended_at: Mutex::new(None),
        }
    }

    /// Detect the currently booted slot
    #[instrument(skip(self))]
    pub async fn detect_current_slot(&self) -> Slot {
        match fs::read_to_string(&self.cmdline).await {
            Ok(cmdline) => match parse_slot(&cmdline) {
                Some(slot) => {
                    debug!(slot = %slot, "Detected booted slot");
                    slot
                }
                None => {
                    warn!("Could not determine boot slot from cmdline, assuming A");
                    Slot::A
                }
            },
            Err(e) => {
                warn!(error = %e, "Failed to read kernel command line, assuming slot A");
                Slot::A
            }
        }
    }

    fn slot_path(&self, slot: Slot) -> &Path {
        match slot {
            Slot::A => &self.slot_a,
            Slot::B => &self.slot_b,
        }
    }

    fn take_resume_offset(&self, download_id: &str) -> u64 {
        let mut guard = self
            .suspended_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.take() {
            Some((id, offset)) if id == download_id => offset,
            _ => 0,
        }
    }

    fn remember_offset(&self, download_id: &str, offset: u64) {
        *self
            .suspended_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((download_id.to_string(), offset));
    }

    /// Load the slot switch state
    pub async fn load_state(&self) -> Result<Option<AbSlotState>, InstallError> {
        if !self.state_file.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.state_file)
            .await
            .map_err(|e| InstallError::Failed(format!("Failed to read slot state: {}", e)))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| InstallError::Failed(format!("Corrupt slot state: {}", e)))
    }

    async fn save_state(&self, state: &AbSlotState) -> Result<(), InstallError> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| InstallError::Failed(e.to_string()))?;
        if let Some(parent) = self.state_file.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| InstallError::Failed(e.to_string()))?;
        }
        fs::write(&self.state_file, json)
            .await
            .map_err(|e| InstallError::Failed(format!("Failed to write slot state: {}", e)))?;

        info!(path = %self.state_file.display(), "Saved slot switch state");
        Ok(())
    }

    async fn open_target(&self, target: &Path, offset: u64) -> std::io::Result<File> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(target)
            .await?;
        if offset == 0 && file.metadata().await?.is_file() {
            file.set_len(0).await?;
        }
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file)
    }
}

fn io_failed(context: &str, e: std::io::Error) -> InstallError {
    InstallError::Failed(format!("{}: {}", context, e))
}

#[async_trait]
impl Installer for AbSlotInstaller {
    #[instrument(skip(self, listener, cancel), fields(download_id = %request.download_id))]
    async fn install(
        &self,
        request: InstallRequest,
        listener: &dyn InstallListener,
        cancel: CancelFlag,
    ) -> Result<(), InstallError> {
        let current = self.detect_current_slot().await;
        let target_slot = current.other();
        let target = self.slot_path(target_slot).to_path_buf();

        let mut package = File::open(&request.package)
            .await
            .map_err(|e| io_failed("Failed to open package", e))?;
        let total = package
            .metadata()
            .await
            .map_err(|e| io_failed("Failed to stat package", e))?
            .len();

        let mut written = if request.resume {
            self.take_resume_offset(&request.download_id).min(total)
        } else {
            self.take_resume_offset("");
            0
        };

        info!(
            current = %current,
            target = %target_slot,
            offset = written,
            "Writing package to inactive slot"
        );

        package
            .seek(SeekFrom::Start(written))
            .await
            .map_err(|e| io_failed("Failed to seek package", e))?;
        let mut out = self
            .open_target(&target, written)
            .await
            .map_err(|e| io_failed("Failed to open target slot", e))?;

        let chunk = if self.performance_mode.load(Ordering::Relaxed) {
            PERF_CHUNK_SIZE
        } else {
            CHUNK_SIZE
        };
        let mut buffer = vec![0u8; chunk];

        loop {
            if cancel.is_cancelled() {
                let _ = out.flush().await;
                self.remember_offset(&request.download_id, written);
                info!(written = written, "Slot write stopped");
                return Err(InstallError::Stopped);
            }

            let n = package
                .read(&mut buffer)
                .await
                .map_err(|e| io_failed("Failed to read package", e))?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])
                .await
                .map_err(|e| io_failed("Failed to write slot", e))?;
            written += n as u64;

            let percent = if total == 0 {
                WRITE_PHASE_PERCENT
            } else {
                written * WRITE_PHASE_PERCENT / total
            };
            listener.on_progress(percent as u8, false);

            if !self.performance_mode.load(Ordering::Relaxed) {
                tokio::task::yield_now().await;
            }
        }

        // Finalize
        out.flush()
            .await
            .map_err(|e| io_failed("Failed to flush slot", e))?;
        out.sync_all()
            .await
            .map_err(|e| io_failed("Failed to sync slot", e))?;
        listener.on_progress(WRITE_PHASE_PERCENT as u8 + 5, true);

        self.save_state(&AbSlotState {
            previous_slot: current,
            target_slot,
            target_version: request.version.clone(),
            download_id: request.download_id.clone(),
            boot_attempts: 0,
            max_attempts: 3,
            pending: true,
        })
        .await?;
        listener.on_progress(100, true);

        info!(slot = %target_slot, "A/B update prepared. Reboot to apply.");
        Ok(())
    }

    fn is_ab(&self) -> bool {
        true
    }

    fn supports_suspend(&self) -> bool {
        true
    }

    fn set_performance_mode(&self, enabled: bool) {
        self.performance_mode.store(enabled, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Recorder(Mutex<Vec<(u8, bool)>>);

    impl InstallListener for Recorder {
        fn on_progress(&self, progress: u8, finalizing: bool) {
            self.0.lock().unwrap().push((progress, finalizing));
        }
    }

    fn installer(dir: &TempDir, cmdline: &str) -> AbSlotInstaller {
        let cmdline_path = dir.path().join("cmdline");
        std::fs::write(&cmdline_path, cmdline).unwrap();
        AbSlotInstaller::new(&AbConfig {
            cmdline: cmdline_path,
            slot_a: dir.path().join("system_a.img"),
            slot_b: dir.path().join("system_b.img"),
            state_file: dir.path().join("ab-state.json"),
        })
    }

    #[test]
    fn test_slot_other() {
        assert_eq!(Slot::A.other(), Slot::B);
        assert_eq!(Slot::B.other(), Slot::A);
    }

    #[test]
    fn test_parse_slot() {
        assert_eq!(parse_slot("quiet androidboot.slot_suffix=_a"), Some(Slot::A));
        assert_eq!(parse_slot("androidboot.slot=b ro"), Some(Slot::B));
        assert_eq!(parse_slot("root=/dev/disk/by-partlabel/system_b"), Some(Slot::B));
        assert_eq!(parse_slot("console=ttyS0"), None);
    }

    #[tokio::test]
    async fn test_installs_into_inactive_slot() {
        let dir = TempDir::new().unwrap();
        let installer = installer(&dir, "androidboot.slot_suffix=_a");
        let package = dir.path().join("update.zip");
        let payload: Vec<u8> = (0..600_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&package, &payload).unwrap();

        let recorder = Recorder(Mutex::new(Vec::new()));
        let request = InstallRequest {
            download_id: "a1".to_string(),
            version: "21.0".to_string(),
            package,
            resume: false,
        };
        installer
            .install(request, &recorder, CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(dir.path().join("system_b.img")).unwrap(), payload);
        assert!(!dir.path().join("system_a.img").exists());

        let progress = recorder.0.lock().unwrap().clone();
        assert!(progress.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(progress.last(), Some(&(100, true)));

        let state = installer.load_state().await.unwrap().unwrap();
        assert_eq!(state.target_slot, Slot::B);
        assert_eq!(state.download_id, "a1");
        assert!(state.pending);
    }

    #[tokio::test]
    async fn test_stopped_install_resumes_from_offset() {
        let dir = TempDir::new().unwrap();
        let installer = installer(&dir, "androidboot.slot_suffix=_b");
        let package = dir.path().join("update.zip");
        let payload = vec![7u8; 3 * CHUNK_SIZE];
        std::fs::write(&package, &payload).unwrap();

        struct StopAfterFirst(CancelFlag);
        impl InstallListener for StopAfterFirst {
            fn on_progress(&self, _progress: u8, _finalizing: bool) {
                self.0.cancel();
            }
        }

        let cancel = CancelFlag::new();
        let request = InstallRequest {
            download_id: "a1".to_string(),
            version: "21.0".to_string(),
            package: package.clone(),
            resume: false,
        };
        let result = installer
            .install(request.clone(), &StopAfterFirst(cancel.clone()), cancel)
            .await;
        assert_eq!(result, Err(InstallError::Stopped));
        assert_eq!(
            std::fs::metadata(dir.path().join("system_a.img")).unwrap().len(),
            CHUNK_SIZE as u64
        );

        let recorder = Recorder(Mutex::new(Vec::new()));
        let resumed = InstallRequest {
            resume: true,
            ..request
        };
        installer
            .install(resumed, &recorder, CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(dir.path().join("system_a.img")).unwrap(), payload);
        let first = recorder.0.lock().unwrap()[0];
        assert_eq!(first, (60, false));
    }
}
