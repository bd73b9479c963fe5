//! Recovery installer
//!
//! Stages the package where the recovery environment can read it and writes
//! the recovery command file. The package is applied on the next reboot into
//! recovery, so there is no finalizing phase and no suspend.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument};

use crate::config::LegacyConfig;
use crate::error::InstallError;
use crate::traits::{CancelFlag, InstallListener, InstallRequest, Installer};

const CHUNK_SIZE: usize = 256 * 1024;

/// Installs packages through the recovery environment.
pub struct LegacyInstaller {
    staging_dir: PathBuf,
    command_file: PathBuf,
}

impl LegacyInstaller {
    pub fn new(config: &LegacyConfig) -> Self {
        Self {
            staging_dir: config.staging_dir.clone(),
            command_file: config.command_file.clone(),
        }
    }

    fn failed(context: &str, e: std::io::Error) -> InstallError {
        InstallError::Failed(format!("{}: {}", context, e))
    }

    async fn write_command(&self, package: &std::path::Path) -> Result<(), InstallError> {
        if let Some(parent) = self.command_file.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::failed("Failed to create recovery directory", e))?;
        }
        let command = format!("--update_package={}\n", package.display());
        fs::write(&self.command_file, command)
            .await
            .map_err(|e| Self::failed("Failed to write recovery command", e))?;
        debug!(path = %self.command_file.display(), "Wrote recovery command");
        Ok(())
    }
}

#[async_trait]
impl Installer for LegacyInstaller {
    #[instrument(skip(self, listener, cancel), fields(download_id = %request.download_id))]
    async fn install(
        &self,
        request: InstallRequest,
        listener: &dyn InstallListener,
        cancel: CancelFlag,
    ) -> Result<(), InstallError> {
        fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| Self::failed("Failed to create staging directory", e))?;

        let file_name = request
            .package
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "update.zip".into());
        let staged = self.staging_dir.join(file_name);

        let mut source = File::open(&request.package)
            .await
            .map_err(|e| Self::failed("Failed to open package", e))?;
        let total = source
            .metadata()
            .await
            .map_err(|e| Self::failed("Failed to stat package", e))?
            .len();
        let mut out = File::create(&staged)
            .await
            .map_err(|e| Self::failed("Failed to create staged package", e))?;

        info!(staged = %staged.display(), "Staging package for recovery");

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut copied = 0u64;
        loop {
            if cancel.is_cancelled() {
                drop(out);
                let _ = fs::remove_file(&staged).await;
                return Err(InstallError::Stopped);
            }
            let n = source
                .read(&mut buffer)
                .await
                .map_err(|e| Self::failed("Failed to read package", e))?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])
                .await
                .map_err(|e| Self::failed("Failed to stage package", e))?;
            copied += n as u64;
            if total > 0 {
                listener.on_progress((copied * 99 / total) as u8, false);
            }
        }
        out.sync_all()
            .await
            .map_err(|e| Self::failed("Failed to sync staged package", e))?;

        self.write_command(&staged).await?;
        listener.on_progress(100, false);

        info!(version = %request.version, "Package staged. Reboot into recovery to apply.");
        Ok(())
    }

    fn is_ab(&self) -> bool {
        false
    }

    fn supports_suspend(&self) -> bool {
        false
    }

    fn set_performance_mode(&self, _enabled: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Recorder(Mutex<Vec<u8>>);

    impl InstallListener for Recorder {
        fn on_progress(&self, progress: u8, finalizing: bool) {
            assert!(!finalizing);
            self.0.lock().unwrap().push(progress);
        }
    }

    #[tokio::test]
    async fn test_stages_package_and_writes_command() {
        let dir = TempDir::new().unwrap();
        let installer = LegacyInstaller::new(&LegacyConfig {
            staging_dir: dir.path().join("staging"),
            command_file: dir.path().join("recovery/command"),
        });
        let package = dir.path().join("os-21.0.zip");
        std::fs::write(&package, vec![1u8; 1000]).unwrap();

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

        let staged = dir.path().join("staging/os-21.0.zip");
        assert_eq!(std::fs::metadata(&staged).unwrap().len(), 1000);
        let command = std::fs::read_to_string(dir.path().join("recovery/command")).unwrap();
        assert_eq!(command, format!("--update_package={}\n", staged.display()));
        assert_eq!(recorder.0.lock().unwrap().last(), Some(&100));
        assert!(!installer.supports_suspend());
    }

    #[tokio::test]
    async fn test_stop_discards_staged_copy() {
        let dir = TempDir::new().unwrap();
        let installer = LegacyInstaller::new(&LegacyConfig {
            staging_dir: dir.path().join("staging"),
            command_file: dir.path().join("command"),
        });
        let package = dir.path().join("os.zip");
        std::fs::write(&package, vec![1u8; 10]).unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let request = InstallRequest {
            download_id: "a1".to_string(),
            version: "21.0".to_string(),
            package,
            resume: false,
        };
        let result = installer
            .install(request, &Recorder(Mutex::new(Vec::new())), cancel)
            .await;

        assert_eq!(result, Err(InstallError::Stopped));
        assert!(!dir.path().join("staging/os.zip").exists());
        assert!(!dir.path().join("command").exists());
    }
}
