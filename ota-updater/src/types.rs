//! Update record and related data types.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::status::{PersistentStatus, UpdateStatus};

/// Download id reserved for a locally imported (sideloaded) package.
pub const LOCAL_ID: &str = "local";

/// One known update: immutable identity and metadata plus the mutable status
/// fields owned by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    /// Unique, immutable identity.
    pub download_id: String,
    /// Display name, usually the package file name.
    pub name: String,
    /// OS version the package targets.
    pub version: String,
    /// Build time, seconds since the Unix epoch.
    pub timestamp: i64,
    /// Expected total size in bytes.
    pub file_size: u64,
    /// Where the package is fetched from. Empty for local imports.
    #[serde(default)]
    pub url: String,
    /// Hex encoded SHA-256 of the package, when the server publishes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// On-disk artifact. A relative path is resolved against the download
    /// directory when the update is registered.
    pub file: PathBuf,
    /// Bytes present on disk for the current download.
    #[serde(default)]
    pub downloaded_bytes: u64,
    #[serde(default)]
    pub status: UpdateStatus,
    #[serde(default)]
    pub persistent_status: PersistentStatus,
    /// Download completion, 0-100.
    #[serde(default)]
    pub progress: u8,
    /// Install completion, 0-100.
    #[serde(default)]
    pub install_progress: u8,
    /// A/B install entered its finalization phase.
    #[serde(default)]
    pub finalizing: bool,
    /// Still listed by the update server.
    #[serde(default)]
    pub available_online: bool,
}

impl UpdateInfo {
    /// Create a freshly discovered update with no local state.
    pub fn new(
        download_id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        timestamp: i64,
        file_size: u64,
    ) -> Self {
        let name = name.into();
        Self {
            download_id: download_id.into(),
            file: PathBuf::from(&name),
            name,
            version: version.into(),
            timestamp,
            file_size,
            url: String::new(),
            checksum: None,
            downloaded_bytes: 0,
            status: UpdateStatus::Unknown,
            persistent_status: PersistentStatus::Unknown,
            progress: 0,
            install_progress: 0,
            finalizing: false,
            available_online: false,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = file.into();
        self
    }

    /// Whether this is the sideloaded update.
    pub fn is_local(&self) -> bool {
        self.download_id == LOCAL_ID
    }

    /// Download percentage for `done` bytes, clamped to 0-100.
    pub fn percent_of(&self, done: u64) -> u8 {
        percent(done, self.file_size)
    }

    /// Copy server metadata from a newer listing of the same update.
    ///
    /// Status fields are left alone so an in-flight operation is undisturbed.
    pub(crate) fn merge_metadata(&mut self, other: &UpdateInfo) {
        self.name = other.name.clone();
        self.version = other.version.clone();
        self.timestamp = other.timestamp;
        self.file_size = other.file_size;
        if !other.url.is_empty() {
            self.url = other.url.clone();
        }
        if other.checksum.is_some() {
            self.checksum = other.checksum.clone();
        }
    }

    /// Reset download bookkeeping before a transfer restarts from scratch.
    pub(crate) fn reset_download(&mut self) {
        self.downloaded_bytes = 0;
        self.progress = 0;
    }
}

pub(crate) fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}

/// Restart-durable projection of an [`UpdateInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUpdate {
    pub download_id: String,
    pub name: String,
    pub version: String,
    pub timestamp: i64,
    pub file_size: u64,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub file: PathBuf,
    pub persistent_status: PersistentStatus,
}

impl From<&UpdateInfo> for StoredUpdate {
    fn from(update: &UpdateInfo) -> Self {
        Self {
            download_id: update.download_id.clone(),
            name: update.name.clone(),
            version: update.version.clone(),
            timestamp: update.timestamp,
            file_size: update.file_size,
            url: update.url.clone(),
            checksum: update.checksum.clone(),
            file: update.file.clone(),
            persistent_status: update.persistent_status,
        }
    }
}

impl StoredUpdate {
    /// Rebuild the in-memory record after a restart.
    ///
    /// `on_disk` is the current length of the artifact. Partial downloads come
    /// back halted in `Downloading` so the presenter offers a resume.
    pub fn into_update_info(self, on_disk: u64) -> UpdateInfo {
        let status = match self.persistent_status {
            PersistentStatus::Unknown => UpdateStatus::Unknown,
            PersistentStatus::Incomplete => UpdateStatus::Downloading,
            PersistentStatus::Verified => UpdateStatus::Verified,
            PersistentStatus::Installed => UpdateStatus::Installed,
        };
        let downloaded_bytes = match self.persistent_status {
            PersistentStatus::Unknown => 0,
            PersistentStatus::Incomplete => on_disk.min(self.file_size),
            PersistentStatus::Verified | PersistentStatus::Installed => self.file_size,
        };
        let install_progress = if self.persistent_status == PersistentStatus::Installed {
            100
        } else {
            0
        };

        UpdateInfo {
            progress: percent(downloaded_bytes, self.file_size),
            download_id: self.download_id,
            name: self.name,
            version: self.version,
            timestamp: self.timestamp,
            file_size: self.file_size,
            url: self.url,
            checksum: self.checksum,
            file: self.file,
            downloaded_bytes,
            status,
            persistent_status: self.persistent_status,
            install_progress,
            finalizing: false,
            available_online: false,
        }
    }

    pub fn artifact(&self) -> &Path {
        &self.file
    }
}

/// Identity of the running system build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// OS version, e.g. "21.0". Updates must target the same version.
    #[serde(default = "default_build_version")]
    pub version: String,

    /// Build time of the running system, seconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,

    /// Release type the device tracks (nightly, snapshot, ...).
    #[serde(default = "default_release_type")]
    pub release_type: String,

    /// Accept updates that are not newer than the running build.
    #[serde(default)]
    pub allow_downgrading: bool,
}

fn default_build_version() -> String {
    "1.0".to_string()
}

fn default_release_type() -> String {
    "nightly".to_string()
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            version: default_build_version(),
            timestamp: 0,
            release_type: default_release_type(),
            allow_downgrading: false,
        }
    }
}

/// Metadata supplied with a sideloaded package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalImport {
    pub name: String,
    pub version: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 1000), 0);
        assert_eq!(percent(400, 1000), 40);
        assert_eq!(percent(1000, 1000), 100);
        assert_eq!(percent(2000, 1000), 100);
        assert_eq!(percent(10, 0), 0);
    }

    #[test]
    fn test_merge_keeps_status() {
        let mut existing = UpdateInfo::new("a", "a.zip", "1.0", 100, 1000);
        existing.status = UpdateStatus::Downloading;
        existing.progress = 40;

        let listed = UpdateInfo::new("a", "a.zip", "1.1", 200, 2000).with_url("http://x/a.zip");
        existing.merge_metadata(&listed);

        assert_eq!(existing.version, "1.1");
        assert_eq!(existing.timestamp, 200);
        assert_eq!(existing.file_size, 2000);
        assert_eq!(existing.url, "http://x/a.zip");
        assert_eq!(existing.status, UpdateStatus::Downloading);
        assert_eq!(existing.progress, 40);
    }

    #[test]
    fn test_restore_incomplete_as_halted_download() {
        let mut update = UpdateInfo::new("a", "a.zip", "1.0", 100, 1000);
        update.persistent_status = PersistentStatus::Incomplete;
        let stored = StoredUpdate::from(&update);

        let restored = stored.into_update_info(400);
        assert_eq!(restored.status, UpdateStatus::Downloading);
        assert_eq!(restored.downloaded_bytes, 400);
        assert_eq!(restored.progress, 40);
        assert!(!restored.available_online);
    }
}
