//! Update list parsing
//!
//! The update server publishes one JSON document listing every build
//! available for the device:
//!
//! ```json
//! {"response": [{"datetime": 1700000000, "filename": "os-21.0-20231114.zip",
//!   "id": "5f3a...", "romtype": "nightly", "size": 1048576000,
//!   "url": "https://.../os-21.0-20231114.zip", "version": "21.0"}]}
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, UpdaterError};
use crate::types::{BuildInfo, UpdateInfo};

/// Update list published by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub response: Vec<ManifestEntry>,
}

/// One build in the update list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Build time, seconds since the Unix epoch
    pub datetime: i64,

    /// Package file name
    pub filename: String,

    /// Unique download id
    pub id: String,

    /// Release type (nightly, snapshot, ...)
    pub romtype: String,

    /// Package size in bytes
    pub size: u64,

    /// Download URL
    pub url: String,

    /// OS version the build belongs to
    pub version: String,

    /// SHA-256 of the package, when published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ManifestEntry {
    /// Whether this build may be offered to a device running `build`.
    pub fn is_compatible(&self, build: &BuildInfo) -> bool {
        if !build.allow_downgrading && self.datetime <= build.timestamp {
            debug!(id = %self.id, "Skipping build not newer than the running one");
            return false;
        }
        if !self.version.eq_ignore_ascii_case(&build.version) {
            debug!(id = %self.id, version = %self.version, "Skipping build for another version");
            return false;
        }
        if !self.romtype.eq_ignore_ascii_case(&build.release_type) {
            debug!(id = %self.id, romtype = %self.romtype, "Skipping build of another release type");
            return false;
        }
        true
    }

    /// Record for the controller. The file is relative to the download
    /// directory.
    pub fn to_update_info(&self) -> UpdateInfo {
        let mut update = UpdateInfo::new(
            self.id.clone(),
            self.filename.clone(),
            self.version.clone(),
            self.datetime,
            self.size,
        )
        .with_url(self.url.clone());
        update.checksum = self.sha256.clone();
        update.available_online = true;
        update
    }
}

impl Manifest {
    /// Parse a list document.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| UpdaterError::Manifest(e.to_string()))
    }

    /// Updates installable on `build`.
    pub fn compatible_updates(&self, build: &BuildInfo) -> Vec<UpdateInfo> {
        self.response
            .iter()
            .filter(|entry| entry.is_compatible(build))
            .map(ManifestEntry::to_update_info)
            .collect()
    }

    pub fn ids(&self) -> HashSet<&str> {
        self.response.iter().map(|e| e.id.as_str()).collect()
    }
}

/// Whether `new` lists a build `old` did not.
pub fn has_new_updates(old: &Manifest, new: &Manifest) -> bool {
    let known = old.ids();
    new.response.iter().any(|e| !known.contains(e.id.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = r#"{
        "response": [
            {
                "datetime": 1700000000,
                "filename": "os-21.0-20231114-nightly.zip",
                "id": "a1",
                "romtype": "nightly",
                "size": 1048576,
                "url": "https://example.org/a1.zip",
                "version": "21.0"
            },
            {
                "datetime": 1600000000,
                "filename": "os-21.0-20200913-nightly.zip",
                "id": "old",
                "romtype": "nightly",
                "size": 1048576,
                "url": "https://example.org/old.zip",
                "version": "21.0"
            },
            {
                "datetime": 1700000500,
                "filename": "os-22.0-20231114-nightly.zip",
                "id": "next",
                "romtype": "NIGHTLY",
                "size": 1048576,
                "url": "https://example.org/next.zip",
                "version": "22.0",
                "sha256": "abc"
            }
        ]
    }"#;

    fn build() -> BuildInfo {
        BuildInfo {
            version: "21.0".to_string(),
            timestamp: 1650000000,
            release_type: "nightly".to_string(),
            allow_downgrading: false,
        }
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = Manifest::parse(LIST.as_bytes()).unwrap();
        assert_eq!(manifest.response.len(), 3);
        assert_eq!(manifest.response[2].sha256.as_deref(), Some("abc"));

        let updates = manifest.compatible_updates(&build());
        assert_eq!(updates.len(), 1);
        let update = &updates[0];
        assert_eq!(update.download_id, "a1");
        assert_eq!(update.name, "os-21.0-20231114-nightly.zip");
        assert_eq!(update.file_size, 1048576);
        assert!(update.available_online);
        assert!(update.file.is_relative());
    }

    #[test]
    fn test_downgrades_when_allowed() {
        let manifest = Manifest::parse(LIST.as_bytes()).unwrap();
        let build = BuildInfo {
            allow_downgrading: true,
            ..build()
        };
        let ids: Vec<_> = manifest
            .compatible_updates(&build)
            .into_iter()
            .map(|u| u.download_id)
            .collect();
        assert_eq!(ids, vec!["a1".to_string(), "old".to_string()]);
    }

    #[test]
    fn test_invalid_manifest() {
        assert!(matches!(
            Manifest::parse(b"<html>"),
            Err(UpdaterError::Manifest(_))
        ));
        assert!(Manifest::parse(b"{}").unwrap().response.is_empty());
    }

    #[test]
    fn test_has_new_updates() {
        let full = Manifest::parse(LIST.as_bytes()).unwrap();
        let mut partial = full.clone();
        partial.response.truncate(1);

        assert!(has_new_updates(&partial, &full));
        assert!(!has_new_updates(&full, &partial));
        assert!(!has_new_updates(&full, &full));
    }
}
