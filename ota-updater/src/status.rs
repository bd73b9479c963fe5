//! Status taxonomy.
//!
//! Two enumerations describe an update: the transient [`UpdateStatus`] (what
//! is happening right now, not durable) and the coarse [`PersistentStatus`]
//! that survives a restart. [`is_active_layout`] derives which of the two
//! presenter layouts applies.

use serde::{Deserialize, Serialize};

/// What is happening to an update right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
    /// Known, nothing requested yet.
    #[default]
    Unknown,

    /// Download requested, no response from the transfer yet.
    Starting,

    /// Bytes are arriving, or the transfer was paused by the user.
    Downloading,

    /// Transfer halted by a recoverable network or storage failure.
    PausedError,

    /// Integrity check running.
    Verifying,

    /// Download complete and integrity confirmed.
    Verified,

    /// Integrity check failed; the artifact was discarded.
    VerificationFailed,

    /// Installation running.
    Installing,

    /// Installation interrupted in a resumable way.
    InstallationSuspended,

    /// Installer reported an error; the verified artifact is kept.
    InstallationFailed,

    /// Installation finished; waiting for reboot.
    Installed,

    /// Logically removed. Observers treat the update as absent.
    Deleted,
}

impl UpdateStatus {
    /// Whether a download worker may own the update in this status.
    pub fn is_download_phase(&self) -> bool {
        matches!(self, UpdateStatus::Starting | UpdateStatus::Downloading)
    }

    /// Whether `start_download` is accepted from this status.
    pub fn accepts_download(&self) -> bool {
        match self {
            UpdateStatus::Unknown
            | UpdateStatus::Downloading
            | UpdateStatus::PausedError
            | UpdateStatus::VerificationFailed => true,
            UpdateStatus::Starting
            | UpdateStatus::Verifying
            | UpdateStatus::Verified
            | UpdateStatus::Installing
            | UpdateStatus::InstallationSuspended
            | UpdateStatus::InstallationFailed
            | UpdateStatus::Installed
            | UpdateStatus::Deleted => false,
        }
    }
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdateStatus::Unknown => "UNKNOWN",
            UpdateStatus::Starting => "STARTING",
            UpdateStatus::Downloading => "DOWNLOADING",
            UpdateStatus::PausedError => "PAUSED_ERROR",
            UpdateStatus::Verifying => "VERIFYING",
            UpdateStatus::Verified => "VERIFIED",
            UpdateStatus::VerificationFailed => "VERIFICATION_FAILED",
            UpdateStatus::Installing => "INSTALLING",
            UpdateStatus::InstallationSuspended => "INSTALLATION_SUSPENDED",
            UpdateStatus::InstallationFailed => "INSTALLATION_FAILED",
            UpdateStatus::Installed => "INSTALLED",
            UpdateStatus::Deleted => "DELETED",
        };
        write!(f, "{}", s)
    }
}

/// Restart-durable summary of an update's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistentStatus {
    /// No completed download yet.
    #[default]
    Unknown,
    /// Partial file on disk.
    Incomplete,
    /// Verified artifact ready to install.
    Verified,
    /// Installation completed for this artifact.
    Installed,
}

impl std::fmt::Display for PersistentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistentStatus::Unknown => write!(f, "UNKNOWN"),
            PersistentStatus::Incomplete => write!(f, "INCOMPLETE"),
            PersistentStatus::Verified => write!(f, "VERIFIED"),
            PersistentStatus::Installed => write!(f, "INSTALLED"),
        }
    }
}

/// Whether an update should be shown with the active-operation layout.
///
/// `any_verifying` is the controller-wide verifying flag, not the value for
/// this update; every persistent status without its own arm falls back to it.
pub fn is_active_layout(
    persistent: PersistentStatus,
    status: UpdateStatus,
    any_verifying: bool,
) -> bool {
    match persistent {
        PersistentStatus::Unknown => status == UpdateStatus::Starting,
        PersistentStatus::Verified => status == UpdateStatus::Installing,
        PersistentStatus::Incomplete => true,
        PersistentStatus::Installed => any_verifying,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_is_active_only_when_starting() {
        assert!(is_active_layout(PersistentStatus::Unknown, UpdateStatus::Starting, false));
        assert!(!is_active_layout(PersistentStatus::Unknown, UpdateStatus::Unknown, false));
        assert!(!is_active_layout(PersistentStatus::Unknown, UpdateStatus::Downloading, true));
        assert!(!is_active_layout(
            PersistentStatus::Unknown,
            UpdateStatus::VerificationFailed,
            true
        ));
    }

    #[test]
    fn test_verified_is_active_only_when_installing() {
        assert!(is_active_layout(PersistentStatus::Verified, UpdateStatus::Installing, false));
        assert!(!is_active_layout(PersistentStatus::Verified, UpdateStatus::Verified, true));
        assert!(!is_active_layout(
            PersistentStatus::Verified,
            UpdateStatus::InstallationSuspended,
            false
        ));
    }

    #[test]
    fn test_incomplete_is_always_active() {
        for status in [
            UpdateStatus::Starting,
            UpdateStatus::Downloading,
            UpdateStatus::PausedError,
            UpdateStatus::Verifying,
        ] {
            assert!(is_active_layout(PersistentStatus::Incomplete, status, false));
        }
    }

    #[test]
    fn test_installed_falls_back_to_global_verifying_flag() {
        assert!(!is_active_layout(PersistentStatus::Installed, UpdateStatus::Installed, false));
        assert!(is_active_layout(PersistentStatus::Installed, UpdateStatus::Installed, true));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&UpdateStatus::InstallationSuspended).unwrap();
        assert_eq!(json, "\"INSTALLATION_SUSPENDED\"");
        assert_eq!(UpdateStatus::PausedError.to_string(), "PAUSED_ERROR");

        let parsed: PersistentStatus = serde_json::from_str("\"INCOMPLETE\"").unwrap();
        assert_eq!(parsed, PersistentStatus::Incomplete);
    }
}
