//! Error types for the update lifecycle.

use thiserror::Error;

use crate::device::InstallBlocker;

/// Errors returned by controller commands and the surrounding services.
///
/// A command that fails with one of these leaves the registry untouched.
#[derive(Error, Debug)]
pub enum UpdaterError {
    /// No update with this download id is known.
    #[error("Update not found: {0}")]
    NotFound(String),

    /// Another download is already running.
    #[error("Download already in progress: {0}")]
    DownloadInProgress(String),

    /// Another installation is already running.
    #[error("Installation already in progress: {0}")]
    InstallInProgress(String),

    /// The update is in a state that does not accept the command.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// The installer cannot perform the request.
    #[error("Installer does not support operation: {0}")]
    Unsupported(String),

    /// A device condition forbids installing right now.
    #[error("Installation blocked: {0}")]
    InstallBlocked(InstallBlocker),

    /// A local import was rejected before any file was touched.
    #[error("Import rejected: {0}")]
    ImportRejected(String),

    /// Verification of an imported package failed.
    #[error("Verification failed: {0}")]
    Verification(#[from] VerifyError),

    /// Persistence store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Update list could not be parsed.
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    /// Network failure while talking to the update server.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The background service is no longer running.
    #[error("Updater service is not running")]
    ServiceStopped,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a failed byte transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The transfer observed its cancel flag.
    #[error("Transfer cancelled")]
    Cancelled,

    /// Network or storage failure; the partial file is kept.
    #[error("Transfer failed: {0}")]
    Failed(String),
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

/// Integrity check failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Could not read artifact: {0}")]
    Unreadable(String),
}

/// Installation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallError {
    /// The installer honoured a stop request; the artifact is intact.
    #[error("Installation stopped")]
    Stopped,

    #[error("Installation failed: {0}")]
    Failed(String),
}

/// Persistence store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access state file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt state file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Result type alias for updater operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;
