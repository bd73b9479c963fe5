//! SHA-256 artifact verification.

use std::path::Path;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{error, info, instrument};

use crate::error::VerifyError;
use crate::traits::Verifier;
use crate::types::UpdateInfo;

/// Checks the artifact size, then its SHA-256 when the update carries one.
#[derive(Debug, Default, Clone)]
pub struct Sha256Verifier;

impl Sha256Verifier {
    pub fn new() -> Self {
        Self
    }
}

/// Hex SHA-256 of a file, read in 64 KiB blocks.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[async_trait]
impl Verifier for Sha256Verifier {
    #[instrument(skip(self, update), fields(download_id = %update.download_id))]
    async fn verify(&self, update: &UpdateInfo, artifact: &Path) -> Result<(), VerifyError> {
        let actual_size = tokio::fs::metadata(artifact)
            .await
            .map_err(|e| VerifyError::Unreadable(e.to_string()))?
            .len();
        if update.file_size > 0 && actual_size != update.file_size {
            error!(
                expected = update.file_size,
                actual = actual_size,
                "Size mismatch"
            );
            return Err(VerifyError::SizeMismatch {
                expected: update.file_size,
                actual: actual_size,
            });
        }

        if let Some(expected) = &update.checksum {
            let actual = sha256_file(artifact)
                .await
                .map_err(|e| VerifyError::Unreadable(e.to_string()))?;
            if !actual.eq_ignore_ascii_case(expected) {
                error!(
                    expected = %expected,
                    actual = %actual,
                    path = %artifact.display(),
                    "Checksum mismatch"
                );
                return Err(VerifyError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        info!(path = %artifact.display(), "Artifact verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // sha256("hello world")
    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[tokio::test]
    async fn test_checksum_match() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("update.zip");
        std::fs::write(&path, b"hello world").unwrap();

        let update = UpdateInfo::new("a", "update.zip", "1.0", 1, 11).with_checksum(HELLO_SHA256);
        assert!(Sha256Verifier::new().verify(&update, &path).await.is_ok());
    }

    #[tokio::test]
    async fn test_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("update.zip");
        std::fs::write(&path, b"hello worle").unwrap();

        let update = UpdateInfo::new("a", "update.zip", "1.0", 1, 11).with_checksum(HELLO_SHA256);
        assert!(matches!(
            Sha256Verifier::new().verify(&update, &path).await,
            Err(VerifyError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_size_mismatch_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("update.zip");
        std::fs::write(&path, b"short").unwrap();

        let update = UpdateInfo::new("a", "update.zip", "1.0", 1, 11);
        assert_eq!(
            Sha256Verifier::new().verify(&update, &path).await,
            Err(VerifyError::SizeMismatch {
                expected: 11,
                actual: 5
            })
        );

        let missing = dir.path().join("missing.zip");
        assert!(matches!(
            Sha256Verifier::new().verify(&update, &missing).await,
            Err(VerifyError::Unreadable(_))
        ));
    }
}
