//! HTTP artifact downloader with resume support.
//!
//! Streams the response body straight into the destination file:
//! - `Range` requests continue a partial file from its current length
//! - a server that ignores the range restarts the file from zero
//! - the cancel flag is checked between chunks, leaving the partial file

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::error::{TransferError, UpdaterError};
use crate::traits::{CancelFlag, DownloadRequest, Downloader, ResponseInfo, TransferListener};

/// Downloads update artifacts over HTTP(S).
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    /// Create a downloader with the default timeouts.
    pub fn new() -> Result<Self, UpdaterError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn failed(context: &str, e: impl std::fmt::Display) -> TransferError {
    TransferError::Failed(format!("{}: {}", context, e))
}

#[async_trait]
impl Downloader for HttpDownloader {
    #[instrument(skip(self, listener, cancel), fields(download_id = %request.download_id))]
    async fn download(
        &self,
        request: DownloadRequest,
        listener: &dyn TransferListener,
        cancel: CancelFlag,
    ) -> Result<(), TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        if let Some(parent) = request.destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| failed("Failed to create download directory", e))?;
        }

        let mut offset = request.offset;
        let mut http = self.client.get(&request.url);
        if offset > 0 {
            info!(
                existing = offset,
                total = request.expected_size,
                "Resuming download"
            );
            http = http.header(RANGE, format!("bytes={}-", offset));
        }

        let response = http
            .send()
            .await
            .map_err(|e| failed("Failed to start download", e))?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            // The partial file already holds every byte the server has.
            listener.on_response(ResponseInfo {
                status_code: status.as_u16(),
                content_length: Some(0),
                resumed: true,
            });
            listener.on_progress(offset, request.expected_size.max(offset));
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Failed(format!(
                "Download failed with status {}: {}",
                status, body
            )));
        }

        let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        if offset > 0 && !resumed {
            warn!("Server ignored range request, restarting from zero");
            offset = 0;
        }

        let content_length = response.content_length();
        listener.on_response(ResponseInfo {
            status_code: status.as_u16(),
            content_length,
            resumed,
        });

        let total = match (request.expected_size, content_length) {
            (0, Some(len)) => len + offset,
            (expected, _) => expected,
        };

        // Append when resuming, truncate otherwise.
        let opened = if resumed {
            OpenOptions::new()
                .append(true)
                .open(&request.destination)
                .await
        } else {
            File::create(&request.destination).await
        };
        let mut file = opened.map_err(|e| failed("Failed to open destination", e))?;

        let mut done = offset;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                let _ = file.flush().await;
                debug!(downloaded = done, "Download cancelled");
                return Err(TransferError::Cancelled);
            }

            let chunk = chunk.map_err(|e| failed("Error reading response chunk", e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| failed("Failed to write chunk", e))?;
            done += chunk.len() as u64;
            listener.on_progress(done, total);
        }

        file.flush()
            .await
            .map_err(|e| failed("Failed to flush destination", e))?;

        if request.expected_size > 0 && done != request.expected_size {
            return Err(TransferError::Failed(format!(
                "Transfer ended at {} of {} bytes",
                done, request.expected_size
            )));
        }

        info!(bytes = done, path = %request.destination.display(), "Download finished");
        Ok(())
    }
}
