//! Download phase: resumable, retried fetch of content-addressed blobs.

use super::{staged_len, SyncEngine};
use crate::manifest::ManifestEntry;
use crate::utils::{Result, UpdateError};
use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use std::io;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{error, info, warn};

impl SyncEngine {
    /// Fetch the blob for `entry`, retrying up to `max_attempts` times.
    pub(super) async fn download_entry(&mut self, entry: &ManifestEntry) -> Result<()> {
        let blob = self.blob_path(entry);
        let max_attempts = self.settings.max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut counted = 0u64;

            info!("Downloading {}...", entry.source_url);

            match self.fetch_blob(entry, &blob, &mut counted).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // A failed attempt never inflates the displayed total
                    self.session.rollback_download(counted);
                    self.emit_download(true);

                    if attempt >= max_attempts {
                        error!("Download of {} failed: {}", entry.source_url, e);
                        return Err(UpdateError::TransferFailed {
                            url: entry.source_url.to_string(),
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }

                    warn!("File download failed, retrying... ({})", e);
                }
            }
        }
    }

    /// One attempt: append the rest of the blob to the staged file.
    ///
    /// `counted` holds the bytes this attempt added to the session, so the
    /// caller can roll them back on failure.
    async fn fetch_blob(
        &mut self,
        entry: &ManifestEntry,
        blob: &Path,
        counted: &mut u64,
    ) -> Result<()> {
        let limit = self.settings.transfer_timeout;
        let offset = staged_len(blob).await;

        let mut request = self.client.get(entry.source_url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = timeout(limit, request.send())
            .await
            .map_err(|_| timed_out("waiting for response"))??;

        if offset > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            info!("{} is already fully staged", entry.blob_name());
            return Ok(());
        }

        let response = response.error_for_status()?;
        let append = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
        if offset > 0 && !append {
            warn!(
                "Server ignored range request for {}, restarting blob",
                entry.source_url
            );
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(blob)
            .await?;

        let mut stream = response.bytes_stream();
        loop {
            let next = timeout(limit, stream.next())
                .await
                .map_err(|_| timed_out("reading response body"))?;

            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            file.write_all(&chunk).await?;
            *counted += chunk.len() as u64;
            self.session.record_download(chunk.len() as u64);
            self.emit_download(false);
        }

        file.flush().await?;
        Ok(())
    }
}

fn timed_out(during: &str) -> UpdateError {
    UpdateError::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("timed out {}", during),
    ))
}
