//! Conditional manifest retrieval.
//!
//! Turns the remote manifest into the list of entries that need syncing:
//! deleted entries are removed on the spot and entries that already validate
//! are dropped.

use super::{parse_manifest, ManifestEntry};
use crate::events::StatusSender;
use crate::fs::Validator;
use crate::utils::{Result, UpdateError};
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode, Url};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Result of asking the server for the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 304: the cached version is current
    Unchanged,

    /// 200: entries that still need syncing, and the response's ETag
    Updated {
        entries: Vec<ManifestEntry>,
        etag: Option<String>,
    },

    /// The manifest could not be fetched but a previous version exists
    Unavailable { reason: String },
}

impl FetchOutcome {
    /// Entries the sync engine has to process
    pub fn entries(&self) -> &[ManifestEntry] {
        match self {
            FetchOutcome::Updated { entries, .. } => entries,
            _ => &[],
        }
    }
}

/// Raw manifest body, or `None` for a 304.
type ManifestBody = Option<(String, Option<String>)>;

pub struct ManifestFetcher {
    client: Client,
    manifest_url: Url,
    install_root: PathBuf,
    validator: Validator,
    status: StatusSender,
    cached_timeout: Duration,
    first_run_timeout: Duration,
}

impl ManifestFetcher {
    pub fn new(
        client: Client,
        manifest_url: Url,
        install_root: impl Into<PathBuf>,
        status: StatusSender,
    ) -> Self {
        let install_root = install_root.into();
        Self {
            client,
            manifest_url,
            validator: Validator::new(install_root.clone()),
            install_root,
            status,
            cached_timeout: Duration::from_secs(5),
            first_run_timeout: Duration::from_secs(30),
        }
    }

    /// Override the request timeouts used with and without a cached ETag
    pub fn with_timeouts(mut self, cached: Duration, first_run: Duration) -> Self {
        self.cached_timeout = cached;
        self.first_run_timeout = first_run;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    /// Fetch the manifest, sending `prior_etag` as a precondition.
    ///
    /// Failing to fetch is only an error when there is no prior ETag to
    /// fall back on.
    pub async fn fetch(&self, prior_etag: Option<&str>) -> Result<FetchOutcome> {
        self.status.progress(0, "Checking for updates...");
        info!("Downloading manifest from {}", self.manifest_url);

        match self.download(prior_etag).await {
            Ok(None) => {
                self.status.progress(100, "Up to date.");
                Ok(FetchOutcome::Unchanged)
            }
            Ok(Some((text, etag))) => {
                self.status.progress(0, "Calculating update size...");
                let entries = self.resolve(&text).await;
                Ok(FetchOutcome::Updated { entries, etag })
            }
            Err(reason) => {
                warn!("Manifest request failed: {}", reason);
                self.status.progress(0, reason.clone());

                if prior_etag.is_some() {
                    // Stale but usable: let the user launch what they have.
                    self.status.progress(100, "Up to date.");
                    Ok(FetchOutcome::Unavailable { reason })
                } else {
                    Err(UpdateError::ManifestUnavailable(reason))
                }
            }
        }
    }

    async fn download(&self, prior_etag: Option<&str>) -> std::result::Result<ManifestBody, String> {
        let mut request = self
            .client
            .get(self.manifest_url.clone())
            .timeout(self.request_timeout(prior_etag));
        if let Some(etag) = prior_etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(format!("HTTP {}: {}", status, self.manifest_url));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        Ok(Some((text, etag)))
    }

    /// Short when a cached version can be fallen back on, long on first run
    fn request_timeout(&self, prior_etag: Option<&str>) -> Duration {
        match prior_etag {
            Some(_) => self.cached_timeout,
            None => self.first_run_timeout,
        }
    }

    /// Apply deletions and drop entries that already validate.
    async fn resolve(&self, text: &str) -> Vec<ManifestEntry> {
        let mut needs_sync = Vec::new();

        for entry in parse_manifest(text, &self.manifest_url) {
            if entry.is_deleted() {
                self.remove_deleted(&entry).await;
                continue;
            }

            if !self.validator.is_valid(&entry).await {
                info!("File failed validation: {}", entry.path.display());
                needs_sync.push(entry);
            }
        }

        needs_sync
    }

    async fn remove_deleted(&self, entry: &ManifestEntry) {
        let path = entry.target_path(&self.install_root);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("Removed deleted file {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
        }
    }
}
