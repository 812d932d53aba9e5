//! Error taxonomy for the update agent.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The manifest could not be fetched and no previously fetched version exists.
    #[error("Manifest unavailable: {0}")]
    ManifestUnavailable(String),

    /// A download exhausted its retry budget.
    #[error("Download of {url} failed after {attempts} attempts: {reason}")]
    TransferFailed {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// A staged blob did not decompress to the expected content.
    #[error("Corrupt archive for {}: {reason}", path.display())]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("Launch error: {0}")]
    Launch(String),
}

impl From<::config::ConfigError> for UpdateError {
    fn from(e: ::config::ConfigError) -> Self {
        UpdateError::Config(e.to_string())
    }
}

impl From<toml::de::Error> for UpdateError {
    fn from(e: toml::de::Error) -> Self {
        UpdateError::Config(e.to_string())
    }
}

impl UpdateError {
    /// Errors that abort a run without touching installed files.
    pub fn is_fatal_before_install(&self) -> bool {
        matches!(
            self,
            UpdateError::ManifestUnavailable(_) | UpdateError::TransferFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
