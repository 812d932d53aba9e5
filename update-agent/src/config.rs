//! Configuration management for the update agent.
//!
//! Loads configuration from a TOML file with `UPDATER__*` environment
//! variable overrides (e.g. `UPDATER__MANIFEST__URL`).

use crate::utils::{Result, UpdateError};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "UPDATER";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Display name used in status messages
    #[serde(default = "default_name")]
    pub name: String,

    /// Root that manifest paths are relative to
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Staging directory for downloaded blobs (relative to `install_dir`)
    #[serde(default = "default_update_dir")]
    pub update_dir: PathBuf,

    /// Application started after a successful run (relative to `install_dir`)
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Path of the running updater binary, if not `std::env::current_exe()`
    #[serde(default)]
    pub self_exe: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Manifest URL; blobs are fetched from the same directory
    pub url: String,

    /// File holding the last fetched ETag (relative to `install_dir`)
    #[serde(default = "default_etag_file")]
    pub etag_file: PathBuf,

    /// Timeout when a cached ETag exists
    #[serde(default = "default_cached_timeout")]
    pub cached_timeout_secs: u64,

    /// Timeout on first run, when there is nothing to fall back to
    #[serde(default = "default_first_run_timeout")]
    pub first_run_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Per-request and per-chunk timeout for blob downloads
    #[serde(default = "default_transfer_timeout")]
    pub timeout_secs: u64,

    /// Attempts per blob before the run fails
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Buffer size for hashing and decompression (default: 64KB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_name() -> String {
    "application".to_string()
}

fn default_install_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_update_dir() -> PathBuf {
    PathBuf::from("patch")
}

fn default_etag_file() -> PathBuf {
    PathBuf::from("manifest.ver")
}

fn default_cached_timeout() -> u64 {
    5
}

fn default_first_run_timeout() -> u64 {
    30
}

fn default_transfer_timeout() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            install_dir: default_install_dir(),
            update_dir: default_update_dir(),
            executable: None,
            self_exe: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_transfer_timeout(),
            max_attempts: default_max_attempts(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a given manifest URL with every other value defaulted
    pub fn with_manifest_url(url: impl Into<String>) -> Self {
        Config {
            app: AppConfig::default(),
            manifest: ManifestConfig {
                url: url.into(),
                etag_file: default_etag_file(),
                cached_timeout_secs: default_cached_timeout(),
                first_run_timeout_secs: default_first_run_timeout(),
            },
            transfer: TransferConfig::default(),
            log: LogConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.manifest_url()?;
        if self.transfer.max_attempts == 0 {
            return Err(UpdateError::Config(
                "transfer.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.transfer.chunk_size == 0 {
            return Err(UpdateError::Config(
                "transfer.chunk_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn manifest_url(&self) -> Result<Url> {
        Url::parse(&self.manifest.url)
            .map_err(|e| UpdateError::InvalidUrl(format!("{}: {}", self.manifest.url, e)))
    }

    pub fn install_dir(&self) -> &Path {
        &self.app.install_dir
    }

    pub fn update_dir(&self) -> PathBuf {
        self.app.install_dir.join(&self.app.update_dir)
    }

    pub fn etag_path(&self) -> PathBuf {
        self.app.install_dir.join(&self.manifest.etag_file)
    }

    pub fn executable_path(&self) -> Option<PathBuf> {
        self.app
            .executable
            .as_ref()
            .map(|exe| self.app.install_dir.join(exe))
    }

    /// Path of the running updater binary
    pub fn self_exe(&self) -> Option<PathBuf> {
        match &self.app.self_exe {
            Some(path) => Some(path.clone()),
            None => std::env::current_exe().ok(),
        }
    }

    pub fn manifest_timeout(&self, has_cached_etag: bool) -> Duration {
        if has_cached_etag {
            Duration::from_secs(self.manifest.cached_timeout_secs)
        } else {
            Duration::from_secs(self.manifest.first_run_timeout_secs)
        }
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.timeout_secs)
    }
}
