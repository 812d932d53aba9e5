//! A complete update run: cleanup, manifest check, sync, ETag commit, launch.
//!
//! Everything runs sequentially on the caller's task so file system state
//! changes are strictly ordered. The new ETag is only persisted once the run
//! has succeeded; any fatal error leaves it untouched so the next run checks
//! the same manifest version again.

use crate::config::Config;
use crate::etag::EtagStore;
use crate::events::{StatusEvent, StatusSender};
use crate::fs::Validator;
use crate::launcher::{Launcher, ProcessLauncher};
use crate::manifest::fetcher::{FetchOutcome, ManifestFetcher};
use crate::sync::{self_replace, EngineSettings, SyncEngine, SyncReport};
use crate::utils::Result;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, warn};

const USER_AGENT: &str = concat!("update-agent/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Forget the stored ETag and re-validate everything
    pub repair: bool,

    /// Start the configured executable after a successful run
    pub launch: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            repair: false,
            launch: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestState {
    Unchanged,
    Updated,
    Unavailable,
}

/// Summary of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub manifest: ManifestState,
    pub files_updated: usize,
    pub sync: Option<SyncReport>,
    pub etag_saved: bool,
    pub launched: bool,
    pub finished_at: DateTime<Utc>,
}

pub struct Updater {
    config: Config,
    client: Client,
    status: StatusSender,
    launcher: Box<dyn Launcher>,
}

impl Updater {
    pub fn new(config: Config, status: StatusSender) -> Result<Self> {
        config.validate()?;
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        let launcher = Box::new(ProcessLauncher::in_dir(config.install_dir()));

        Ok(Self {
            config,
            client,
            status,
            launcher,
        })
    }

    pub fn with_launcher(mut self, launcher: Box<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Run an update and send the terminal status event.
    pub async fn run(&self, options: RunOptions) -> Result<UpdateReport> {
        match self.execute(options).await {
            Ok(report) => {
                self.status.send(StatusEvent::Completed {
                    files_updated: report.files_updated,
                });
                Ok(report)
            }
            Err(e) => {
                error!("Update failed: {}", e);
                if e.is_fatal_before_install() {
                    info!("Installed files were not modified");
                }
                self.status.send(StatusEvent::Failed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn execute(&self, options: RunOptions) -> Result<UpdateReport> {
        if let Some(exe) = self.config.self_exe() {
            if let Err(e) = self_replace::remove_stale_backup(&exe) {
                warn!("Could not remove stale backup of {}: {}", exe.display(), e);
            }
        }

        let mut etags = EtagStore::open(self.config.etag_path())?;
        if options.repair {
            etags.reset()?;
        }

        let install_dir = self.config.install_dir();
        let validator =
            Validator::new(install_dir).with_chunk_size(self.config.transfer.chunk_size);
        let fetcher = ManifestFetcher::new(
            self.client.clone(),
            self.config.manifest_url()?,
            install_dir,
            self.status.clone(),
        )
        .with_timeouts(
            self.config.manifest_timeout(true),
            self.config.manifest_timeout(false),
        )
        .with_validator(validator);

        let outcome = fetcher.fetch(etags.current()).await?;
        let (manifest, entries) = match outcome {
            FetchOutcome::Unchanged => (ManifestState::Unchanged, Vec::new()),
            FetchOutcome::Unavailable { reason } => {
                warn!("Continuing with installed files: {}", reason);
                (ManifestState::Unavailable, Vec::new())
            }
            FetchOutcome::Updated { entries, etag } => {
                etags.stage(etag);
                (ManifestState::Updated, entries)
            }
        };

        let sync = if entries.is_empty() {
            info!("No files to download.");
            if manifest == ManifestState::Updated {
                self.status.progress(100, "Up to date.");
            }
            None
        } else {
            info!("{} files to download.", entries.len());
            let mut engine = SyncEngine::new(
                self.client.clone(),
                EngineSettings::from_config(&self.config),
                self.status.clone(),
            );
            let report = engine.run(&entries).await?;
            info!("Download successful.");
            Some(report)
        };

        let etag_saved = etags.commit()?;

        let launched = match self.config.executable_path() {
            Some(path) if options.launch => {
                self.launcher.start(&path)?;
                true
            }
            _ => false,
        };

        Ok(UpdateReport {
            manifest,
            files_updated: sync.as_ref().map_or(0, |s| s.files_installed),
            sync,
            etag_saved,
            launched,
            finished_at: Utc::now(),
        })
    }
}
