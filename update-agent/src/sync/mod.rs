//! Two-phase sync of manifest entries onto the install root.
//!
//! Every blob is downloaded before anything is installed, so a download
//! failure never leaves a half-updated tree. Blobs are content addressed
//! (`<sha1>.gz` under the staging directory) and only removed after every
//! install succeeded, so an interrupted run resumes where it stopped.

mod download;
mod install;
pub mod self_replace;

use crate::config::Config;
use crate::events::{StatusEvent, StatusSender};
use crate::manifest::ManifestEntry;
use crate::transfer::progress::{ProgressEstimator, StatusUpdate, SyncSession};
use crate::utils::Result;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Root that entry paths are relative to
    pub install_root: PathBuf,

    /// Staging directory for downloaded blobs
    pub temp_dir: PathBuf,

    /// The running executable, for self-replacement
    pub current_exe: Option<PathBuf>,

    pub transfer_timeout: Duration,
    pub max_attempts: u32,
    pub chunk_size: usize,
}

impl EngineSettings {
    pub fn new(install_root: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            temp_dir: temp_dir.into(),
            current_exe: None,
            transfer_timeout: Duration::from_secs(60),
            max_attempts: 3,
            chunk_size: 64 * 1024,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            install_root: config.install_dir().to_path_buf(),
            temp_dir: config.update_dir(),
            current_exe: config.self_exe(),
            transfer_timeout: config.transfer_timeout(),
            max_attempts: config.transfer.max_attempts,
            chunk_size: config.transfer.chunk_size,
        }
    }
}

/// What a successful run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub files_installed: usize,
    pub blobs_downloaded: usize,
    pub bytes_downloaded: u64,
    pub bytes_installed: u64,
    pub self_replaced: bool,
}

pub struct SyncEngine {
    client: Client,
    settings: EngineSettings,
    status: StatusSender,
    session: SyncSession,
    estimator: ProgressEstimator,
}

impl SyncEngine {
    pub fn new(client: Client, settings: EngineSettings, status: StatusSender) -> Self {
        Self {
            client,
            settings,
            status,
            session: SyncSession::default(),
            estimator: ProgressEstimator::new(Instant::now()),
        }
    }

    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Download then install every entry, then drop the staged blobs.
    pub async fn run(&mut self, entries: &[ManifestEntry]) -> Result<SyncReport> {
        tokio::fs::create_dir_all(&self.settings.temp_dir).await?;

        let entries: Vec<&ManifestEntry> = entries.iter().filter(|e| !e.is_deleted()).collect();
        let downloads = self.plan_downloads(&entries).await;

        let total_download: u64 = downloads.iter().map(|(_, remaining)| remaining).sum();
        let total_install: u64 = entries.iter().map(|e| e.size).sum();
        self.session = SyncSession::new(total_download, total_install);
        self.estimator = ProgressEstimator::new(Instant::now());

        info!("Calculated total download of {} bytes.", total_download);

        let mut report = SyncReport::default();

        for (entry, _) in &downloads {
            self.download_entry(entry).await?;
            report.blobs_downloaded += 1;
        }
        self.emit_download(true);
        report.bytes_downloaded = self.session.downloaded_bytes;

        info!("Extracting updates...");
        for entry in &entries {
            if self.install_entry(entry).await? {
                report.self_replaced = true;
            }
            report.files_installed += 1;
        }
        report.bytes_installed = self.session.installed_bytes;

        info!("Removing update files...");
        self.cleanup(&entries).await;

        self.emit_install(None, true);
        Ok(report)
    }

    fn blob_path(&self, entry: &ManifestEntry) -> PathBuf {
        self.settings.temp_dir.join(entry.blob_name())
    }

    /// Blobs still to fetch, one per content hash, with the bytes remaining.
    async fn plan_downloads<'a>(
        &self,
        entries: &[&'a ManifestEntry],
    ) -> Vec<(&'a ManifestEntry, u64)> {
        let mut seen = HashSet::new();
        let mut plan = Vec::new();

        for &entry in entries {
            if entry.is_any_version() && entry.target_path(&self.settings.install_root).is_file() {
                continue;
            }
            if !seen.insert(entry.blob_name()) {
                continue;
            }

            let staged = staged_len(&self.blob_path(entry)).await;
            let remaining = entry.size.saturating_sub(staged);
            if remaining == 0 {
                debug!("{} already staged", entry.blob_name());
                continue;
            }

            plan.push((entry, remaining));
        }

        plan
    }

    /// Remove every blob referenced by the batch.
    async fn cleanup(&self, entries: &[&ManifestEntry]) {
        let blobs: HashSet<PathBuf> = entries.iter().map(|e| self.blob_path(e)).collect();

        for blob in blobs {
            match tokio::fs::remove_file(&blob).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {}: {}", blob.display(), e),
            }
        }
    }

    fn publish(&self, update: StatusUpdate) {
        info!("{}", update.message);
        self.status.send(StatusEvent::Progress {
            percent: update.percent,
            message: update.message,
        });
    }

    fn emit_download(&mut self, force: bool) {
        if let Some(update) = self
            .estimator
            .download_status(Instant::now(), &self.session, force)
        {
            self.publish(update);
        }
    }

    fn emit_install(&mut self, current_file: Option<&str>, force: bool) {
        if let Some(update) =
            self.estimator
                .install_status(Instant::now(), &self.session, current_file, force)
        {
            self.publish(update);
        }
    }
}

/// Length of a staged blob, 0 if absent
async fn staged_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_manifest;
    use crate::test_support::{gzip, sample_content, sha1_hex, FixtureServer};
    use crate::utils::UpdateError;
    use std::fs;
    use tempfile::TempDir;

    fn engine(root: &TempDir) -> SyncEngine {
        let mut settings = EngineSettings::new(root.path(), root.path().join("patch"));
        settings.transfer_timeout = Duration::from_secs(5);
        SyncEngine::new(Client::new(), settings, StatusSender::new())
    }

    fn entries(server: &FixtureServer, manifest: &str) -> Vec<ManifestEntry> {
        parse_manifest(manifest, &server.manifest_url())
    }

    fn range_offset(range: &Option<String>) -> u64 {
        range
            .as_deref()
            .and_then(|r| r.strip_prefix("bytes="))
            .and_then(|r| r.strip_suffix('-'))
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_downloads_installs_and_cleans_up() {
        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        let content = sample_content(100);
        let hash = server.add_blob(&content);

        let batch = entries(&server, &format!("{} 100 data/file.bin\n", hash));
        let mut engine = engine(&root);
        let report = engine.run(&batch).await.unwrap();

        assert_eq!(fs::read(root.path().join("data/file.bin")).unwrap(), content);
        assert!(!root.path().join("patch").join(format!("{}.gz", hash)).exists());
        assert_eq!(report.files_installed, 1);
        assert_eq!(report.bytes_installed, 100);
        assert_eq!(engine.session().downloaded_bytes, server.blob_bytes(&hash).len() as u64);
        assert_eq!(server.blob_requests()[0].path, format!("game/{}.gz", hash));
    }

    #[tokio::test]
    async fn test_install_reports_current_file_then_ready() {
        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        let content = sample_content(300);
        let hash = server.add_blob(&content);

        let status = StatusSender::new();
        let mut rx = status.subscribe();
        let settings = EngineSettings::new(root.path(), root.path().join("patch"));
        let mut engine = SyncEngine::new(Client::new(), settings, status);

        let batch = entries(&server, &format!("{} 300 data/file.bin\n", hash));
        engine.run(&batch).await.unwrap();

        let mut messages = Vec::new();
        while let Ok(StatusEvent::Progress { percent, message }) = rx.try_recv() {
            messages.push((percent, message));
        }

        let extracting = format!("Extracting {}...", Path::new("data").join("file.bin").display());
        assert!(messages.iter().any(|(_, m)| *m == extracting), "{:?}", messages);
        assert_eq!(messages.last(), Some(&(100, "Ready!".to_string())));
    }

    #[tokio::test]
    async fn test_shared_content_is_downloaded_once() {
        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        let content = sample_content(4096);
        let hash = server.add_blob(&content);

        let batch = entries(
            &server,
            &format!("{h} 4096 a/copy1.txt\n{h} 4096 b/copy2.txt\n", h = hash),
        );
        let report = engine(&root).run(&batch).await.unwrap();

        assert_eq!(server.blob_requests().len(), 1);
        assert_eq!(report.blobs_downloaded, 1);
        assert_eq!(fs::read(root.path().join("a/copy1.txt")).unwrap(), content);
        assert_eq!(fs::read(root.path().join("b/copy2.txt")).unwrap(), content);
    }

    #[tokio::test]
    async fn test_resumes_partial_blob() {
        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        let content = sample_content(200_000);
        let hash = server.add_blob(&content);
        let gz = server.blob_bytes(&hash);

        // An earlier run was interrupted after 1000 bytes
        let patch = root.path().join("patch");
        fs::create_dir_all(&patch).unwrap();
        fs::write(patch.join(format!("{}.gz", hash)), &gz[..1000]).unwrap();

        let batch = entries(&server, &format!("{} {} big.txt\n", hash, content.len()));
        let mut engine = engine(&root);
        engine.run(&batch).await.unwrap();

        let requests = server.blob_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].range.as_deref(), Some("bytes=1000-"));
        assert_eq!(engine.session().downloaded_bytes, (gz.len() - 1000) as u64);
        assert_eq!(fs::read(root.path().join("big.txt")).unwrap(), content);
    }

    #[tokio::test]
    async fn test_retry_after_interrupted_transfer() {
        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        let content = sample_content(100_000);
        let hash = server.add_blob(&content);
        let gz_len = server.blob_bytes(&hash).len() as u64;
        server.fail_blob(&hash, 1, 500);

        let batch = entries(&server, &format!("{} {} data.txt\n", hash, content.len()));
        let mut engine = engine(&root);
        engine.run(&batch).await.unwrap();

        let requests = server.blob_requests();
        assert_eq!(requests.len(), 2);

        // Only the successful attempt is counted
        let resumed_from = range_offset(&requests[1].range);
        assert_eq!(engine.session().downloaded_bytes, gz_len - resumed_from);
        assert_eq!(fs::read(root.path().join("data.txt")).unwrap(), content);
    }

    #[tokio::test]
    async fn test_exhausted_retries_touch_nothing() {
        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        let good = sample_content(5_000);
        let bad = sample_content(9_000);
        let good_hash = server.add_blob(&good);
        let bad_hash = server.add_blob(&bad);
        server.fail_blob(&bad_hash, 3, 10);

        let batch = entries(
            &server,
            &format!("{} 5000 good.txt\n{} 9000 bad.txt\n", good_hash, bad_hash),
        );
        let mut engine = engine(&root);
        let err = engine.run(&batch).await.unwrap_err();

        assert!(matches!(err, UpdateError::TransferFailed { attempts: 3, .. }));
        assert_eq!(server.blob_requests().len(), 4);
        assert!(!root.path().join("good.txt").exists());
        assert!(!root.path().join("bad.txt").exists());
        // Fully fetched blob is kept for the next run
        assert!(root.path().join("patch").join(format!("{}.gz", good_hash)).exists());
        assert_eq!(
            engine.session().downloaded_bytes,
            server.blob_bytes(&good_hash).len() as u64
        );
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_discarded() {
        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        let content = sample_content(100);
        let hash = sha1_hex(&content);
        server.add_raw_blob(&hash, b"definitely not gzip".to_vec());
        fs::write(root.path().join("file.bin"), b"old").unwrap();

        let batch = entries(&server, &format!("{} 100 file.bin\n", hash));
        let err = engine(&root).run(&batch).await.unwrap_err();

        assert!(matches!(err, UpdateError::CorruptArchive { .. }));
        assert!(!root.path().join("patch").join(format!("{}.gz", hash)).exists());
        assert!(!root.path().join("file.bin.part").exists());
        assert_eq!(fs::read(root.path().join("file.bin")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_content_hash_mismatch_is_corrupt() {
        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        let expected = sample_content(300);
        let mut served = expected.clone();
        served[0] ^= 0xff;
        let hash = sha1_hex(&expected);
        server.add_raw_blob(&hash, gzip(&served));

        let batch = entries(&server, &format!("{} 300 file.bin\n", hash));
        let err = engine(&root).run(&batch).await.unwrap_err();

        assert!(matches!(err, UpdateError::CorruptArchive { .. }));
        assert!(!root.path().join("file.bin").exists());
    }

    #[tokio::test]
    async fn test_empty_file_needs_no_download() {
        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("empty.txt"), b"stale content").unwrap();

        let batch = entries(&server, &format!("{} 0 empty.txt\n", "b".repeat(40)));
        engine(&root).run(&batch).await.unwrap();

        assert!(server.blob_requests().is_empty());
        assert_eq!(fs::read(root.path().join("empty.txt")).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_fully_staged_blob_is_not_refetched() {
        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        let content = sample_content(50_000);
        let hash = server.add_blob(&content);

        let patch = root.path().join("patch");
        fs::create_dir_all(&patch).unwrap();
        fs::write(patch.join(format!("{}.gz", hash)), server.blob_bytes(&hash)).unwrap();

        let batch = entries(&server, &format!("{} 50000 data.txt\n", hash));
        engine(&root).run(&batch).await.unwrap();

        // The server answers 416 to a range starting at the end of the blob
        let requests = server.blob_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(fs::read(root.path().join("data.txt")).unwrap(), content);
    }

    #[tokio::test]
    async fn test_ignored_range_restarts_blob() {
        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        let content = sample_content(80_000);
        let hash = server.add_blob(&content);
        let gz = server.blob_bytes(&hash);
        server.ignore_ranges();

        let patch = root.path().join("patch");
        fs::create_dir_all(&patch).unwrap();
        fs::write(patch.join(format!("{}.gz", hash)), &gz[..300]).unwrap();

        let batch = entries(&server, &format!("{} 80000 data.txt\n", hash));
        engine(&root).run(&batch).await.unwrap();

        assert_eq!(fs::read(root.path().join("data.txt")).unwrap(), content);
    }

    #[tokio::test]
    async fn test_any_version_file_is_preserved() {
        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        let hash = server.add_blob(b"default settings");
        fs::write(root.path().join("settings.ini"), b"user settings").unwrap();

        let batch = entries(&server, &format!("{} 16 ?settings.ini\n", hash));
        engine(&root).run(&batch).await.unwrap();

        assert!(server.blob_requests().is_empty());
        assert_eq!(fs::read(root.path().join("settings.ini")).unwrap(), b"user settings");
    }

    #[tokio::test]
    async fn test_self_replacement() {
        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        let exe = root.path().join("bin").join("updater");
        fs::create_dir_all(exe.parent().unwrap()).unwrap();
        fs::write(&exe, b"old binary").unwrap();

        let new_binary = sample_content(2_000);
        let hash = server.add_blob(&new_binary);
        let batch = entries(&server, &format!("{} 2000 bin/updater\n", hash));

        let mut engine = engine(&root);
        engine.settings.current_exe = Some(exe.clone());
        let report = engine.run(&batch).await.unwrap();

        assert!(report.self_replaced);
        assert_eq!(fs::read(&exe).unwrap(), new_binary);
        let backup = self_replace::backup_path(&exe);
        assert_eq!(fs::read(&backup).unwrap(), b"old binary");

        // The next run removes the backup before doing anything else
        assert!(self_replace::remove_stale_backup(&exe).unwrap());
        assert!(!backup.exists());
    }

    #[tokio::test]
    async fn test_failed_self_replacement_restores_binary() {
        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        let exe = root.path().join("updater");
        fs::write(&exe, b"old binary").unwrap();

        let hash = sha1_hex(b"new binary");
        server.add_raw_blob(&hash, b"garbage".to_vec());
        let batch = entries(&server, &format!("{} 10 updater\n", hash));

        let mut engine = engine(&root);
        engine.settings.current_exe = Some(exe.clone());
        assert!(engine.run(&batch).await.is_err());

        assert_eq!(fs::read(&exe).unwrap(), b"old binary");
        assert!(!self_replace::backup_path(&exe).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replacement_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let server = FixtureServer::start().await;
        let root = TempDir::new().unwrap();
        let script = root.path().join("run.sh");
        fs::write(&script, b"#!/bin/sh\necho old\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let content = b"#!/bin/sh\necho new\n";
        let hash = server.add_blob(content);
        let batch = entries(&server, &format!("{} {} run.sh\n", hash, content.len()));
        engine(&root).run(&batch).await.unwrap();

        assert_eq!(fs::read(&script).unwrap(), content);
        let mode = fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
