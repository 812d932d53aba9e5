//! Install phase: verified gzip extraction with atomic replacement.

use super::{self_replace, SyncEngine};
use crate::manifest::ManifestEntry;
use crate::utils::{Result, UpdateError};
use async_compression::tokio::bufread::GzipDecoder;
use sha1::{Digest, Sha1};
use std::ffi::OsString;
use std::fs::Permissions;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

impl SyncEngine {
    /// Install one entry from its staged blob.
    ///
    /// Returns whether the running executable was replaced.
    pub(super) async fn install_entry(&mut self, entry: &ManifestEntry) -> Result<bool> {
        let target = entry.target_path(&self.settings.install_root);
        let shown = entry.path.display().to_string();

        self.emit_install(Some(&shown), true);
        info!("Installing {} from {}...", shown, entry.blob_name());

        if entry.is_any_version() && target.is_file() {
            info!("Skipping {} because it is any-version and exists...", shown);
            self.session.record_install(entry.size);
            return Ok(false);
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let moved_aside = match &self.settings.current_exe {
            Some(exe) if self_replace::is_running_executable(&target, exe) => {
                warn!("Detected update to self, trying to cope with it.");
                Some(self_replace::move_aside(&target)?)
            }
            _ => None,
        };

        let previous = moved_aside.as_deref().unwrap_or(target.as_path());
        let permissions = fs::metadata(previous).await.ok().map(|m| m.permissions());

        let result = if entry.size == 0 {
            File::create(&target).await.map(drop).map_err(UpdateError::from)
        } else {
            self.extract(entry, &target, permissions).await
        };

        if let Err(e) = result {
            if let Some(backup) = &moved_aside {
                if let Err(restore_err) = self_replace::restore(backup, &target) {
                    error!(
                        "Could not restore {} from {}: {}",
                        target.display(),
                        backup.display(),
                        restore_err
                    );
                }
            }
            return Err(e);
        }

        self.session.record_install(entry.size);
        self.emit_install(None, true);
        Ok(moved_aside.is_some())
    }

    /// Decompress into a sibling `.part` file, then rename it over `target`.
    async fn extract(
        &self,
        entry: &ManifestEntry,
        target: &Path,
        permissions: Option<Permissions>,
    ) -> Result<()> {
        let blob = self.blob_path(entry);
        let part = part_path(target);

        let written = self.decompress(entry, &blob, &part).await;
        let result = match written {
            Ok(()) => {
                if let Some(permissions) = permissions {
                    fs::set_permissions(&part, permissions).await?;
                }
                fs::rename(&part, target).await.map_err(UpdateError::from)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            remove_if_present(&part).await;
            if matches!(e, UpdateError::CorruptArchive { .. }) {
                // Force a clean re-download on the next run
                warn!("Discarding corrupt blob {}", blob.display());
                remove_if_present(&blob).await;
            }
        }

        result
    }

    /// Stream the gzip blob into `out`, checking size and content hash.
    async fn decompress(&self, entry: &ManifestEntry, blob: &Path, out: &Path) -> Result<()> {
        let corrupt = |reason: String| UpdateError::CorruptArchive {
            path: entry.path.clone(),
            reason,
        };

        let input = File::open(blob).await?;
        let mut decoder = GzipDecoder::new(BufReader::new(input));
        let mut output = File::create(out).await?;
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; self.settings.chunk_size.max(1)];
        let mut written = 0u64;

        loop {
            let n = decoder
                .read(&mut buf)
                .await
                .map_err(|e| corrupt(e.to_string()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            output.write_all(&buf[..n]).await?;
            written += n as u64;
        }

        output.flush().await?;
        output.sync_all().await?;
        drop(output);

        if written != entry.size {
            return Err(corrupt(format!(
                "expected {} bytes, got {}",
                entry.size, written
            )));
        }

        let digest = hex::encode(hasher.finalize());
        if !entry.hash_matches(&digest) {
            return Err(corrupt(format!(
                "content hash {} does not match {}",
                digest, entry.content_hash
            )));
        }

        Ok(())
    }
}

/// `<target>.part`
fn part_path(target: &Path) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

async fn remove_if_present(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", path.display(), e),
    }
}
