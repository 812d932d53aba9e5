//! Decides whether a local file already satisfies a manifest entry.

use crate::manifest::{EntryKind, ManifestEntry};
use sha1::{Digest, Sha1};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Default read buffer for hashing (64KB)
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Compute the lowercase hex SHA-1 of a file, streaming it in chunks.
///
/// # Arguments
/// * `path` - File to hash
/// * `chunk_size` - Read buffer size
///
/// # Returns
/// * `Ok(String)` - 40 lowercase hex characters
/// * `Err(io::Error)` - If the file cannot be opened or read
pub async fn sha1_file(path: &Path, chunk_size: usize) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; chunk_size.max(1)];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Validates manifest entries against files under an install root.
#[derive(Debug, Clone)]
pub struct Validator {
    root: PathBuf,
    chunk_size: usize,
}

impl Validator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Whether the local file satisfies `entry`.
    ///
    /// Missing or unreadable files are reported as invalid, never as errors.
    pub async fn is_valid(&self, entry: &ManifestEntry) -> bool {
        let path = entry.target_path(&self.root);

        match entry.kind {
            // Resolved at parse time; the only valid state is absence.
            EntryKind::Deleted => !path.exists(),
            EntryKind::AnyVersion => path.is_file(),
            EntryKind::Normal => {
                if !path.is_file() {
                    return false;
                }
                match sha1_file(&path, self.chunk_size).await {
                    Ok(digest) => entry.hash_matches(&digest),
                    Err(e) => {
                        debug!("Could not hash {}: {}", path.display(), e);
                        false
                    }
                }
            }
        }
    }
}
