//! Manifest model and wire format.
//!
//! The manifest is UTF-8 text, one entry per line:
//!
//! ```text
//! <40 hex sha1> <decimal size> [-|?]<path>
//! ```
//!
//! `-` marks a path that must not exist, `?` a path whose presence alone
//! satisfies the entry. Lines that do not match are ignored, so the
//! manifest may carry comments and blank lines.

pub mod fetcher;

use reqwest::Url;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use tracing::warn;

static LINE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{40})\s+(\d+)\s+(?:([-?])\s*)?(.+)$").expect("valid manifest pattern")
});

/// How an entry is satisfied. Exactly one applies per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Content must match the hash
    Normal,
    /// Path must not exist
    Deleted,
    /// Presence is enough; content is never checked
    AnyVersion,
}

/// A single file in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// SHA-1 of the decompressed content, as written in the manifest
    pub content_hash: String,

    /// Decompressed size in bytes
    pub size: u64,

    /// Path relative to the install root, using local separators
    pub path: PathBuf,

    pub kind: EntryKind,

    /// Where the gzip blob for this content lives
    pub source_url: Url,
}

impl ManifestEntry {
    pub fn is_deleted(&self) -> bool {
        self.kind == EntryKind::Deleted
    }

    pub fn is_any_version(&self) -> bool {
        self.kind == EntryKind::AnyVersion
    }

    /// Case-insensitive comparison against a hex digest
    pub fn hash_matches(&self, digest_hex: &str) -> bool {
        self.content_hash.eq_ignore_ascii_case(digest_hex)
    }

    /// File name of the staged blob. Entries sharing content share a blob.
    pub fn blob_name(&self) -> String {
        format!("{}.gz", self.content_hash.to_ascii_lowercase())
    }

    /// Absolute target under `root`
    pub fn target_path(&self, root: &Path) -> PathBuf {
        root.join(&self.path)
    }
}

/// Blob URL for a content hash: the manifest's directory plus `<hash>.gz`.
pub fn source_url(manifest_url: &Url, content_hash: &str) -> Option<Url> {
    manifest_url.join(&format!("{}.gz", content_hash)).ok()
}

/// Translate a wire path (forward or back slashes) into a relative local path.
///
/// Returns `None` for paths that are empty or would leave the install root.
pub fn local_path(wire_path: &str) -> Option<PathBuf> {
    if has_drive_prefix(wire_path) {
        return None;
    }

    let mut path = PathBuf::new();

    for part in wire_path.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return None,
            _ => path.push(part),
        }
    }

    let relative = path
        .components()
        .all(|c| matches!(c, Component::Normal(_)));

    if path.as_os_str().is_empty() || !relative {
        None
    } else {
        Some(path)
    }
}

/// `C:` style drive letter at the start of a wire path
fn has_drive_prefix(wire_path: &str) -> bool {
    let bytes = wire_path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Parse a single manifest line
pub fn parse_line(line: &str, manifest_url: &Url) -> Option<ManifestEntry> {
    let caps = LINE_PATTERN.captures(line)?;

    let content_hash = caps[1].to_string();
    let wire_path = caps[4].trim_end();

    let size = match caps[2].parse::<u64>() {
        Ok(size) => size,
        Err(_) => {
            warn!("Skipping manifest line with unrepresentable size: {}", wire_path);
            return None;
        }
    };

    let kind = match caps.get(3).map(|m| m.as_str()) {
        Some("-") => EntryKind::Deleted,
        Some("?") => EntryKind::AnyVersion,
        _ => EntryKind::Normal,
    };

    let Some(path) = local_path(wire_path) else {
        warn!("Skipping manifest entry outside the install root: {}", wire_path);
        return None;
    };

    let source_url = source_url(manifest_url, &content_hash)?;

    Some(ManifestEntry {
        content_hash,
        size,
        path,
        kind,
        source_url,
    })
}

/// Parse a whole manifest, skipping lines that do not match.
pub fn parse_manifest(text: &str, manifest_url: &Url) -> Vec<ManifestEntry> {
    text.split(['\r', '\n'])
        .filter_map(|line| parse_line(line, manifest_url))
        .collect()
}
