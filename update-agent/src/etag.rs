//! Persisted manifest ETag.
//!
//! The token is read once at startup, held in memory during a run and only
//! written back by [`EtagStore::commit`], which callers invoke after a run
//! succeeds. An empty or missing file means "first run".

use crate::utils::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug)]
pub struct EtagStore {
    path: PathBuf,
    saved: Option<String>,
    pending: Option<String>,
}

impl EtagStore {
    /// Read the stored token, if any
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let saved = match fs::read_to_string(&path) {
            Ok(content) => {
                let token = content.trim().to_string();
                (!token.is_empty()).then_some(token)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        debug!("Saved ETag: {:?}", saved);

        Ok(Self {
            pending: saved.clone(),
            saved,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Token to send as a precondition on the next manifest request
    pub fn current(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    pub fn is_first_run(&self) -> bool {
        self.pending.is_none()
    }

    /// Hold a freshly received token until the run commits.
    ///
    /// A response without an ETag keeps the previous token.
    pub fn stage(&mut self, etag: Option<String>) {
        if let Some(token) = etag.filter(|t| !t.is_empty()) {
            self.pending = Some(token);
        }
    }

    /// Forget the stored token so the next fetch is unconditional.
    pub fn reset(&mut self) -> Result<()> {
        info!("Resetting stored ETag");
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.saved = None;
        self.pending = None;
        Ok(())
    }

    /// Persist the staged token. Returns whether anything was written.
    pub fn commit(&mut self) -> Result<bool> {
        if self.pending == self.saved {
            info!("ETag has not changed, skipping save.");
            return Ok(false);
        }

        let Some(token) = self.pending.as_deref() else {
            return Ok(false);
        };

        info!("Saving ETag to {}", self.path.display());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, token)?;
        self.saved = self.pending.clone();
        Ok(true)
    }
}
