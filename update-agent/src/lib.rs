//! Update Agent Library
//!
//! Manifest-driven self-updater: checks a remote manifest, downloads the
//! gzip blobs of changed files, installs them atomically and launches the
//! application.

pub mod bootstrap;
pub mod config;
pub mod etag;
pub mod events;
pub mod fs;
pub mod launcher;
pub mod manifest;
pub mod sync;
pub mod transfer;
pub mod utils;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use crate::config::Config;
pub use utils::errors::{Result, UpdateError};
