//! Starting the application once it is up to date.

use crate::utils::{Result, UpdateError};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::info;

pub trait Launcher: Send + Sync {
    fn start(&self, path: &Path) -> Result<()>;
}

/// Spawns the application as a detached child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    working_dir: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_dir(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(working_dir.into()),
        }
    }
}

impl Launcher for ProcessLauncher {
    fn start(&self, path: &Path) -> Result<()> {
        info!("Path to executable: {}", path.display());

        let mut command = Command::new(path);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        command
            .spawn()
            .map(drop)
            .map_err(|e| UpdateError::Launch(format!("{}: {}", path.display(), e)))
    }
}
