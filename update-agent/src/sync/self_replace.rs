//! Replacing the executable that is currently running.
//!
//! Most platforms refuse to overwrite an executable that is in use but allow
//! renaming it. The running binary is moved to `<exe>.old` before the new
//! one is written, and the `.old` file is removed at the start of the next
//! run.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// `<exe>.old` next to the executable
pub fn backup_path(exe: &Path) -> PathBuf {
    let mut name = OsString::from(exe.as_os_str());
    name.push(".old");
    PathBuf::from(name)
}

/// Startup cleanup: delete a `.old` file left by a previous self-update.
pub fn remove_stale_backup(exe: &Path) -> io::Result<bool> {
    let backup = backup_path(exe);
    match fs::remove_file(&backup) {
        Ok(()) => {
            info!("Cleanup: Removing old {}", backup.display());
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether `target` resolves to the same file as the running executable.
pub fn is_running_executable(target: &Path, exe: &Path) -> bool {
    match (fs::canonicalize(target), fs::canonicalize(exe)) {
        (Ok(target), Ok(exe)) => target == exe,
        _ => false,
    }
}

/// Rename `target` to its `.old` path, replacing any stale backup.
pub fn move_aside(target: &Path) -> io::Result<PathBuf> {
    let backup = backup_path(target);

    match fs::remove_file(&backup) {
        Ok(()) => warn!("Removed stale {}", backup.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    fs::rename(target, &backup)?;
    Ok(backup)
}

/// Put a moved-aside executable back after a failed install.
pub fn restore(backup: &Path, target: &Path) -> io::Result<()> {
    fs::rename(backup, target)
}
