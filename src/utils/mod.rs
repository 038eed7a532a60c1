pub mod readiness;
pub mod logger;
pub mod setup;

use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;

use tracing::debug;
use which::which;

use crate::connection::ScratchFile;
use crate::errors::{AppError, Result};

/// Finds `name` in PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|_| {
        AppError::Config(format!(
            "{} executable not found in PATH. Please ensure the required client tools are installed and in your PATH.",
            name
        ))
    })
}

/// Writes every planned scratch file, creating parent directories as needed.
/// Existing files are truncated and get their mode reset.
pub fn apply_scratch_files(files: &[ScratchFile]) -> Result<()> {
    for file in files {
        if let Some(parent) = file.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut handle = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(file.mode)
            .open(&file.path)?;
        handle.write_all(&file.contents)?;
        fs::set_permissions(&file.path, fs::Permissions::from_mode(file.mode))?;
        debug!(path = %file.path.display(), "wrote scratch file");
    }
    Ok(())
}
