//! Pre-flight validation for restore operations

use crate::error::{BackupError, Result};
use crate::metadata::BackupFile;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Decrypt, unpack and decode everything, but write nothing
    pub dry_run: bool,
}

impl RestoreOptions {
    pub fn dry_run() -> Self {
        Self { dry_run: true }
    }
}

/// Check that `backup_path` is a well-formed backup belonging to `account_id`.
///
/// Nothing here needs the password, so a backup from another account or an
/// unsupported version is rejected before any decryption is attempted.
pub fn validate_restore_preconditions(backup_path: &Path, account_id: &str) -> Result<BackupFile> {
    info!(
        "Validating restore preconditions for: {}",
        backup_path.display()
    );

    let metadata = fs::metadata(backup_path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => BackupError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Backup file not found: {}", backup_path.display()),
        )),
        _ => BackupError::Io(e),
    })?;
    if !metadata.is_file() {
        return Err(BackupError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Not a backup file: {}", backup_path.display()),
        )));
    }
    debug!("Backup file exists ({} bytes)", metadata.len());

    let backup = BackupFile::open(backup_path)?;
    debug!("Container structure validated");

    backup.metadata().validate(account_id)?;
    debug!(
        "Backup format {} belongs to the active account",
        backup.metadata().format_version
    );

    Ok(backup)
}
