//! Scratch files for intermediate archives and decrypted payloads.
//!
//! Every scratch file is owned by a [`TempFileGuard`] and removed when the
//! guard drops, so success, failure and cancellation all leave the scratch
//! directory as they found it.

use crate::error::{BackupError, Result};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use strongbox_core::retry::{retry_with_policy_if, TransientIoPredicate};
use strongbox_core::RetryPolicy;
use uuid::Uuid;

/// Prefix of every file a [`ScratchDir`] creates
const SCRATCH_PREFIX: &str = "strongbox-";

/// Supplies scratch files to the pipeline
pub trait TempFileProvider: Send + Sync {
    /// Create a new, empty file for exclusive use by one operation
    fn create_temp_file(&self, label: &str) -> io::Result<PathBuf>;

    /// Remove leftover scratch files, returning how many were removed
    fn cleanup(&self) -> io::Result<usize>;
}

/// Default provider creating uniquely named files in one directory
#[derive(Debug, Clone)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    /// Use `root`, creating it if needed
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TempFileProvider for ScratchDir {
    fn create_temp_file(&self, label: &str) -> io::Result<PathBuf> {
        let path = self.root.join(format!(
            "{}{}-{}.tmp",
            SCRATCH_PREFIX,
            label,
            Uuid::new_v4().simple()
        ));
        OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(path)
    }

    fn cleanup(&self) -> io::Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let is_scratch = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(SCRATCH_PREFIX));
            if is_scratch && entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(
                "Removed {} stale scratch files from {}",
                removed,
                self.root.display()
            );
        }
        Ok(removed)
    }
}

/// Deletes its file when dropped
#[derive(Debug)]
pub struct TempFileGuard {
    path: PathBuf,
}

impl TempFileGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed scratch file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove scratch file {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Create a guarded scratch file, retrying transient filesystem errors
pub async fn create_scratch_file(
    provider: &dyn TempFileProvider,
    policy: &RetryPolicy,
    label: &str,
) -> Result<TempFileGuard> {
    let path = retry_with_policy_if(policy, &TransientIoPredicate, || async move {
        provider.create_temp_file(label)
    })
    .await
    .map_err(|e| BackupError::Io(e.into_source()))?;

    Ok(TempFileGuard::new(path))
}
