//! The orchestrator: one entry point for export, restore and inspection.

use crate::account::CurrentAccount;
use crate::error::{BackupError, Result};
use crate::export::{ExportPipeline, ExportResult};
use crate::lease::AccountLocks;
use crate::progress::{ExportStage, NoProgress, ProgressReporter, ProgressSink, RestoreStage};
use crate::restore::{
    analyze, BackupAnalysis, RestoreOptions, RestorePipeline, RestoreResult, StagingStore,
};
use crate::scratch::{ScratchDir, TempFileProvider};
use crate::security::SecureString;
use crate::table::TableRegistry;
use crate::task::{cancelled_or, run_blocking};
use std::path::Path;
use std::sync::Arc;
use strongbox_core::BackupSettings;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs backups and restores for a fixed set of tables.
///
/// At most one operation runs per account at a time; a second call for the
/// same account fails with [`BackupError::OperationInProgress`]. Managers
/// created with [`with_locks`](Self::with_locks) and the same
/// [`AccountLocks`] share that exclusion.
pub struct BackupManager {
    tables: TableRegistry,
    staging: Arc<dyn StagingStore>,
    scratch: Arc<dyn TempFileProvider>,
    settings: BackupSettings,
    progress: ProgressReporter,
    locks: AccountLocks,
}

impl BackupManager {
    pub fn new(
        tables: TableRegistry,
        staging: Arc<dyn StagingStore>,
        scratch: Arc<dyn TempFileProvider>,
        settings: BackupSettings,
    ) -> Self {
        Self {
            tables,
            staging,
            scratch,
            settings,
            progress: ProgressReporter::new(Arc::new(NoProgress)),
            locks: AccountLocks::new(),
        }
    }

    /// Manager using a [`ScratchDir`] at the configured scratch root.
    ///
    /// Fails if `settings` do not validate.
    pub fn with_scratch_root(
        tables: TableRegistry,
        staging: Arc<dyn StagingStore>,
        settings: BackupSettings,
    ) -> Result<Self> {
        settings.validate().map_err(BackupError::invalid_settings)?;
        let scratch = ScratchDir::new(settings.scratch_root())?;
        Ok(Self::new(tables, staging, Arc::new(scratch), settings))
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = ProgressReporter::new(sink);
        self
    }

    pub fn with_locks(mut self, locks: AccountLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    /// Back up every registered table into `destination_dir`.
    ///
    /// The backup file only appears at its final path once it is complete;
    /// on failure or cancellation nothing is left behind. Settings that do
    /// not validate fail the export with an invalid-input [`BackupError::Io`].
    pub async fn export(
        &self,
        account: &dyn CurrentAccount,
        password: SecureString,
        destination_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExportResult> {
        let _lease = self.locks.try_acquire(account.id())?;
        self.progress.stage(ExportStage::Idle);

        let pipeline = ExportPipeline {
            tables: &self.tables,
            settings: &self.settings,
            scratch: self.scratch.as_ref(),
            progress: &self.progress,
            cancel,
        };

        match pipeline.run(account, password, destination_dir).await {
            Ok(result) => {
                self.progress.stage(ExportStage::Done);
                info!(
                    "Backup created: {} ({} rows, {} bytes, sha256 {})",
                    result.path.display(),
                    result.rows,
                    result.size_bytes,
                    result.checksum
                );
                Ok(result)
            }
            Err(e) => {
                let e = cancelled_or(cancel, e);
                warn!("Backup failed: {}", e);
                self.progress.stage(ExportStage::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Restore `backup_path` into the staging store and commit it.
    ///
    /// The backup must belong to `account`. Live data is replaced only if
    /// every table restores cleanly. Cancel through `cancel`; dropping the
    /// future instead leaves the rollback to a background task.
    pub async fn restore(
        &self,
        backup_path: &Path,
        account: &dyn CurrentAccount,
        password: SecureString,
        options: RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreResult> {
        let _lease = self.locks.try_acquire(account.id())?;
        self.progress.stage(RestoreStage::Idle);

        let pipeline = RestorePipeline {
            tables: &self.tables,
            staging: &self.staging,
            settings: &self.settings,
            scratch: self.scratch.as_ref(),
            progress: &self.progress,
            cancel,
        };

        match pipeline
            .run(backup_path, account.id(), password, &options)
            .await
        {
            Ok(result) => {
                self.progress.stage(RestoreStage::Done);
                Ok(result)
            }
            Err(e) => {
                let e = cancelled_or(cancel, e);
                warn!("Restore failed: {}", e);
                self.progress.stage(RestoreStage::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Read a backup's plaintext metadata. No password or lease is needed.
    pub async fn inspect(&self, backup_path: &Path) -> Result<BackupAnalysis> {
        let path = backup_path.to_path_buf();
        run_blocking(move || analyze(&path)).await
    }

    /// Remove leftover scratch files, e.g. after a crash
    pub fn cleanup_scratch(&self) -> Result<usize> {
        self.scratch.cleanup().map_err(BackupError::Io)
    }
}
