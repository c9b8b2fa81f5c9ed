//! Restore system
//!
//! A restore runs in two passes over the decrypted archive. The first
//! decodes every batch without writing anything, so a malformed backup is
//! rejected while live data is untouched. The second streams the batches
//! into a [`StagingStore`] inside a [`RestoreTransaction`] that is only
//! committed once every table has been written and the row counts match
//! the archive index.

use crate::archive::{ArchiveIndex, ArchiveReader};
use crate::encryption::EncryptionHandler;
use crate::error::{BackupError, Result};
use crate::metadata::BackupFile;
use crate::progress::{ProgressReporter, RestoreStage};
use crate::scratch::{create_scratch_file, TempFileProvider};
use crate::security::SecureString;
use crate::serializer::SerializedBatch;
use crate::table::TableRegistry;
use crate::task::{
    ensure_not_cancelled, run_blocking, run_blocking_abandonable, CancelAwareReader,
};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strongbox_core::BackupSettings;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod analysis;
pub mod transaction;
pub mod validation;

pub use analysis::{analyze, BackupAnalysis};
pub use transaction::{RestoreTransaction, StagingStore, TableChange};
pub use validation::{validate_restore_preconditions, RestoreOptions};

/// Batches buffered between the archive reader and the table writers
const WRITE_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Clone)]
pub struct RestoreResult {
    /// Tables present in both the backup and the registry
    pub tables_restored: usize,

    /// Rows written to the staging store (zero for a dry run)
    pub rows_restored: u64,

    /// Rows decoded during verification
    pub rows_verified: u64,

    /// Tables in the backup that this build does not know about
    pub skipped_tables: Vec<String>,

    /// Registered tables absent from the backup
    pub missing_tables: Vec<String>,

    pub dry_run: bool,
    pub duration: Duration,
}

pub(crate) struct RestorePipeline<'a> {
    pub(crate) tables: &'a TableRegistry,
    pub(crate) staging: &'a Arc<dyn StagingStore>,
    pub(crate) settings: &'a BackupSettings,
    pub(crate) scratch: &'a dyn TempFileProvider,
    pub(crate) progress: &'a ProgressReporter,
    pub(crate) cancel: &'a CancellationToken,
}

impl RestorePipeline<'_> {
    pub(crate) async fn run(
        &self,
        backup_path: &Path,
        account_id: &str,
        password: SecureString,
        options: &RestoreOptions,
    ) -> Result<RestoreResult> {
        let started = Instant::now();
        info!(
            "Starting restore: backup={}, dry_run={}",
            backup_path.display(),
            options.dry_run
        );

        // Stage 1: Validation
        info!("Stage 1/5: Validating backup metadata");
        self.progress.stage(RestoreStage::ValidatingMetadata);
        let path = backup_path.to_path_buf();
        let account = account_id.to_string();
        let backup =
            run_blocking(move || validate_restore_preconditions(&path, &account)).await?;
        ensure_not_cancelled(self.cancel)?;

        // Stage 2: Decryption
        info!("Stage 2/5: Decrypting payload");
        self.progress.stage(RestoreStage::Decrypting);
        let inner = create_scratch_file(self.scratch, &self.settings.temp_file_retry, "restore")
            .await?;
        self.decrypt(backup, password, inner.path().to_path_buf())
            .await?;
        ensure_not_cancelled(self.cancel)?;

        // Stage 3: Unpacking
        info!("Stage 3/5: Unpacking archive");
        self.progress.stage(RestoreStage::Unpacking);
        let archive_path = inner.path().to_path_buf();
        let reader = Arc::new(run_blocking(move || ArchiveReader::open(&archive_path)).await?);
        let plan = RestorePlan::new(self.tables, reader.index());
        for table in &plan.skipped {
            warn!("Skipping unknown table '{}' in backup", table);
        }
        for table in &plan.missing {
            info!("Table '{}' is not in the backup", table);
        }
        ensure_not_cancelled(self.cancel)?;

        // Stage 4: Verification
        info!("Stage 4/5: Verifying records");
        self.progress.stage(RestoreStage::Deserializing);
        let rows_verified = self.verify(Arc::clone(&reader), &plan).await?;
        ensure_not_cancelled(self.cancel)?;

        let mut result = RestoreResult {
            tables_restored: plan.restore.len(),
            rows_restored: 0,
            rows_verified,
            skipped_tables: plan.skipped.clone(),
            missing_tables: plan.missing.clone(),
            dry_run: options.dry_run,
            duration: Duration::ZERO,
        };

        if options.dry_run {
            info!("Dry run: {} rows verified, nothing written", rows_verified);
            result.duration = started.elapsed();
            return Ok(result);
        }

        // Stage 5: Write and commit
        info!("Stage 5/5: Writing tables");
        self.progress.stage(RestoreStage::WritingTables);
        let mut transaction = RestoreTransaction::begin(Arc::clone(self.staging)).await?;
        if let Err(e) = self.write(reader, &plan, &mut transaction).await {
            warn!("Restore failed: {}", e);
            transaction.rollback().await;
            return Err(e);
        }
        result.rows_restored = transaction.rows_written();
        transaction.commit().await?;

        drop(inner);
        result.duration = started.elapsed();
        info!(
            "Restore complete: tables={}, rows={}, skipped={}, duration={:?}",
            result.tables_restored,
            result.rows_restored,
            result.skipped_tables.len(),
            result.duration
        );
        Ok(result)
    }

    async fn decrypt(
        &self,
        backup: BackupFile,
        password: SecureString,
        output: PathBuf,
    ) -> Result<()> {
        let reader_backup = backup.clone();
        let (sealed, payload) = run_blocking(move || {
            let mut payload = reader_backup.payload_reader()?;
            let sealed = EncryptionHandler::read_header(&mut payload)?;
            Ok((sealed, payload))
        })
        .await
        .map_err(log_decrypt_failure)?;

        let header = sealed.clone();
        let key = run_blocking_abandonable(self.cancel, move || {
            EncryptionHandler::derive_key(&password, &header)
        })
        .await?;
        ensure_not_cancelled(self.cancel)?;

        let cancel = self.cancel.clone();
        run_blocking(move || {
            let input = CancelAwareReader::new(payload, cancel);
            let out = BufWriter::new(File::create(&output)?);
            let plaintext = EncryptionHandler::decrypt(
                &key,
                &sealed,
                backup.metadata_json(),
                input,
                out,
            )?;
            debug!("Decrypted {} bytes", plaintext);
            Ok(())
        })
        .await
        .map_err(log_decrypt_failure)
    }

    /// Decode every batch of every restorable table, returning the row count
    async fn verify(&self, reader: Arc<ArchiveReader>, plan: &RestorePlan) -> Result<u64> {
        let tables = self.tables.clone();
        let wanted = plan.restore.clone();
        let expected = plan.expected.clone();
        let cancel = self.cancel.clone();

        run_blocking(move || {
            let mut decoded: BTreeMap<String, u64> = BTreeMap::new();
            reader.for_each_batch(|batch| {
                ensure_not_cancelled(&cancel)?;
                let Some(table) = tables.get(&batch.table).filter(|_| wanted.contains(&batch.table))
                else {
                    return Ok(());
                };
                let rows = table.verify_batch(&batch)?;
                *decoded.entry(batch.table).or_default() += rows as u64;
                Ok(())
            })?;

            for (table, rows) in &expected {
                let found = decoded.get(table).copied().unwrap_or_default();
                if found != *rows {
                    return Err(BackupError::archive_corrupt(format!(
                        "table '{}' decoded {} rows, index declares {}",
                        table, found, rows
                    )));
                }
            }
            Ok(decoded.values().sum())
        })
        .await
    }

    /// Stream batches from the archive into the staging store
    async fn write(
        &self,
        reader: Arc<ArchiveReader>,
        plan: &RestorePlan,
        transaction: &mut RestoreTransaction,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<SerializedBatch>(WRITE_QUEUE_DEPTH);
        let wanted = plan.restore.clone();
        let feeder = tokio::spawn(run_blocking(move || {
            reader.for_each_batch(|batch| {
                if !wanted.contains(&batch.table) {
                    return Ok(());
                }
                // The writer side has stopped and will report why
                tx.blocking_send(batch).map_err(|_| BackupError::Cancelled)
            })
        }));

        let written = self.write_batches(&mut rx, transaction).await;
        drop(rx);
        let fed = feeder
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?;
        written?;
        fed?;

        for (table, rows) in &plan.expected {
            let change = transaction
                .changes()
                .get(table)
                .copied()
                .unwrap_or_default();
            if change.rows != *rows {
                return Err(BackupError::archive_corrupt(format!(
                    "table '{}' restored {} rows, index declares {}",
                    table, change.rows, rows
                )));
            }
        }

        // Nothing destructive has happened yet
        ensure_not_cancelled(self.cancel)
    }

    async fn write_batches(
        &self,
        rx: &mut mpsc::Receiver<SerializedBatch>,
        transaction: &mut RestoreTransaction,
    ) -> Result<()> {
        while let Some(batch) = rx.recv().await {
            ensure_not_cancelled(self.cancel)?;
            let Some(table) = self.tables.get(&batch.table) else {
                continue;
            };
            let rows = table.import_batch(&batch).await?;
            transaction.record_batch(&batch.table, rows);
            self.progress.batch(&batch.table, batch.index, rows);
        }
        Ok(())
    }
}

/// Which archive tables get restored
struct RestorePlan {
    /// Tables both registered and present in the archive
    restore: HashSet<String>,

    /// Expected row counts for `restore`, from the index
    expected: BTreeMap<String, u64>,

    skipped: Vec<String>,
    missing: Vec<String>,
}

impl RestorePlan {
    fn new(tables: &TableRegistry, index: &ArchiveIndex) -> Self {
        let registered = tables.names();
        let mut plan = Self {
            restore: HashSet::new(),
            expected: BTreeMap::new(),
            skipped: Vec::new(),
            missing: Vec::new(),
        };

        for (name, stats) in &index.tables {
            if registered.contains(name.as_str()) {
                plan.restore.insert(name.clone());
                plan.expected.insert(name.clone(), stats.rows);
            } else {
                plan.skipped.push(name.clone());
            }
        }
        for table in tables.iter() {
            if !index.tables.contains_key(table.name()) {
                plan.missing.push(table.name().to_string());
            }
        }
        plan
    }
}

fn log_decrypt_failure(err: BackupError) -> BackupError {
    if let BackupError::WrongPasswordOrCorrupt { diagnostic } = &err {
        debug!("Payload rejected: {}", diagnostic);
    }
    err
}
