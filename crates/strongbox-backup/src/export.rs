//! Export pipeline.
//!
//! Tables are paged out concurrently (bounded by `max-concurrent-tables`)
//! and every serialized batch is streamed over a bounded channel to a
//! single blocking packer task that owns the archive writer. The finished
//! archive is encrypted into a scratch file, then wrapped with its metadata
//! in a temporary file next to the destination and renamed into place.

use crate::account::{backup_file_name, CurrentAccount};
use crate::archive::{ArchiveIndex, ArchiveWriter, TableStats};
use crate::compression::ChecksumWriter;
use crate::encryption::{EncryptionHandler, SealedHeader};
use crate::error::{BackupError, Result};
use crate::metadata::{write_backup_file, ArchiveMetadata};
use crate::progress::{ExportStage, ProgressReporter};
use crate::scratch::{create_scratch_file, TempFileProvider};
use crate::security::{DerivedKey, SecureString};
use crate::serializer::SerializedBatch;
use crate::table::{BackupTable, TableRegistry};
use crate::task::{
    ensure_not_cancelled, run_blocking, run_blocking_abandonable, CancelAwareReader,
};
use futures::stream::{self, TryStreamExt};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strongbox_core::BackupSettings;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of a successful export
#[derive(Debug, Clone)]
pub struct ExportResult {
    /// Final location of the backup file
    pub path: PathBuf,

    /// Size of the backup file in bytes
    pub size_bytes: u64,

    /// SHA256 of the backup file
    pub checksum: String,

    /// Rows and batches written per table
    pub tables: BTreeMap<String, TableStats>,

    /// Total rows exported
    pub rows: u64,

    pub duration: Duration,
}

/// Work items for the packer task
enum PackerMessage {
    Batch(SerializedBatch),
    Seal { table: String, rows: u64 },
}

pub(crate) struct ExportPipeline<'a> {
    pub(crate) tables: &'a TableRegistry,
    pub(crate) settings: &'a BackupSettings,
    pub(crate) scratch: &'a dyn TempFileProvider,
    pub(crate) progress: &'a ProgressReporter,
    pub(crate) cancel: &'a CancellationToken,
}

impl ExportPipeline<'_> {
    pub(crate) async fn run(
        &self,
        account: &dyn CurrentAccount,
        password: SecureString,
        destination_dir: &Path,
    ) -> Result<ExportResult> {
        let started = Instant::now();
        self.settings
            .validate()
            .map_err(BackupError::invalid_settings)?;
        check_destination(destination_dir)?;
        ensure_not_cancelled(self.cancel)?;

        self.progress.stage(ExportStage::ReadingTables);
        let counts = self.count_rows().await?;
        let total_rows: u64 = counts.iter().map(|(_, rows)| rows).sum();
        self.progress.total_rows(total_rows);
        info!(
            "Exporting {} rows from {} tables",
            total_rows,
            counts.len()
        );

        ensure_not_cancelled(self.cancel)?;
        self.progress.stage(ExportStage::Serializing);
        let archive = create_scratch_file(self.scratch, &self.settings.temp_file_retry, "archive")
            .await?;
        let index = self.pack_tables(counts, archive.path()).await?;

        ensure_not_cancelled(self.cancel)?;
        self.progress.stage(ExportStage::Encrypting);
        let metadata_json = ArchiveMetadata::new(account.id(), account.handle()).to_json()?;
        let sealed = EncryptionHandler::new(self.settings.kdf, self.settings.chunk_size)
            .new_header()?;
        let key = self.derive_key(password, sealed.clone()).await?;

        ensure_not_cancelled(self.cancel)?;
        let payload = create_scratch_file(self.scratch, &self.settings.temp_file_retry, "payload")
            .await?;
        self.encrypt(
            key,
            sealed,
            metadata_json.clone(),
            archive.path().to_path_buf(),
            payload.path().to_path_buf(),
        )
        .await?;
        drop(archive);

        ensure_not_cancelled(self.cancel)?;
        self.progress.stage(ExportStage::Finalizing);
        let destination = destination_dir.join(backup_file_name(
            account.handle(),
            &self.settings.file_extension,
        ));
        let (size_bytes, checksum) = self
            .finalize(metadata_json, payload.path().to_path_buf(), destination.clone())
            .await?;

        Ok(ExportResult {
            path: destination,
            size_bytes,
            checksum,
            rows: index.total_rows(),
            tables: index.tables,
            duration: started.elapsed(),
        })
    }

    async fn count_rows(&self) -> Result<Vec<(Arc<dyn BackupTable>, u64)>> {
        let mut counts = Vec::with_capacity(self.tables.len());
        for table in self.tables.iter() {
            let rows = table.count().await?;
            debug!("Table '{}' has {} rows", table.name(), rows);
            counts.push((Arc::clone(table), rows));
        }
        Ok(counts)
    }

    /// Stream every table into the archive at `path`
    async fn pack_tables(
        &self,
        tables: Vec<(Arc<dyn BackupTable>, u64)>,
        path: &Path,
    ) -> Result<ArchiveIndex> {
        let sink = BufWriter::new(File::create(path)?);
        let level = self.settings.effective_compression_level();
        let concurrency = self.settings.max_concurrent_tables.max(1);
        let (tx, rx) = mpsc::channel(concurrency * 2);

        let packer = tokio::spawn(run_blocking(move || run_packer(rx, sink, level)));

        let produced = stream::iter(tables.into_iter().map(Ok::<_, BackupError>))
            .try_for_each_concurrent(concurrency, |(table, rows)| {
                let tx = tx.clone();
                async move { self.export_table(table, rows, tx).await }
            })
            .await;
        drop(tx);

        self.progress.stage(ExportStage::Packing);
        let packed = packer
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?;

        produced?;
        packed
    }

    /// Page one table out in batches. Stops quietly if the packer has gone
    /// away; the packer's own error is reported instead.
    async fn export_table(
        &self,
        table: Arc<dyn BackupTable>,
        rows: u64,
        tx: mpsc::Sender<PackerMessage>,
    ) -> Result<()> {
        let batch_size = self.settings.batch_size;
        let mut start = 0u64;
        let mut index = 0u32;

        while start < rows {
            ensure_not_cancelled(self.cancel)?;
            // Never read past the counted rows; rows added mid-export wait for the next backup
            let wanted = (rows - start).min(batch_size as u64) as usize;
            let batch = table.export_batch(index, start, wanted).await?;
            if batch.record_count == 0 {
                return Err(BackupError::storage_read(
                    table.name(),
                    format!("no rows returned at offset {} of {}", start, rows),
                ));
            }

            start += batch.record_count as u64;
            let records = batch.record_count;
            if tx.send(PackerMessage::Batch(batch)).await.is_err() {
                return Ok(());
            }
            self.progress.batch(table.name(), index, records);
            index += 1;
        }

        let seal = PackerMessage::Seal {
            table: table.name().to_string(),
            rows,
        };
        if tx.send(seal).await.is_ok() {
            debug!("Table '{}' exported in {} batches", table.name(), index);
        }
        Ok(())
    }

    async fn derive_key(&self, password: SecureString, sealed: SealedHeader) -> Result<DerivedKey> {
        run_blocking_abandonable(self.cancel, move || {
            EncryptionHandler::derive_key(&password, &sealed)
        })
        .await
    }

    async fn encrypt(
        &self,
        key: DerivedKey,
        sealed: SealedHeader,
        metadata_json: Vec<u8>,
        archive: PathBuf,
        payload: PathBuf,
    ) -> Result<()> {
        let cancel = self.cancel.clone();
        run_blocking(move || {
            let input = CancelAwareReader::new(BufReader::new(File::open(&archive)?), cancel);
            let output = BufWriter::new(File::create(&payload)?);
            EncryptionHandler::encrypt(&key, &sealed, &metadata_json, input, output)?;
            Ok(())
        })
        .await
    }

    /// Write the backup file beside `destination`, then rename it into place.
    async fn finalize(
        &self,
        metadata_json: Vec<u8>,
        payload: PathBuf,
        destination: PathBuf,
    ) -> Result<(u64, String)> {
        let directory = destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let cancel = self.cancel.clone();

        let target = destination.clone();

        let (size, checksum) = run_blocking(move || {
            let payload_len = fs::metadata(&payload)?.len();
            let input =
                CancelAwareReader::new(BufReader::new(File::open(&payload)?), cancel.clone());
            let staged = tempfile::Builder::new()
                .prefix(".strongbox-")
                .suffix(".partial")
                .tempfile_in(&directory)?;

            let out = ChecksumWriter::new(BufWriter::new(staged));
            let out = write_backup_file(out, &metadata_json, input, payload_len)?;
            let size = out.bytes_written();
            let checksum = out.checksum();
            let staged = out
                .into_inner()?
                .into_inner()
                .map_err(|e| BackupError::Io(e.into_error()))?;
            staged.as_file().sync_all()?;

            // Last point at which cancelling leaves no trace
            ensure_not_cancelled(&cancel)?;
            staged.persist(&target).map_err(|e| BackupError::Io(e.error))?;
            sync_dir(&directory)?;
            Ok((size, checksum))
        })
        .await?;

        info!("Backup written to {}", destination.display());
        Ok((size, checksum))
    }
}

fn run_packer(
    mut rx: mpsc::Receiver<PackerMessage>,
    sink: BufWriter<File>,
    level: u32,
) -> Result<ArchiveIndex> {
    let mut writer = ArchiveWriter::new(sink, level);
    while let Some(message) = rx.blocking_recv() {
        match message {
            PackerMessage::Batch(batch) => writer.append_batch(&batch)?,
            PackerMessage::Seal { table, rows } => {
                writer.seal_table(&table, rows)?;
            }
        }
    }

    let (sink, index) = writer.finish()?;
    let file = sink.into_inner().map_err(|e| BackupError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(index)
}

/// Flush the rename itself to disk
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn check_destination(dir: &Path) -> Result<()> {
    let metadata = fs::metadata(dir)?;
    if !metadata.is_dir() {
        return Err(BackupError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a directory", dir.display()),
        )));
    }
    Ok(())
}
