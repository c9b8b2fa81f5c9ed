//! Inner archive: a gzip-compressed tar of serialized table batches.
//!
//! Batches are appended as they arrive, so nothing but the current batch
//! is held in memory. An `index.json` entry is written last; it lists every
//! table with its row and batch counts, and every batch entry with its
//! size and SHA256. [`ArchiveReader::open`] checks the archive against that
//! index before a single batch is handed out.

use crate::compression::{digest_reader, gzip_reader, gzip_writer, sha256_hex};
use crate::error::{BackupError, Result};
use crate::serializer::{batch_entry_name, parse_batch_entry_name, SerializedBatch};
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};

/// Name of the trailing index entry
pub const INDEX_ENTRY: &str = "index.json";

/// Version of the index layout
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Largest index entry accepted on read
const MAX_INDEX_BYTES: u64 = 64 * 1024 * 1024;

/// Row and batch totals for one table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub rows: u64,
    pub batches: u32,
}

/// One batch entry as recorded in the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub name: String,
    pub table: String,
    pub batch: u32,
    pub records: usize,
    pub size: u64,
    pub sha256: String,
}

/// Table of contents written at the end of the archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveIndex {
    pub format: u32,
    pub tables: BTreeMap<String, TableStats>,
    pub entries: Vec<EntryInfo>,
}

impl Default for ArchiveIndex {
    fn default() -> Self {
        Self {
            format: INDEX_FORMAT_VERSION,
            tables: BTreeMap::new(),
            entries: Vec::new(),
        }
    }
}

impl ArchiveIndex {
    pub fn total_rows(&self) -> u64 {
        self.tables.values().map(|t| t.rows).sum()
    }

    /// Check that entries and table totals agree with each other
    pub fn validate(&self) -> Result<()> {
        if self.format > INDEX_FORMAT_VERSION {
            return Err(BackupError::archive_corrupt(format!(
                "unsupported index format {}",
                self.format
            )));
        }

        let mut names = HashSet::new();
        let mut seen: HashMap<&str, TableStats> = HashMap::new();
        for entry in &self.entries {
            if entry.name != batch_entry_name(&entry.table, entry.batch) {
                return Err(BackupError::archive_corrupt(format!(
                    "entry '{}' does not match its table and batch",
                    entry.name
                )));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(BackupError::archive_corrupt(format!(
                    "duplicate entry '{}'",
                    entry.name
                )));
            }
            let stats = seen.entry(entry.table.as_str()).or_default();
            if entry.batch != stats.batches {
                return Err(BackupError::archive_corrupt(format!(
                    "table '{}' batches are not contiguous at {}",
                    entry.table, entry.name
                )));
            }
            stats.batches += 1;
            stats.rows += entry.records as u64;
        }

        for (table, stats) in &self.tables {
            let actual = seen.remove(table.as_str()).unwrap_or_default();
            if actual != *stats {
                return Err(BackupError::archive_corrupt(format!(
                    "table '{}' declares {} rows in {} batches, entries hold {} in {}",
                    table, stats.rows, stats.batches, actual.rows, actual.batches
                )));
            }
        }
        if let Some(table) = seen.keys().next() {
            return Err(BackupError::archive_corrupt(format!(
                "entries reference undeclared table '{}'",
                table
            )));
        }

        Ok(())
    }
}

/// Streams serialized batches into a compressed tar.
pub struct ArchiveWriter<W: Write> {
    builder: Builder<GzEncoder<W>>,
    index: ArchiveIndex,
    sealed: HashSet<String>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(writer: W, compression_level: u32) -> Self {
        Self {
            builder: Builder::new(gzip_writer(writer, compression_level)),
            index: ArchiveIndex::default(),
            sealed: HashSet::new(),
        }
    }

    /// Append the next batch of a table. Batches of one table must arrive in order.
    pub fn append_batch(&mut self, batch: &SerializedBatch) -> Result<()> {
        if self.sealed.contains(&batch.table) {
            return Err(BackupError::archive_corrupt(format!(
                "batch {} for table '{}' arrived after the table was sealed",
                batch.index, batch.table
            )));
        }
        let expected = self
            .index
            .tables
            .get(&batch.table)
            .map(|t| t.batches)
            .unwrap_or(0);
        if batch.index != expected {
            return Err(BackupError::archive_corrupt(format!(
                "table '{}' expected batch {} but got {}",
                batch.table, expected, batch.index
            )));
        }

        let name = batch.entry_name();
        append_entry(&mut self.builder, &name, &batch.payload)?;

        let stats = self.index.tables.entry(batch.table.clone()).or_default();
        stats.batches += 1;
        stats.rows += batch.record_count as u64;
        self.index.entries.push(EntryInfo {
            name,
            table: batch.table.clone(),
            batch: batch.index,
            records: batch.record_count,
            size: batch.payload.len() as u64,
            sha256: sha256_hex(&batch.payload),
        });
        Ok(())
    }

    /// Mark a table complete and check its row total against the source count.
    pub fn seal_table(&mut self, table: &str, expected_rows: u64) -> Result<TableStats> {
        let stats = *self.index.tables.entry(table.to_string()).or_default();
        if stats.rows != expected_rows {
            return Err(BackupError::storage_read(
                table,
                format!(
                    "table reported {} rows but {} were exported",
                    expected_rows, stats.rows
                ),
            ));
        }
        self.sealed.insert(table.to_string());
        Ok(stats)
    }

    /// Write the index, close the tar and gzip streams and return the sink.
    pub fn finish(mut self) -> Result<(W, ArchiveIndex)> {
        let index_json = serde_json::to_vec_pretty(&self.index)
            .map_err(|e| BackupError::serialization(INDEX_ENTRY, e))?;
        append_entry(&mut self.builder, INDEX_ENTRY, &index_json)?;

        let encoder = self.builder.into_inner()?;
        let writer = encoder.finish()?;
        Ok((writer, self.index))
    }
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o600);
    header.set_mtime(0);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

/// Reads an archive produced by [`ArchiveWriter`].
#[derive(Debug)]
pub struct ArchiveReader {
    path: PathBuf,
    index: ArchiveIndex,
    by_name: HashMap<String, usize>,
}

impl ArchiveReader {
    /// Open and fully validate an archive.
    ///
    /// Every entry is hashed and compared with the index; any mismatch,
    /// a missing index, or an undecodable stream is `ArchiveCorrupt`.
    pub fn open(path: &Path) -> Result<Self> {
        let mut archive = open_tar(path)?;
        let mut digests: HashMap<String, (u64, String)> = HashMap::new();
        let mut index: Option<ArchiveIndex> = None;

        for entry in archive.entries().map_err(corrupt)? {
            let mut entry = entry.map_err(corrupt)?;
            let name = entry_name(&entry)?;

            if index.is_some() {
                return Err(BackupError::archive_corrupt(format!(
                    "entry '{}' follows the index",
                    name
                )));
            }

            if name == INDEX_ENTRY {
                if entry.size() > MAX_INDEX_BYTES {
                    return Err(BackupError::archive_corrupt("archive index is too large"));
                }
                let mut raw = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut raw).map_err(corrupt)?;
                let parsed: ArchiveIndex = serde_json::from_slice(&raw).map_err(|e| {
                    BackupError::archive_corrupt(format!("unreadable archive index: {}", e))
                })?;
                index = Some(parsed);
            } else {
                let digest = digest_reader(&mut entry).map_err(corrupt)?;
                if digests.insert(name.clone(), digest).is_some() {
                    return Err(BackupError::archive_corrupt(format!(
                        "duplicate entry '{}'",
                        name
                    )));
                }
            }
        }

        let index = index.ok_or_else(|| BackupError::archive_corrupt("archive index missing"))?;
        index.validate()?;

        for info in &index.entries {
            match digests.remove(&info.name) {
                Some((size, sha256)) if size == info.size && sha256 == info.sha256 => {}
                Some(_) => {
                    return Err(BackupError::archive_corrupt(format!(
                        "entry '{}' does not match its checksum",
                        info.name
                    )))
                }
                None => {
                    return Err(BackupError::archive_corrupt(format!(
                        "entry '{}' is missing",
                        info.name
                    )))
                }
            }
        }
        for name in digests.keys() {
            if parse_batch_entry_name(name).is_some() {
                return Err(BackupError::archive_corrupt(format!(
                    "batch entry '{}' is not in the index",
                    name
                )));
            }
            tracing::debug!("Ignoring unrecognised archive entry '{}'", name);
        }

        let by_name = index
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            index,
            by_name,
        })
    }

    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    /// Stream every indexed batch, in archive order, to `f`.
    pub fn for_each_batch<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(SerializedBatch) -> Result<()>,
    {
        let mut archive = open_tar(&self.path)?;
        for entry in archive.entries().map_err(corrupt)? {
            let mut entry = entry.map_err(corrupt)?;
            let name = entry_name(&entry)?;
            let Some(info) = self.by_name.get(&name).map(|&i| &self.index.entries[i]) else {
                continue;
            };

            let mut payload = Vec::with_capacity(info.size as usize);
            entry.read_to_end(&mut payload).map_err(corrupt)?;
            f(SerializedBatch {
                table: info.table.clone(),
                index: info.batch,
                record_count: info.records,
                payload,
            })?;
        }
        Ok(())
    }
}

fn open_tar(path: &Path) -> Result<Archive<impl Read>> {
    let file = File::open(path)?;
    Ok(Archive::new(gzip_reader(BufReader::new(file))))
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let path = entry.path().map_err(corrupt)?;
    Ok(path.to_string_lossy().into_owned())
}

fn corrupt(err: std::io::Error) -> BackupError {
    BackupError::archive_corrupt(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::serializer::serialize_batch;
    use tempfile::TempDir;

    fn batch(table: &str, index: u32, ids: &[u32]) -> SerializedBatch {
        serialize_batch(table, index, ids).unwrap()
    }

    fn write_archive(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("inner.tar.gz");
        let mut writer = ArchiveWriter::new(File::create(&path).unwrap(), 6);
        writer.append_batch(&batch("folders", 0, &[1, 2])).unwrap();
        writer.append_batch(&batch("notes", 0, &[10])).unwrap();
        writer.append_batch(&batch("folders", 1, &[3])).unwrap();
        writer.seal_table("folders", 3).unwrap();
        writer.seal_table("notes", 1).unwrap();
        writer.seal_table("tags", 0).unwrap();
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = write_archive(&dir);

        let reader = ArchiveReader::open(&path).unwrap();
        let index = reader.index();
        assert_eq!(index.total_rows(), 4);
        assert_eq!(index.tables["folders"], TableStats { rows: 3, batches: 2 });
        assert_eq!(index.tables["tags"], TableStats { rows: 0, batches: 0 });

        let mut names = Vec::new();
        reader
            .for_each_batch(|b| {
                names.push(b.entry_name());
                Ok(())
            })
            .unwrap();
        assert_eq!(names, vec!["folders_0.json", "notes_0.json", "folders_1.json"]);
    }

    #[test]
    fn test_out_of_order_batch_rejected() {
        let mut writer = ArchiveWriter::new(Vec::new(), 1);
        let err = writer.append_batch(&batch("folders", 1, &[1])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveCorrupt);
    }

    #[test]
    fn test_seal_detects_row_mismatch() {
        let mut writer = ArchiveWriter::new(Vec::new(), 1);
        writer.append_batch(&batch("folders", 0, &[1, 2])).unwrap();
        let err = writer.seal_table("folders", 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageRead);
    }

    #[test]
    fn test_missing_index_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("no-index.tar.gz");
        let mut builder = Builder::new(gzip_writer(File::create(&path).unwrap(), 6));
        let payload = batch("folders", 0, &[1]).payload;
        append_entry(&mut builder, "folders_0.json", &payload).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = ArchiveReader::open(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveCorrupt);
        assert!(err.to_string().contains("index missing"));
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tampered.tar.gz");
        let good = batch("folders", 0, &[1]);
        let index = ArchiveIndex {
            format: INDEX_FORMAT_VERSION,
            tables: BTreeMap::from([(
                "folders".to_string(),
                TableStats { rows: 1, batches: 1 },
            )]),
            entries: vec![EntryInfo {
                name: "folders_0.json".to_string(),
                table: "folders".to_string(),
                batch: 0,
                records: 1,
                size: good.payload.len() as u64,
                sha256: sha256_hex(b"something else"),
            }],
        };

        let mut builder = Builder::new(gzip_writer(File::create(&path).unwrap(), 6));
        append_entry(&mut builder, "folders_0.json", &good.payload).unwrap();
        append_entry(
            &mut builder,
            INDEX_ENTRY,
            &serde_json::to_vec(&index).unwrap(),
        )
        .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = ArchiveReader::open(&path).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.tar.gz");
        std::fs::write(&path, b"definitely not gzip").unwrap();
        let err = ArchiveReader::open(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveCorrupt);
    }

    #[test]
    fn test_index_validate_rejects_gaps() {
        let mut index = ArchiveIndex::default();
        index
            .tables
            .insert("folders".to_string(), TableStats { rows: 1, batches: 1 });
        index.entries.push(EntryInfo {
            name: "folders_1.json".to_string(),
            table: "folders".to_string(),
            batch: 1,
            records: 1,
            size: 0,
            sha256: String::new(),
        });
        assert!(index.validate().is_err());
    }
}
