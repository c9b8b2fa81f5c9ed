//! Backup file metadata and the outer container.
//!
//! A backup file is a plain (uncompressed) tar with exactly two entries:
//! `metadata.json` first, readable without the password, followed by the
//! encrypted `payload.sbp`. The metadata identifies the owning account and
//! the format version so both can be checked before any key derivation.

use crate::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};

/// Current backup format version
pub const FORMAT_VERSION: u32 = 1;

/// Oldest backup format version this build can restore
pub const MIN_SUPPORTED_FORMAT_VERSION: u32 = 1;

/// Name of the metadata entry
pub const METADATA_ENTRY: &str = "metadata.json";

/// Name of the encrypted payload entry
pub const PAYLOAD_ENTRY: &str = "payload.sbp";

const MAX_METADATA_BYTES: u64 = 1024 * 1024;
const BLOCK_SIZE: u64 = 512;

/// Unencrypted description of a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveMetadata {
    /// Backup format version
    pub format_version: u32,

    /// Account the backup belongs to
    pub user_id: String,

    /// Human-readable account handle
    pub user_handle: String,

    /// When the backup was created
    pub created_at: DateTime<Utc>,

    /// OS and architecture of the creating device
    pub platform: String,

    /// What created this backup (e.g., "strongbox v1.0.0")
    #[serde(default)]
    pub created_by: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionProbe {
    format_version: u32,
}

impl ArchiveMetadata {
    /// Metadata for a new backup of the given account
    pub fn new(user_id: impl Into<String>, user_handle: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            user_id: user_id.into(),
            user_handle: user_handle.into(),
            created_at: Utc::now(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            created_by: format!("strongbox v{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| BackupError::serialization(METADATA_ENTRY, e))
    }

    /// Parse metadata, checking the format version before anything else.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        let probe: VersionProbe = serde_json::from_slice(raw).map_err(|e| {
            BackupError::archive_corrupt(format!("unreadable backup metadata: {}", e))
        })?;
        check_format_version(probe.format_version)?;

        serde_json::from_slice(raw).map_err(|e| {
            BackupError::archive_corrupt(format!("unreadable backup metadata: {}", e))
        })
    }

    /// Check the format version, then that the backup belongs to `active_user_id`.
    pub fn validate(&self, active_user_id: &str) -> Result<()> {
        check_format_version(self.format_version)?;

        if self.user_id != active_user_id {
            return Err(BackupError::MetadataAccountMismatch {
                backup_user_id: self.user_id.clone(),
                active_user_id: active_user_id.to_string(),
            });
        }
        Ok(())
    }
}

/// Reject versions outside the supported range
pub fn check_format_version(version: u32) -> Result<()> {
    if (MIN_SUPPORTED_FORMAT_VERSION..=FORMAT_VERSION).contains(&version) {
        Ok(())
    } else {
        Err(BackupError::MetadataVersionUnsupported {
            found: version,
            min: MIN_SUPPORTED_FORMAT_VERSION,
            max: FORMAT_VERSION,
        })
    }
}

/// Write a backup file: `metadata_json` followed by `payload_len` bytes of payload.
///
/// `metadata_json` is stored byte for byte, since the payload
/// authenticates exactly these bytes.
pub fn write_backup_file<W: Write, R: Read>(
    out: W,
    metadata_json: &[u8],
    payload: R,
    payload_len: u64,
) -> Result<W> {
    let mut builder = Builder::new(out);

    let mut header = entry_header(metadata_json.len() as u64);
    builder.append_data(&mut header, METADATA_ENTRY, metadata_json)?;

    let mut header = entry_header(payload_len);
    builder.append_data(&mut header, PAYLOAD_ENTRY, payload)?;

    Ok(builder.into_inner()?)
}

fn entry_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o600);
    header.set_mtime(0);
    header
}

/// An opened backup file whose container layout has been checked
#[derive(Debug, Clone)]
pub struct BackupFile {
    path: PathBuf,
    metadata: ArchiveMetadata,
    metadata_json: Vec<u8>,
    payload_offset: u64,
    payload_len: u64,
}

impl BackupFile {
    /// Open a backup file and check its structure.
    ///
    /// Fails with `MetadataVersionUnsupported` as soon as the metadata names
    /// an unknown version, and with `ArchiveCorrupt` for anything else
    /// structurally wrong: wrong entries, extra entries, or a truncated file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut archive = Archive::new(file);

        let (metadata, metadata_json, payload_offset, payload_len) = {
            let mut entries = archive.entries_with_seek().map_err(corrupt)?;

            let mut first = next_entry(&mut entries, METADATA_ENTRY)?;
            if first.size() > MAX_METADATA_BYTES {
                return Err(BackupError::archive_corrupt("backup metadata is too large"));
            }
            let mut metadata_json = Vec::with_capacity(first.size() as usize);
            first.read_to_end(&mut metadata_json).map_err(corrupt)?;
            drop(first);

            // Version problems take precedence over layout problems
            let metadata = ArchiveMetadata::from_json(&metadata_json)?;

            let second = next_entry(&mut entries, PAYLOAD_ENTRY)?;
            let offset = second.raw_file_position();
            let len = second.size();
            drop(second);

            if let Some(extra) = entries.next() {
                let name = extra
                    .map_err(corrupt)
                    .and_then(|e| entry_name(&e))
                    .unwrap_or_else(|_| "<unreadable>".to_string());
                return Err(BackupError::archive_corrupt(format!(
                    "unexpected entry '{}' after payload",
                    name
                )));
            }
            (metadata, metadata_json, offset, len)
        };

        check_end_of_archive(path, file_len, payload_offset, payload_len)?;

        Ok(Self {
            path: path.to_path_buf(),
            metadata,
            metadata_json,
            payload_offset,
            payload_len,
        })
    }

    pub fn metadata(&self) -> &ArchiveMetadata {
        &self.metadata
    }

    /// Metadata exactly as stored in the file
    pub fn metadata_json(&self) -> &[u8] {
        &self.metadata_json
    }

    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// A reader positioned at the start of the encrypted payload
    pub fn payload_reader(&self) -> Result<io::Take<BufReader<File>>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.payload_offset))?;
        Ok(BufReader::new(file).take(self.payload_len))
    }
}

fn next_entry<'a, R: Read + Seek>(
    entries: &mut tar::Entries<'a, R>,
    expected: &str,
) -> Result<tar::Entry<'a, R>> {
    let entry = entries
        .next()
        .ok_or_else(|| BackupError::archive_corrupt(format!("missing '{}' entry", expected)))?
        .map_err(corrupt)?;

    let name = entry_name(&entry)?;
    if name != expected {
        return Err(BackupError::archive_corrupt(format!(
            "expected '{}' entry, found '{}'",
            expected, name
        )));
    }
    Ok(entry)
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let path = entry.path().map_err(corrupt)?;
    Ok(path.to_string_lossy().into_owned())
}

/// The payload must be followed by its block padding and two zero blocks.
fn check_end_of_archive(path: &Path, file_len: u64, offset: u64, len: u64) -> Result<()> {
    let data_end = offset + len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    let marker_end = data_end + 2 * BLOCK_SIZE;
    if file_len < marker_end {
        return Err(BackupError::archive_corrupt("backup file is truncated"));
    }

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(data_end))?;
    let mut marker = [0u8; 2 * BLOCK_SIZE as usize];
    file.read_exact(&mut marker)?;
    if marker.iter().any(|&b| b != 0) {
        return Err(BackupError::archive_corrupt("end-of-archive marker missing"));
    }
    Ok(())
}

fn corrupt(err: io::Error) -> BackupError {
    BackupError::archive_corrupt(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn sample_metadata() -> ArchiveMetadata {
        ArchiveMetadata::new("user-1", "alice")
    }

    fn write_sample(dir: &TempDir, metadata_json: &[u8], payload: &[u8]) -> PathBuf {
        let path = dir.path().join("sample.sbk");
        write_backup_file(
            File::create(&path).unwrap(),
            metadata_json,
            payload,
            payload.len() as u64,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_metadata_creation() {
        let metadata = sample_metadata();
        assert_eq!(metadata.format_version, FORMAT_VERSION);
        assert!(metadata.created_by.starts_with("strongbox v"));
        assert!(metadata.platform.contains(std::env::consts::OS));
    }

    #[test]
    fn test_metadata_json_is_camel_case() {
        let json = String::from_utf8(sample_metadata().to_json().unwrap()).unwrap();
        assert!(json.contains("\"formatVersion\": 1"));
        assert!(json.contains("\"userHandle\": \"alice\""));
    }

    #[test]
    fn test_validate_checks_version_before_account() {
        let mut metadata = sample_metadata();
        metadata.format_version = FORMAT_VERSION + 1;
        let err = metadata.validate("someone-else").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataVersionUnsupported);

        metadata.format_version = FORMAT_VERSION;
        let err = metadata.validate("someone-else").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataAccountMismatch);

        assert!(metadata.validate("user-1").is_ok());
    }

    #[test]
    fn test_version_zero_is_unsupported() {
        assert!(check_format_version(0).is_err());
        assert!(check_format_version(FORMAT_VERSION).is_ok());
    }

    #[test]
    fn test_open_reads_metadata_and_payload() {
        let dir = TempDir::new().unwrap();
        let metadata = sample_metadata();
        let json = metadata.to_json().unwrap();
        let payload = vec![0xAB; 1500];
        let path = write_sample(&dir, &json, &payload);

        let backup = BackupFile::open(&path).unwrap();
        assert_eq!(backup.metadata(), &metadata);
        assert_eq!(backup.metadata_json(), json.as_slice());
        assert_eq!(backup.payload_len(), 1500);

        let mut read_back = Vec::new();
        backup.payload_reader().unwrap().read_to_end(&mut read_back).unwrap();
        assert_eq!(read_back, payload);
    }

    #[test]
    fn test_future_version_reported_before_layout() {
        let dir = TempDir::new().unwrap();
        let json = br#"{"formatVersion": 99, "somethingNew": true}"#;
        let path = write_sample(&dir, json, b"payload");

        let err = BackupFile::open(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataVersionUnsupported);
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let json = sample_metadata().to_json().unwrap();
        let path = write_sample(&dir, &json, &[1u8; 4096]);

        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 700).unwrap();

        let err = BackupFile::open(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveCorrupt);
    }

    #[test]
    fn test_extra_entry_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("extra.sbk");
        let json = sample_metadata().to_json().unwrap();

        let mut builder = Builder::new(File::create(&path).unwrap());
        for (name, data) in [
            (METADATA_ENTRY, json.as_slice()),
            (PAYLOAD_ENTRY, b"payload".as_slice()),
            ("extra.bin", b"x".as_slice()),
        ] {
            let mut header = entry_header(data.len() as u64);
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder.into_inner().unwrap();

        let err = BackupFile::open(&path).unwrap_err();
        assert!(err.to_string().contains("extra.bin"));
    }

    #[test]
    fn test_not_a_backup_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"just some text").unwrap();

        let err = BackupFile::open(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveCorrupt);
    }
}
