//! Backup analysis

use crate::error::Result;
use crate::metadata::{ArchiveMetadata, BackupFile};
use std::fs;
use std::path::Path;
use tracing::info;

/// What can be learned about a backup without its password
#[derive(Debug, Clone)]
pub struct BackupAnalysis {
    pub metadata: ArchiveMetadata,

    /// Size of the backup file on disk
    pub file_size: u64,

    /// Size of the encrypted payload
    pub payload_size: u64,
}

impl BackupAnalysis {
    pub fn belongs_to(&self, account_id: &str) -> bool {
        self.metadata.user_id == account_id
    }
}

/// Read the plaintext side of a backup file
pub fn analyze(backup_path: &Path) -> Result<BackupAnalysis> {
    info!("Analyzing backup: {}", backup_path.display());

    let file_size = fs::metadata(backup_path)?.len();
    let backup = BackupFile::open(backup_path)?;

    Ok(BackupAnalysis {
        metadata: backup.metadata().clone(),
        file_size,
        payload_size: backup.payload_len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::write_backup_file;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_analyze_reads_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bob_backup.sbk");
        let metadata = ArchiveMetadata::new("u7", "bob");
        let payload = vec![0xAB; 1500];
        write_backup_file(
            File::create(&path).unwrap(),
            &metadata.to_json().unwrap(),
            &payload[..],
            payload.len() as u64,
        )
        .unwrap();

        let analysis = analyze(&path).unwrap();
        assert_eq!(analysis.metadata, metadata);
        assert_eq!(analysis.payload_size, 1500);
        assert!(analysis.file_size > 1500);
        assert!(analysis.belongs_to("u7"));
        assert!(!analysis.belongs_to("u8"));
    }
}
