//! Error taxonomy for backup and restore operations.
//!
//! Every component returns [`BackupError`]; the orchestrator passes errors
//! through unchanged so callers can branch on [`BackupError::kind`].

use std::fmt;
use thiserror::Error;

/// Result type alias for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Boxed error from a storage collaborator
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the backup/restore pipeline
#[derive(Error, Debug)]
pub enum BackupError {
    /// Reading rows from a source table failed
    #[error("Failed to read table '{table}': {source}")]
    StorageRead {
        table: String,
        #[source]
        source: BoxError,
    },

    /// Writing rows to the restore target failed
    #[error("Failed to write table '{table}': {source}")]
    StorageWrite {
        table: String,
        #[source]
        source: BoxError,
    },

    /// A record batch could not be encoded or decoded
    #[error("Malformed data in '{entry}': {message}")]
    Serialization { entry: String, message: String },

    /// The archive container failed structural validation
    #[error("Backup archive is corrupt: {message}")]
    ArchiveCorrupt { message: String },

    /// The backup was written by an unsupported format version
    #[error("Backup format version {found} is not supported (supported versions {min}-{max})")]
    MetadataVersionUnsupported { found: u32, min: u32, max: u32 },

    /// The backup belongs to a different account than the active one
    #[error("This backup was created by a different account")]
    MetadataAccountMismatch {
        backup_user_id: String,
        active_user_id: String,
    },

    /// Authentication of the encrypted payload failed
    #[error("Wrong password or corrupted backup")]
    WrongPasswordOrCorrupt { diagnostic: DecryptFailure },

    /// Another backup or restore holds the account lease
    #[error("A backup or restore is already running for account '{account}'")]
    OperationInProgress { account: String },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error (disk full, permission denied, ...)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Category of a [`BackupError`], for callers that only need to branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    StorageRead,
    StorageWrite,
    Serialization,
    ArchiveCorrupt,
    MetadataVersionUnsupported,
    MetadataAccountMismatch,
    WrongPasswordOrCorrupt,
    OperationInProgress,
    Cancelled,
    Io,
}

/// Internal reason behind a [`BackupError::WrongPasswordOrCorrupt`].
///
/// Only ever logged; the user-facing message is identical for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptFailure {
    /// The first chunk did not authenticate, usually a wrong password
    FirstChunkRejected,
    /// A later chunk did not authenticate
    ChunkRejected { index: u64 },
    /// The stream ended before the final chunk
    Truncated,
    /// Bytes follow the final chunk
    TrailingData,
    /// The envelope header or framing could not be parsed
    MalformedEnvelope,
    /// The envelope asks for key derivation costs beyond the accepted bounds
    UnsafeKdfParameters,
}

impl fmt::Display for DecryptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstChunkRejected => write!(f, "first chunk rejected"),
            Self::ChunkRejected { index } => write!(f, "chunk {} rejected", index),
            Self::Truncated => write!(f, "stream truncated"),
            Self::TrailingData => write!(f, "trailing data after final chunk"),
            Self::MalformedEnvelope => write!(f, "malformed envelope"),
            Self::UnsafeKdfParameters => write!(f, "unsafe kdf parameters"),
        }
    }
}

impl BackupError {
    /// Create a storage read error for `table`
    pub fn storage_read(table: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::StorageRead {
            table: table.into(),
            source: source.into(),
        }
    }

    /// Create a storage write error for `table`
    pub fn storage_write(table: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::StorageWrite {
            table: table.into(),
            source: source.into(),
        }
    }

    /// Create a serialization error for an archive entry
    pub fn serialization(entry: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Serialization {
            entry: entry.into(),
            message: message.to_string(),
        }
    }

    /// Create an archive corruption error
    pub fn archive_corrupt(message: impl Into<String>) -> Self {
        Self::ArchiveCorrupt {
            message: message.into(),
        }
    }

    /// Report settings the pipeline cannot run with as an invalid-input I/O error
    pub fn invalid_settings(err: strongbox_core::Error) -> Self {
        Self::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, err))
    }

    /// Create a decryption failure
    pub fn decrypt(diagnostic: DecryptFailure) -> Self {
        Self::WrongPasswordOrCorrupt { diagnostic }
    }

    /// The category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StorageRead { .. } => ErrorKind::StorageRead,
            Self::StorageWrite { .. } => ErrorKind::StorageWrite,
            Self::Serialization { .. } => ErrorKind::Serialization,
            Self::ArchiveCorrupt { .. } => ErrorKind::ArchiveCorrupt,
            Self::MetadataVersionUnsupported { .. } => ErrorKind::MetadataVersionUnsupported,
            Self::MetadataAccountMismatch { .. } => ErrorKind::MetadataAccountMismatch,
            Self::WrongPasswordOrCorrupt { .. } => ErrorKind::WrongPasswordOrCorrupt,
            Self::OperationInProgress { .. } => ErrorKind::OperationInProgress,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_password_message_hides_diagnostic() {
        let first = BackupError::decrypt(DecryptFailure::FirstChunkRejected);
        let later = BackupError::decrypt(DecryptFailure::ChunkRejected { index: 9 });
        assert_eq!(first.to_string(), later.to_string());
        assert!(!first.to_string().contains("chunk"));
        assert_eq!(first.kind(), ErrorKind::WrongPasswordOrCorrupt);
    }

    #[test]
    fn test_storage_read_keeps_source() {
        let err = BackupError::storage_read("folders", anyhow::anyhow!("disk on fire"));
        assert_eq!(err.kind(), ErrorKind::StorageRead);
        assert!(err.to_string().contains("folders"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("disk on fire"));
    }

    #[test]
    fn test_invalid_settings_is_io() {
        let err = BackupError::invalid_settings(strongbox_core::Error::invalid_config(
            "kdf.memory-kib must be at most 1048576, got 1048584",
        ));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("kdf.memory-kib"));
    }

    #[test]
    fn test_io_conversion() {
        let err: BackupError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_account_mismatch_message_hides_ids() {
        let err = BackupError::MetadataAccountMismatch {
            backup_user_id: "user-a".to_string(),
            active_user_id: "user-b".to_string(),
        };
        assert!(!err.to_string().contains("user-a"));
        assert_eq!(err.kind(), ErrorKind::MetadataAccountMismatch);
    }

    #[test]
    fn test_version_unsupported_message() {
        let err = BackupError::MetadataVersionUnsupported {
            found: 7,
            min: 1,
            max: 1,
        };
        assert!(err.to_string().contains("version 7"));
    }
}
