//! Strongbox Backup System
//!
//! This crate exports an account's tables into a single password-protected
//! backup file and restores them again.
//!
//! # Pipeline
//!
//! ## Export
//! - **Batched reads**: tables are paged out through [`BatchTableReader`]s,
//!   several tables at a time
//! - **Self-describing batches**: each batch becomes a versioned JSON entry
//!   (`<table>_<batch>.json`); binary fields travel as base64
//! - **Streaming archive**: batches go straight into a tar+gzip archive with a
//!   checksummed index written last
//! - **Chunked AEAD**: the archive is encrypted with ChaCha20-Poly1305 under an
//!   Argon2id key, bound to the plaintext metadata
//! - **Atomic output**: the backup file appears at its final path only once
//!   it is complete
//!
//! ## Restore
//! - **Password-free checks**: format version and owning account are verified
//!   from the plaintext metadata before any key derivation
//! - **Verify, then write**: every batch is decoded before a single row is
//!   written, and rows land in a staging store that is committed as a whole
//! - **Forward compatible**: tables this build does not know are skipped
//!
//! # Examples
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use strongbox_backup::{AccountInfo, BackupManager, StagingStore, TableRegistry};
//! use strongbox_core::BackupSettings;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn backup(tables: TableRegistry, staging: Arc<dyn StagingStore>) -> anyhow::Result<()> {
//!     let manager = BackupManager::with_scratch_root(tables, staging, BackupSettings::default())?;
//!     let account = AccountInfo::new("user-42", "alice");
//!
//!     let result = manager
//!         .export(&account, "hunter2".into(), Path::new("/backups"), &CancellationToken::new())
//!         .await?;
//!
//!     println!("Backup created: {} ({} bytes)", result.path.display(), result.size_bytes);
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod archive;
pub mod compression;
pub mod encryption;
pub mod error;
pub mod export;
pub mod lease;
pub mod manager;
pub mod metadata;
pub mod progress;
pub mod restore;
pub mod scratch;
pub mod security;
pub mod serializer;
pub mod table;
mod task;

// Re-export commonly used types
pub use account::{backup_file_name, AccountInfo, CurrentAccount};
pub use archive::{ArchiveIndex, ArchiveReader, ArchiveWriter, TableStats};
pub use compression::calculate_checksum;
pub use encryption::EncryptionHandler;
pub use error::{BackupError, DecryptFailure, ErrorKind, Result};
pub use export::ExportResult;
pub use lease::{AccountLease, AccountLocks};
pub use manager::BackupManager;
pub use metadata::{ArchiveMetadata, BackupFile, FORMAT_VERSION, MIN_SUPPORTED_FORMAT_VERSION};
pub use progress::{
    ExportStage, NoProgress, ProgressSink, RestoreStage, Stage, TerminalProgress, TracingProgress,
};
pub use restore::{BackupAnalysis, RestoreOptions, RestoreResult, StagingStore};
pub use scratch::{ScratchDir, TempFileProvider};
pub use security::SecureString;
pub use serializer::{base64_bytes, SerializedBatch};
pub use table::{BackupTable, BatchTableReader, TableRegistry, TableSpec, TableWriter};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
