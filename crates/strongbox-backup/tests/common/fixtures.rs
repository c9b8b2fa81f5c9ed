//! Record types, seeded databases and the manager harness

use super::mocks::{MemoryStaging, MemoryTable, Staged};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strongbox_backup::{
    base64_bytes, AccountInfo, AccountLocks, BackupManager, ExportResult, ProgressSink,
    RestoreOptions, RestoreResult, Result, ScratchDir, SecureString, TableRegistry, TableSpec,
};
use strongbox_core::{BackupSettings, KdfSettings};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const PASSWORD: &str = "correct horse battery staple";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub folder_id: i64,
    pub title: String,
    pub body: String,
    #[serde(with = "base64_bytes")]
    pub content_hash: Vec<u8>,
    pub pinned: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub label: String,
}

pub fn folders(n: i64) -> Vec<Folder> {
    (0..n)
        .map(|id| Folder {
            id,
            name: format!("Folder {}", id),
            parent_id: if id == 0 { None } else { Some(0) },
        })
        .collect()
}

pub fn notes(n: i64) -> Vec<Note> {
    (0..n)
        .map(|id| Note {
            id,
            folder_id: id % 3,
            title: format!("Note {} ✓", id),
            body: "line one\nline \"two\"\t\u{0}end".repeat(id as usize % 4 + 1),
            content_hash: (0..32).map(|b| (b as u8).wrapping_mul(id as u8 | 1)).collect(),
            pinned: id % 2 == 0,
        })
        .collect()
}

pub fn tags(n: i64) -> Vec<Tag> {
    (0..n)
        .map(|id| Tag {
            id,
            label: format!("tag-{}", id),
        })
        .collect()
}

/// One account's tables plus the staging store over them
pub struct MemoryDatabase {
    pub folders: Arc<MemoryTable<Folder>>,
    pub notes: Arc<MemoryTable<Note>>,
    pub tags: Option<Arc<MemoryTable<Tag>>>,
    pub staging: Arc<MemoryStaging>,
}

impl MemoryDatabase {
    pub fn new(folders: Vec<Folder>, notes: Vec<Note>) -> Self {
        Self::build(folders, notes, None)
    }

    /// A database with an extra `tags` table
    pub fn with_tags(folders: Vec<Folder>, notes: Vec<Note>, tags: Vec<Tag>) -> Self {
        Self::build(folders, notes, Some(tags))
    }

    fn build(folders: Vec<Folder>, notes: Vec<Note>, tags: Option<Vec<Tag>>) -> Self {
        let folders = MemoryTable::new(folders);
        let notes = MemoryTable::new(notes);
        let tags = tags.map(MemoryTable::new);

        let mut staged: Vec<Arc<dyn Staged>> = Vec::new();
        staged.push(folders.clone());
        staged.push(notes.clone());
        if let Some(tags) = &tags {
            staged.push(tags.clone());
        }

        Self {
            folders,
            notes,
            tags,
            staging: Arc::new(MemoryStaging::new(staged)),
        }
    }

    pub fn registry(&self) -> TableRegistry {
        let mut registry = TableRegistry::new();
        registry
            .register(TableSpec::<Folder>::new(
                "folders",
                self.folders.clone(),
                self.folders.clone(),
            ))
            .unwrap()
            .register(TableSpec::<Note>::new(
                "notes",
                self.notes.clone(),
                self.notes.clone(),
            ))
            .unwrap();
        if let Some(tags) = &self.tags {
            registry
                .register(TableSpec::<Tag>::new("tags", tags.clone(), tags.clone()))
                .unwrap();
        }
        registry
    }
}

pub fn test_settings(scratch: &Path) -> BackupSettings {
    BackupSettings {
        batch_size: 2,
        chunk_size: 256,
        scratch_dir: Some(scratch.to_path_buf()),
        kdf: KdfSettings::insecure_fast(),
        ..BackupSettings::default()
    }
}

/// A manager over a database, with its own output and scratch directories
pub struct Harness {
    pub db: MemoryDatabase,
    pub manager: BackupManager,
    pub account: AccountInfo,
    pub out_dir: TempDir,
    pub scratch_dir: TempDir,
}

impl Harness {
    pub fn new(db: MemoryDatabase) -> Self {
        Self::with_account(db, AccountInfo::new("user-1", "alice"))
    }

    pub fn with_account(db: MemoryDatabase, account: AccountInfo) -> Self {
        let out_dir = TempDir::new().unwrap();
        let scratch_dir = TempDir::new().unwrap();
        let manager = manager_for(&db, scratch_dir.path());
        Self {
            db,
            manager,
            account,
            out_dir,
            scratch_dir,
        }
    }

    /// A harness whose manager runs with edited settings
    pub fn with_settings(db: MemoryDatabase, edit: impl FnOnce(&mut BackupSettings)) -> Self {
        let mut harness = Self::new(db);
        let mut settings = test_settings(harness.scratch_dir.path());
        edit(&mut settings);
        harness.manager = manager_with(&harness.db, harness.scratch_dir.path(), settings);
        harness
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.manager = self.manager.with_progress(sink);
        self
    }

    pub fn with_locks(mut self, locks: AccountLocks) -> Self {
        self.manager = self.manager.with_locks(locks);
        self
    }

    pub async fn export(&self) -> Result<ExportResult> {
        self.export_with(&CancellationToken::new()).await
    }

    pub async fn export_with(&self, cancel: &CancellationToken) -> Result<ExportResult> {
        self.manager
            .export(&self.account, PASSWORD.into(), self.out_dir.path(), cancel)
            .await
    }

    pub async fn restore(&self, path: &Path, password: &str) -> Result<RestoreResult> {
        self.manager
            .restore(
                path,
                &self.account,
                SecureString::from(password),
                RestoreOptions::default(),
                &CancellationToken::new(),
            )
            .await
    }

    pub fn out_files(&self) -> Vec<PathBuf> {
        list_dir(self.out_dir.path())
    }

    pub fn scratch_files(&self) -> Vec<PathBuf> {
        list_dir(self.scratch_dir.path())
    }
}

pub fn manager_for(db: &MemoryDatabase, scratch: &Path) -> BackupManager {
    manager_with(db, scratch, test_settings(scratch))
}

pub fn manager_with(db: &MemoryDatabase, scratch: &Path, settings: BackupSettings) -> BackupManager {
    let scratch = ScratchDir::new(scratch).unwrap();
    BackupManager::new(db.registry(), db.staging.clone(), Arc::new(scratch), settings)
}

pub fn list_dir(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    files.sort();
    files
}
