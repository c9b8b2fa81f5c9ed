//! Restore transaction with atomic rollback
//!
//! Restored rows are written into a staging area supplied by the storage
//! layer. Live data is only replaced when the transaction commits.

use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Name used in errors raised by the staging store itself
const STAGING: &str = "<staging>";

/// Staging area the table writers insert into during a restore.
///
/// Cancel a restore through its `CancellationToken`, which rolls back before
/// returning. A restore future dropped mid-write only gets a rollback spawned
/// on the current runtime, so `begin` must also discard whatever an earlier,
/// abandoned restore left staged.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Prepare an empty staging area, discarding any rows still staged
    async fn begin(&self) -> anyhow::Result<()>;

    /// Atomically replace live data with the staged rows
    async fn commit(&self) -> anyhow::Result<()>;

    /// Discard the staged rows, leaving live data untouched
    async fn rollback(&self) -> anyhow::Result<()>;
}

/// Rows written to one table within a transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableChange {
    pub batches: u32,
    pub rows: u64,
}

pub struct RestoreTransaction {
    pub id: String,
    store: Arc<dyn StagingStore>,
    changes: BTreeMap<String, TableChange>,
    finished: bool,
}

impl RestoreTransaction {
    pub async fn begin(store: Arc<dyn StagingStore>) -> Result<Self> {
        let id = Uuid::new_v4().to_string();
        info!("Beginning restore transaction {}", id);
        store
            .begin()
            .await
            .map_err(|e| BackupError::storage_write(STAGING, e))?;

        Ok(Self {
            id,
            store,
            changes: BTreeMap::new(),
            finished: false,
        })
    }

    pub fn record_batch(&mut self, table: &str, rows: usize) {
        let change = self.changes.entry(table.to_string()).or_default();
        change.batches += 1;
        change.rows += rows as u64;
    }

    pub fn changes(&self) -> &BTreeMap<String, TableChange> {
        &self.changes
    }

    pub fn rows_written(&self) -> u64 {
        self.changes.values().map(|c| c.rows).sum()
    }

    /// Publish the staged rows. A failed commit is rolled back before returning.
    pub async fn commit(mut self) -> Result<()> {
        info!(
            "Committing restore transaction {} ({} rows)",
            self.id,
            self.rows_written()
        );
        if let Err(e) = self.store.commit().await {
            warn!("Commit of restore transaction {} failed: {}", self.id, e);
            self.discard().await;
            return Err(BackupError::storage_write(STAGING, e));
        }
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) {
        self.discard().await;
    }

    async fn discard(&mut self) {
        warn!(
            "Rolling back restore transaction {} ({} tables staged)",
            self.id,
            self.changes.len()
        );
        if let Err(e) = self.store.rollback().await {
            warn!("Failed to roll back restore transaction {}: {}", self.id, e);
        }
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for RestoreTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(
            "Restore transaction {} dropped without commit or rollback",
            self.id
        );

        // The restore future was dropped mid-write
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                let id = self.id.clone();
                handle.spawn(async move {
                    if let Err(e) = store.rollback().await {
                        warn!("Failed to roll back restore transaction {}: {}", id, e);
                    }
                });
            }
            Err(_) => warn!(
                "No runtime to roll back restore transaction {}; the next begin discards it",
                self.id
            ),
        }
    }
}
