//! In-memory storage collaborators

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strongbox_backup::{BatchTableReader, StagingStore, TableWriter};

/// Lets one staging store drive tables of different record types
pub trait Staged: Send + Sync {
    fn begin(&self);
    fn commit(&self);
    fn rollback(&self);
}

/// A table with live rows and an optional staged copy
pub struct MemoryTable<R> {
    live: Mutex<Vec<R>>,
    staged: Mutex<Option<Vec<R>>>,
    read_delay: Mutex<Duration>,
    insert_delay: Mutex<Duration>,
    fail_read_at: Mutex<Option<u64>>,
    fail_insert: AtomicBool,
    reads: AtomicU64,
    insert_on_read: Mutex<Option<R>>,
}

impl<R: Clone + Send + Sync + 'static> MemoryTable<R> {
    pub fn new(rows: Vec<R>) -> Arc<Self> {
        Arc::new(Self {
            live: Mutex::new(rows),
            staged: Mutex::new(None),
            read_delay: Mutex::new(Duration::ZERO),
            insert_delay: Mutex::new(Duration::ZERO),
            fail_read_at: Mutex::new(None),
            fail_insert: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            insert_on_read: Mutex::new(None),
        })
    }

    pub fn rows(&self) -> Vec<R> {
        self.live.lock().unwrap().clone()
    }

    pub fn set_rows(&self, rows: Vec<R>) {
        *self.live.lock().unwrap() = rows;
    }

    /// Sleep before every batch read
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = delay;
    }

    /// Sleep before every batch insert
    pub fn set_insert_delay(&self, delay: Duration) {
        *self.insert_delay.lock().unwrap() = delay;
    }

    /// Fail the batch read starting at `offset`
    pub fn fail_read_at(&self, offset: u64) {
        *self.fail_read_at.lock().unwrap() = Some(offset);
    }

    /// Append `row` to the live rows during the next batch read, as a
    /// concurrent writer would
    pub fn insert_on_next_read(&self, row: R) {
        *self.insert_on_read.lock().unwrap() = Some(row);
    }

    pub fn fail_inserts(&self) {
        self.fail_insert.store(true, Ordering::SeqCst);
    }

    pub fn batch_reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn is_staging(&self) -> bool {
        self.staged.lock().unwrap().is_some()
    }
}

#[async_trait]
impl<R: Clone + Send + Sync + 'static> BatchTableReader<R> for MemoryTable<R> {
    async fn count(&self) -> anyhow::Result<u64> {
        Ok(self.live.lock().unwrap().len() as u64)
    }

    async fn next_batch(&self, start: u64, batch_size: usize) -> anyhow::Result<Vec<R>> {
        let delay = *self.read_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_read_at.lock().unwrap() == Some(start) {
            bail!("simulated read failure at offset {}", start);
        }
        self.reads.fetch_add(1, Ordering::SeqCst);

        let mut live = self.live.lock().unwrap();
        if let Some(row) = self.insert_on_read.lock().unwrap().take() {
            live.push(row);
        }
        let start = (start as usize).min(live.len());
        let end = (start + batch_size).min(live.len());
        Ok(live[start..end].to_vec())
    }
}

#[async_trait]
impl<R: Clone + Send + Sync + 'static> TableWriter<R> for MemoryTable<R> {
    async fn insert_batch(&self, records: Vec<R>) -> anyhow::Result<()> {
        let delay = *self.insert_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_insert.load(Ordering::SeqCst) {
            bail!("simulated constraint violation");
        }
        let mut staged = self.staged.lock().unwrap();
        let staged = staged
            .as_mut()
            .ok_or_else(|| anyhow!("insert outside of a restore transaction"))?;
        staged.extend(records);
        Ok(())
    }
}

impl<R: Clone + Send + Sync + 'static> Staged for MemoryTable<R> {
    fn begin(&self) {
        *self.staged.lock().unwrap() = Some(Vec::new());
    }

    fn commit(&self) {
        if let Some(rows) = self.staged.lock().unwrap().take() {
            *self.live.lock().unwrap() = rows;
        }
    }

    fn rollback(&self) {
        self.staged.lock().unwrap().take();
    }
}

/// Staging store swapping every table in at once
#[derive(Default)]
pub struct MemoryStaging {
    tables: Vec<Arc<dyn Staged>>,
    fail_commit: AtomicBool,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
}

impl MemoryStaging {
    pub fn new(tables: Vec<Arc<dyn Staged>>) -> Self {
        Self {
            tables,
            ..Self::default()
        }
    }

    pub fn fail_commits(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StagingStore for MemoryStaging {
    async fn begin(&self) -> anyhow::Result<()> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        self.tables.iter().for_each(|t| t.begin());
        Ok(())
    }

    async fn commit(&self) -> anyhow::Result<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            bail!("simulated commit failure");
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.tables.iter().for_each(|t| t.commit());
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.tables.iter().for_each(|t| t.rollback());
        Ok(())
    }
}
