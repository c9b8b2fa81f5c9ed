//! Table collaborators and the registry of backed-up tables
//!
//! Storage is supplied by the application through two small traits:
//! [`BatchTableReader`] pages rows out of a table and [`TableWriter`]
//! inserts rows on restore. A [`TableSpec`] pairs them under a stable
//! table name and erases the record type so tables of different shapes
//! can live in one [`TableRegistry`].

use crate::error::{BackupError, Result};
use crate::serializer::{deserialize_batch, serialize_batch, SerializedBatch};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

/// Pages rows out of a single table
#[async_trait]
pub trait BatchTableReader<R>: Send + Sync {
    /// Total number of rows in the table
    async fn count(&self) -> anyhow::Result<u64>;

    /// Up to `batch_size` rows starting at row offset `start`
    async fn next_batch(&self, start: u64, batch_size: usize) -> anyhow::Result<Vec<R>>;
}

/// Inserts restored rows into a single table
#[async_trait]
pub trait TableWriter<R>: Send + Sync {
    async fn insert_batch(&self, records: Vec<R>) -> anyhow::Result<()>;
}

/// Type-erased view of a table used by the pipeline
#[async_trait]
pub trait BackupTable: Send + Sync {
    fn name(&self) -> &str;

    async fn count(&self) -> Result<u64>;

    /// Read and serialize the batch starting at `start`
    async fn export_batch(&self, index: u32, start: u64, batch_size: usize)
        -> Result<SerializedBatch>;

    /// Decode a batch without writing it, returning its row count
    fn verify_batch(&self, batch: &SerializedBatch) -> Result<usize>;

    /// Decode a batch and hand its rows to the writer
    async fn import_batch(&self, batch: &SerializedBatch) -> Result<usize>;
}

/// A named table with its reader and writer
pub struct TableSpec<R> {
    name: String,
    reader: Arc<dyn BatchTableReader<R>>,
    writer: Arc<dyn TableWriter<R>>,
    _record: PhantomData<fn() -> R>,
}

impl<R> TableSpec<R> {
    pub fn new(
        name: impl Into<String>,
        reader: Arc<dyn BatchTableReader<R>>,
        writer: Arc<dyn TableWriter<R>>,
    ) -> Self {
        Self {
            name: name.into(),
            reader,
            writer,
            _record: PhantomData,
        }
    }
}

#[async_trait]
impl<R> BackupTable for TableSpec<R>
where
    R: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn count(&self) -> Result<u64> {
        self.reader
            .count()
            .await
            .map_err(|e| BackupError::storage_read(&self.name, e))
    }

    async fn export_batch(
        &self,
        index: u32,
        start: u64,
        batch_size: usize,
    ) -> Result<SerializedBatch> {
        let records = self
            .reader
            .next_batch(start, batch_size)
            .await
            .map_err(|e| BackupError::storage_read(&self.name, e))?;

        if records.len() > batch_size {
            return Err(BackupError::storage_read(
                &self.name,
                format!(
                    "reader returned {} rows for a batch of {}",
                    records.len(),
                    batch_size
                ),
            ));
        }

        serialize_batch(&self.name, index, &records)
    }

    fn verify_batch(&self, batch: &SerializedBatch) -> Result<usize> {
        deserialize_batch::<R>(batch).map(|records| records.len())
    }

    async fn import_batch(&self, batch: &SerializedBatch) -> Result<usize> {
        let records = deserialize_batch::<R>(batch)?;
        let count = records.len();
        self.writer
            .insert_batch(records)
            .await
            .map_err(|e| BackupError::storage_write(&self.name, e))?;
        Ok(count)
    }
}

/// The ordered set of tables included in backups
#[derive(Clone, Default)]
pub struct TableRegistry {
    tables: Vec<Arc<dyn BackupTable>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table. Names must be unique and safe to embed in entry names.
    pub fn register(&mut self, table: impl BackupTable + 'static) -> anyhow::Result<&mut Self> {
        let name = table.name();
        if !is_valid_table_name(name) {
            anyhow::bail!(
                "Invalid table name '{}': use lowercase letters, digits, '_' or '-'",
                name
            );
        }
        if self.get(name).is_some() {
            anyhow::bail!("Table '{}' is already registered", name);
        }
        self.tables.push(Arc::new(table));
        Ok(self)
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_table(mut self, table: impl BackupTable + 'static) -> anyhow::Result<Self> {
        self.register(table)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn BackupTable>> {
        self.tables.iter().find(|t| t.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn BackupTable>> {
        self.tables.iter()
    }

    pub fn names(&self) -> HashSet<&str> {
        self.tables.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}
