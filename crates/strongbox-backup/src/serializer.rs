//! Table batch serialization
//!
//! Each batch becomes one self-describing JSON document:
//!
//! ```json
//! { "format": 1, "table": "folders", "batch": 0, "count": 2, "records": [ ... ] }
//! ```
//!
//! Unknown fields are ignored on read so newer writers can add metadata
//! without breaking older readers. Binary record fields should use
//! [`base64_bytes`].

use crate::error::{BackupError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Version of the batch document layout
pub const BATCH_FORMAT_VERSION: u32 = 1;

/// Extension of batch entries inside the archive
const BATCH_EXTENSION: &str = ".json";

/// A batch of records encoded for the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedBatch {
    pub table: String,
    pub index: u32,
    pub record_count: usize,
    pub payload: Vec<u8>,
}

impl SerializedBatch {
    /// Archive entry name, `<table>_<index>.json`
    pub fn entry_name(&self) -> String {
        batch_entry_name(&self.table, self.index)
    }
}

#[derive(Serialize)]
struct BatchDocumentRef<'a, R> {
    format: u32,
    table: &'a str,
    batch: u32,
    count: usize,
    records: &'a [R],
}

#[derive(Deserialize)]
struct BatchDocument<R> {
    format: u32,
    table: String,
    batch: u32,
    #[serde(default)]
    count: Option<usize>,
    records: Vec<R>,
}

/// Build the archive entry name for a batch
pub fn batch_entry_name(table: &str, index: u32) -> String {
    format!("{}_{}{}", table, index, BATCH_EXTENSION)
}

/// Split an entry name back into table and batch index.
///
/// Table names may themselves contain underscores; the index is whatever
/// follows the last one.
pub fn parse_batch_entry_name(name: &str) -> Option<(&str, u32)> {
    let stem = name.strip_suffix(BATCH_EXTENSION)?;
    let (table, index) = stem.rsplit_once('_')?;
    if table.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((table, index.parse().ok()?))
}

/// Encode a batch of records
pub fn serialize_batch<R: Serialize>(
    table: &str,
    index: u32,
    records: &[R],
) -> Result<SerializedBatch> {
    let doc = BatchDocumentRef {
        format: BATCH_FORMAT_VERSION,
        table,
        batch: index,
        count: records.len(),
        records,
    };
    let payload = serde_json::to_vec(&doc)
        .map_err(|e| BackupError::serialization(batch_entry_name(table, index), e))?;

    Ok(SerializedBatch {
        table: table.to_string(),
        index,
        record_count: records.len(),
        payload,
    })
}

/// Decode a batch produced by [`serialize_batch`].
///
/// The document must name the same table and batch index as the archive
/// entry it was read from, and its record count must match.
pub fn deserialize_batch<R: DeserializeOwned>(batch: &SerializedBatch) -> Result<Vec<R>> {
    let entry = batch.entry_name();
    let doc: BatchDocument<R> =
        serde_json::from_slice(&batch.payload).map_err(|e| BackupError::serialization(&entry, e))?;

    if doc.format > BATCH_FORMAT_VERSION {
        return Err(BackupError::serialization(
            &entry,
            format!("unsupported batch format {}", doc.format),
        ));
    }
    if doc.table != batch.table || doc.batch != batch.index {
        return Err(BackupError::serialization(
            &entry,
            format!("document describes {}", batch_entry_name(&doc.table, doc.batch)),
        ));
    }
    if let Some(count) = doc.count {
        if count != doc.records.len() {
            return Err(BackupError::serialization(
                &entry,
                format!("declares {} records but holds {}", count, doc.records.len()),
            ));
        }
    }
    if doc.records.len() != batch.record_count {
        return Err(BackupError::serialization(
            &entry,
            format!(
                "holds {} records, index expects {}",
                doc.records.len(),
                batch.record_count
            ),
        ));
    }

    Ok(doc.records)
}

/// Serde helpers storing byte fields as standard base64 strings
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: T, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }

    /// Same encoding for `Option<Vec<u8>>`, with `null` for `None`
    pub mod option {
        use super::STANDARD;
        use base64::Engine;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> std::result::Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match bytes {
                Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<u8>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
