//! Configuration loading and management

mod settings;

pub use settings::{
    BackupSettings, KdfSettings, CONFIG_FILE_NAME, MAX_CHUNK_SIZE, MAX_KDF_ITERATIONS,
    MAX_KDF_MEMORY_KIB, MAX_KDF_PARALLELISM,
};
