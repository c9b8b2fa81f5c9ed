//! Backup pipeline settings
//!
//! Every field has a default, so an empty YAML document (or no file at all)
//! yields a working configuration.

use crate::error::{Error, Result};
use crate::types::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Conventional configuration file name
pub const CONFIG_FILE_NAME: &str = "strongbox.yaml";

/// Largest plaintext chunk accepted, in bytes
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Lowest Argon2 memory cost accepted per lane, in KiB
const MIN_MEMORY_KIB_PER_LANE: u32 = 8;

/// Upper bounds on Argon2 costs, for settings and for backup headers alike
pub const MAX_KDF_MEMORY_KIB: u32 = 1024 * 1024;
pub const MAX_KDF_ITERATIONS: u32 = 64;
pub const MAX_KDF_PARALLELISM: u32 = 16;

/// Settings for the backup/restore pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupSettings {
    /// Rows fetched from a table (and inserted on restore) per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on tables exported concurrently
    #[serde(default = "default_max_concurrent_tables")]
    pub max_concurrent_tables: usize,

    /// Gzip level for the inner archive (1-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Plaintext bytes per encrypted chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Extension of produced backup files, without the dot
    #[serde(default = "default_file_extension")]
    pub file_extension: String,

    /// Base directory for scratch files; the system temp dir when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,

    /// Password key derivation cost
    #[serde(default)]
    pub kdf: KdfSettings,

    /// Retry policy for scratch file creation
    #[serde(default)]
    pub temp_file_retry: RetryPolicy,
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KdfSettings {
    /// Memory cost in KiB
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,

    /// Number of passes
    #[serde(default = "default_iterations")]
    pub iterations: u32,

    /// Degree of parallelism (lanes)
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_tables: default_max_concurrent_tables(),
            compression_level: default_compression_level(),
            chunk_size: default_chunk_size(),
            file_extension: default_file_extension(),
            scratch_dir: None,
            kdf: KdfSettings::default(),
            temp_file_retry: RetryPolicy::default(),
        }
    }
}

impl Default for KdfSettings {
    fn default() -> Self {
        Self {
            memory_kib: default_memory_kib(),
            iterations: default_iterations(),
            parallelism: default_parallelism(),
        }
    }
}

fn default_batch_size() -> usize {
    500
}
fn default_max_concurrent_tables() -> usize {
    2
}
fn default_compression_level() -> u32 {
    6
}
fn default_chunk_size() -> usize {
    64 * 1024
}
fn default_file_extension() -> String {
    "sbk".to_string()
}
fn default_memory_kib() -> u32 {
    64 * 1024 // 64 MiB
}
fn default_iterations() -> u32 {
    3
}
fn default_parallelism() -> u32 {
    4
}

impl BackupSettings {
    /// Load settings from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::config_not_found(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;

        let settings = Self::from_yaml(&content)?;
        tracing::debug!("Loaded backup settings from {}", path.display());
        Ok(settings)
    }

    /// Load settings from `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(Error::ConfigNotFound { .. }) => Ok(Self::default()),
            other => other,
        }
    }

    /// Parse and validate settings from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let settings: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml_ng::from_str(content)?
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize settings to YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::invalid_config("batch-size must be at least 1"));
        }
        if self.max_concurrent_tables == 0 {
            return Err(Error::invalid_config(
                "max-concurrent-tables must be at least 1",
            ));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::invalid_config(format!(
                "chunk-size must be between 1 and {} bytes",
                MAX_CHUNK_SIZE
            )));
        }
        if self.file_extension.is_empty()
            || !self
                .file_extension
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(Error::invalid_config(format!(
                "file-extension must be non-empty ASCII alphanumerics, got '{}'",
                self.file_extension
            )));
        }
        self.kdf.validate()
    }

    /// Gzip level clamped to the valid range
    pub fn effective_compression_level(&self) -> u32 {
        self.compression_level.clamp(1, 9)
    }

    /// Directory scratch files are created in
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl KdfSettings {
    /// Cheap parameters for tests and development; never use for real backups
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    /// Check the parameters against the Argon2 minimums and the accepted caps
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_KDF_PARALLELISM).contains(&self.parallelism) {
            return Err(Error::invalid_config(format!(
                "kdf.parallelism must be between 1 and {}, got {}",
                MAX_KDF_PARALLELISM, self.parallelism
            )));
        }
        if !(1..=MAX_KDF_ITERATIONS).contains(&self.iterations) {
            return Err(Error::invalid_config(format!(
                "kdf.iterations must be between 1 and {}, got {}",
                MAX_KDF_ITERATIONS, self.iterations
            )));
        }
        let min_memory = MIN_MEMORY_KIB_PER_LANE * self.parallelism;
        if self.memory_kib < min_memory {
            return Err(Error::invalid_config(format!(
                "kdf.memory-kib must be at least {} for {} lanes, got {}",
                min_memory, self.parallelism, self.memory_kib
            )));
        }
        if self.memory_kib > MAX_KDF_MEMORY_KIB {
            return Err(Error::invalid_config(format!(
                "kdf.memory-kib must be at most {}, got {}",
                MAX_KDF_MEMORY_KIB, self.memory_kib
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RetryStrategy;

    #[test]
    fn test_defaults() {
        let settings = BackupSettings::default();
        assert_eq!(settings.batch_size, 500);
        assert_eq!(settings.chunk_size, 65536);
        assert_eq!(settings.file_extension, "sbk");
        assert_eq!(settings.kdf.memory_kib, 65536);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let settings = BackupSettings::from_yaml("").unwrap();
        assert_eq!(settings, BackupSettings::default());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
batch-size: 2
kdf:
  memory-kib: 1024
temp-file-retry:
  max-attempts: 5
  strategy: linear-backoff
"#;
        let settings = BackupSettings::from_yaml(yaml).unwrap();
        assert_eq!(settings.batch_size, 2);
        assert_eq!(settings.kdf.memory_kib, 1024);
        assert_eq!(settings.kdf.iterations, 3);
        assert_eq!(settings.temp_file_retry.max_attempts, 5);
        assert_eq!(
            settings.temp_file_retry.strategy,
            RetryStrategy::LinearBackoff
        );
        assert_eq!(settings.max_concurrent_tables, 2);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = BackupSettings::from_yaml("batch-size: 0").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
        assert!(err.to_string().contains("batch-size"));
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let settings = BackupSettings {
            chunk_size: MAX_CHUNK_SIZE + 1,
            ..BackupSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_kdf_memory_below_minimum_rejected() {
        let err = BackupSettings::from_yaml("kdf:\n  memory-kib: 16\n  parallelism: 4\n")
            .unwrap_err();
        assert!(err.to_string().contains("at least 32"));
    }

    #[test]
    fn test_kdf_costs_above_caps_rejected() {
        let memory = KdfSettings {
            memory_kib: MAX_KDF_MEMORY_KIB + 8,
            ..KdfSettings::default()
        };
        let err = memory.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
        assert!(err.to_string().contains("kdf.memory-kib"));

        let iterations = KdfSettings {
            iterations: MAX_KDF_ITERATIONS + 1,
            ..KdfSettings::default()
        };
        assert!(iterations.validate().unwrap_err().to_string().contains("kdf.iterations"));

        let err = BackupSettings::from_yaml("kdf:\n  parallelism: 17\n  memory-kib: 4096\n")
            .unwrap_err();
        assert!(err.to_string().contains("kdf.parallelism"));
    }

    #[test]
    fn test_kdf_costs_at_caps_accepted() {
        let kdf = KdfSettings {
            memory_kib: MAX_KDF_MEMORY_KIB,
            iterations: MAX_KDF_ITERATIONS,
            parallelism: MAX_KDF_PARALLELISM,
        };
        assert!(kdf.validate().is_ok());
    }

    #[test]
    fn test_bad_extension_rejected() {
        let err = BackupSettings::from_yaml("file-extension: \"../x\"").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_invalid_yaml_syntax() {
        let err = BackupSettings::from_yaml("batch-size: [[[").unwrap_err();
        assert!(matches!(err, Error::YamlParse(_)), "got {:?}", err);
    }

    #[test]
    fn test_compression_level_clamped() {
        let settings = BackupSettings {
            compression_level: 15,
            ..BackupSettings::default()
        };
        assert_eq!(settings.effective_compression_level(), 9);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let err = BackupSettings::load(Path::new("/tmp/nonexistent-strongbox-12345.yaml"))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let settings =
            BackupSettings::load_or_default(Path::new("/tmp/nonexistent-strongbox-12345.yaml"))
                .unwrap();
        assert_eq!(settings, BackupSettings::default());
    }

    #[test]
    fn test_load_roundtrip_through_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let settings = BackupSettings {
            batch_size: 42,
            kdf: KdfSettings::insecure_fast(),
            ..BackupSettings::default()
        };
        std::fs::write(&path, settings.to_yaml().unwrap()).unwrap();

        let loaded = BackupSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }
}
