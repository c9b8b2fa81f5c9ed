//! # strongbox-core
//!
//! Core library for Strongbox providing:
//! - Backup pipeline settings loaded from YAML
//! - Error types for configuration handling
//! - Retry execution engine with policy-based configuration

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

pub use config::{BackupSettings, KdfSettings};
pub use error::{Error, Result};
pub use types::{RetryPolicy, RetryStrategy};
