//! Common test utilities for strongbox-backup
//!
//! This module provides shared test infrastructure including:
//! - An in-memory table store with staging semantics
//! - Record types and seeded databases
//! - A harness wiring a `BackupManager` to temporary directories

#![allow(dead_code)]
#![allow(unused_imports)]

pub mod fixtures;
pub mod mocks;

pub use fixtures::*;
pub use mocks::*;
