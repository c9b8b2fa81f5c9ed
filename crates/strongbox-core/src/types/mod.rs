//! Type definitions shared across Strongbox crates

mod retry_policy;

pub use retry_policy::*;
