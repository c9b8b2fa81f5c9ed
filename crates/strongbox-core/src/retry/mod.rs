//! Retry execution engine with policy-based configuration
//!
//! Used for the few operations that may fail transiently, such as creating
//! scratch files on a busy filesystem. Everything else in the backup
//! pipeline fails terminally on the first error.
//!
//! # Example
//!
//! ```rust,no_run
//! use strongbox_core::retry::{retry_with_policy_if, RetryError, TransientIoPredicate};
//! use strongbox_core::types::RetryPolicy;
//!
//! async fn example() -> Result<std::fs::File, RetryError<std::io::Error>> {
//!     let policy = RetryPolicy::default();
//!
//!     retry_with_policy_if(&policy, &TransientIoPredicate, || async {
//!         std::fs::File::create_new("/tmp/strongbox-example.tmp")
//!     }).await
//! }
//! ```

mod error;
mod executor;
mod strategies;

pub use error::RetryError;
pub use executor::retry_with_policy_if;
pub use strategies::{calculate_delay, RetryPredicate, TransientIoPredicate};
