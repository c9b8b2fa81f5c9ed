//! Retry delay strategies and predicates

use crate::types::{RetryPolicy, RetryStrategy};
use rand::Rng;
use std::io;
use std::time::Duration;

/// Calculate the delay before the next retry attempt
///
/// `attempt` is 1-indexed. With `jitter` enabled up to 25% of random
/// variation is added on top of the capped delay.
///
/// ```rust
/// use strongbox_core::retry::calculate_delay;
/// use strongbox_core::types::{RetryPolicy, RetryStrategy};
///
/// let policy = RetryPolicy {
///     max_attempts: 3,
///     strategy: RetryStrategy::ExponentialBackoff,
///     backoff_multiplier: 2.0,
///     initial_delay_ms: 100,
///     max_delay_ms: 1000,
/// };
///
/// assert_eq!(calculate_delay(&policy, 1, false).as_millis(), 100);
/// assert_eq!(calculate_delay(&policy, 2, false).as_millis(), 200);
/// ```
pub fn calculate_delay(policy: &RetryPolicy, attempt: u32, jitter: bool) -> Duration {
    let attempt_index = attempt.saturating_sub(1);

    let base_delay_ms = match policy.strategy {
        RetryStrategy::None => 0,

        RetryStrategy::FixedDelay => policy.initial_delay_ms,

        RetryStrategy::ExponentialBackoff => {
            let multiplier = policy.backoff_multiplier.powf(attempt_index as f64);
            (policy.initial_delay_ms as f64 * multiplier) as u64
        }

        RetryStrategy::LinearBackoff => policy.initial_delay_ms * (attempt_index as u64 + 1),
    };

    let capped_delay_ms = base_delay_ms.min(policy.max_delay_ms);

    let final_delay_ms = if jitter && capped_delay_ms > 0 {
        let jitter_range = capped_delay_ms / 4;
        let jitter_value = rand::rng().random_range(0..=jitter_range);
        capped_delay_ms + jitter_value
    } else {
        capped_delay_ms
    };

    Duration::from_millis(final_delay_ms)
}

/// A predicate that determines whether an error should be retried
pub trait RetryPredicate<E: ?Sized>: Send + Sync {
    /// Determine whether the given error should be retried
    fn should_retry(&self, error: &E) -> bool;
}

/// Retries only I/O failures that can clear up on their own.
///
/// Disk full and permission errors are permanent for the lifetime of one
/// backup run and are reported immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientIoPredicate;

impl RetryPredicate<io::Error> for TransientIoPredicate {
    fn should_retry(&self, error: &io::Error) -> bool {
        matches!(
            error.kind(),
            io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
                | io::ErrorKind::TimedOut
                | io::ErrorKind::AlreadyExists
        )
    }
}
