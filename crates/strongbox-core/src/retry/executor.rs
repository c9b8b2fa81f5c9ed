//! Retry execution engine

use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

use tracing::{debug, warn};

use crate::types::RetryPolicy;

use super::error::RetryError;
use super::strategies::{calculate_delay, RetryPredicate};

/// Execute an async operation, retrying only errors accepted by `predicate`.
///
/// Rejected errors return immediately as [`RetryError::NonRetryable`].
pub async fn retry_with_policy_if<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    predicate: &P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: RetryPredicate<E> + ?Sized,
{
    let start = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("Operation succeeded on attempt {}/{}", attempt, max_attempts);
                }
                return Ok(result);
            }
            Err(err) => {
                if !predicate.should_retry(&err) {
                    return Err(RetryError::non_retryable(err));
                }

                if attempt >= max_attempts {
                    warn!("Giving up after {} attempts: {}", attempt, err);
                    return Err(RetryError::exhausted(attempt, err, start.elapsed()));
                }

                let delay = calculate_delay(policy, attempt, true);
                debug!(
                    "Attempt {}/{} failed: {} (retrying in {:?})",
                    attempt, max_attempts, err, delay
                );

                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
