//! Per-account exclusivity: one backup or restore per account at a time.

use crate::error::{BackupError, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Tracks which accounts have an operation in flight
#[derive(Debug, Clone, Default)]
pub struct AccountLocks {
    active: Arc<Mutex<HashSet<String>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lease for `account_id`, failing if it is already held
    pub fn try_acquire(&self, account_id: &str) -> Result<AccountLease> {
        if !self.lock().insert(account_id.to_string()) {
            return Err(BackupError::OperationInProgress {
                account: account_id.to_string(),
            });
        }
        tracing::debug!("Acquired operation lease for account {}", account_id);
        Ok(AccountLease {
            account_id: account_id.to_string(),
            locks: self.clone(),
        })
    }

    pub fn is_held(&self, account_id: &str) -> bool {
        self.lock().contains(account_id)
    }

    // The set stays consistent even if a holder panicked
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the account when dropped
#[derive(Debug)]
pub struct AccountLease {
    account_id: String,
    locks: AccountLocks,
}

impl AccountLease {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }
}

impl Drop for AccountLease {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.account_id);
        tracing::debug!("Released operation lease for account {}", self.account_id);
    }
}
