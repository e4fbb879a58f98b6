use std::collections::{BTreeSet, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{LedgerError, LedgerResult};

/// In-process write locks keyed by account id. An operation takes its whole
/// account set at once, so two operations either share no account or run one
/// after the other.
#[derive(Debug, Default)]
pub(crate) struct AccountLocks {
    held: Mutex<HashSet<i64>>,
    released: Condvar,
}

impl AccountLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<i64>> {
        // The set is only touched under this mutex and never left half-updated.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block until none of `ids` is held by another operation, then take all
    /// of them.
    pub(crate) fn acquire(
        &self,
        ids: &BTreeSet<i64>,
        timeout: Duration,
    ) -> LedgerResult<AccountLockGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held();
        let mut waited = false;
        while ids.iter().any(|id| held.contains(id)) {
            let now = Instant::now();
            if now >= deadline {
                log::warn!("lock timeout on accounts {ids:?}");
                return Err(LedgerError::LockTimeout(ids.iter().copied().collect()));
            }
            if !waited {
                log::debug!("waiting for account locks {ids:?}");
                waited = true;
            }
            held = self
                .released
                .wait_timeout(held, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        held.extend(ids.iter().copied());
        Ok(AccountLockGuard {
            locks: self,
            ids: ids.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self, id: i64) -> bool {
        self.held().contains(&id)
    }
}

/// Releases its accounts on drop.
#[derive(Debug)]
pub(crate) struct AccountLockGuard<'a> {
    locks: &'a AccountLocks,
    ids: BTreeSet<i64>,
}

impl AccountLockGuard<'_> {
    pub(crate) fn covers(&self, ids: &BTreeSet<i64>) -> bool {
        ids.is_subset(&self.ids)
    }
}

impl Drop for AccountLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held();
        for id in &self.ids {
            held.remove(id);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
