//! Per-account mutual exclusion with deadlock-free multi-account acquisition.
//!
//! Every caller that needs more than one account lock goes through
//! [`LockManager::acquire`], which always takes locks in ascending
//! [`AccountId`] order. Two operations touching the same pair of accounts,
//! in either direction, therefore queue on the same first lock and can never
//! wait on each other in a cycle.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AccountMutex, OwnedMutexGuard};
use tokio::time::{Instant, timeout_at};
use tracing::{trace, warn};

use super::error::LockError;
use crate::model::AccountId;

type SlotTable = Mutex<HashMap<AccountId, Arc<AccountMutex<()>>>>;

/// Hands out exclusive access to accounts.
///
/// Lock slots are created on demand and dropped once nobody holds or waits
/// on them.
#[derive(Debug)]
pub struct LockManager {
    slots: Arc<SlotTable>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Acquire every account in `accounts`, in sorted order, waiting at most
    /// the configured timeout in total.
    ///
    /// Duplicates are collapsed. On timeout every lock taken so far is
    /// released before the error is returned.
    pub async fn acquire(&self, accounts: &[AccountId]) -> Result<LockSet, LockError> {
        let ordered: BTreeSet<&AccountId> = accounts.iter().collect();
        let deadline = Instant::now() + self.timeout;

        // dropping a partial set releases what it holds
        let mut set = LockSet {
            slots: Arc::clone(&self.slots),
            held: Vec::with_capacity(ordered.len()),
        };
        for account in ordered {
            let slot = self.slot(account);
            match timeout_at(deadline, slot.lock_owned()).await {
                Ok(guard) => {
                    trace!(account = %account, "lock acquired");
                    set.held.push((account.clone(), guard));
                }
                Err(_) => {
                    warn!(account = %account, waited = ?self.timeout, "lock acquisition timed out");
                    return Err(LockError::Timeout {
                        account: account.clone(),
                        waited: self.timeout,
                    });
                }
            }
        }
        Ok(set)
    }

    /// Number of accounts that currently have a lock slot.
    pub fn active_slots(&self) -> usize {
        table(&self.slots).len()
    }

    fn slot(&self, account: &AccountId) -> Arc<AccountMutex<()>> {
        table(&self.slots)
            .entry(account.clone())
            .or_insert_with(|| Arc::new(AccountMutex::new(())))
            .clone()
    }
}

// the table only holds handles, so a poisoned guard is still usable
fn table(slots: &SlotTable) -> MutexGuard<'_, HashMap<AccountId, Arc<AccountMutex<()>>>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

fn forget_if_idle(slots: &SlotTable, account: &AccountId) {
    let mut table = table(slots);
    if table
        .get(account)
        .is_some_and(|slot| Arc::strong_count(slot) == 1)
    {
        table.remove(account);
    }
}

/// Locks held on a set of accounts. Released on drop, in reverse order.
///
/// Owns its guards, so it can move into another task.
#[derive(Debug)]
pub struct LockSet {
    slots: Arc<SlotTable>,
    held: Vec<(AccountId, OwnedMutexGuard<()>)>,
}

impl LockSet {
    pub fn holds(&self, account: &AccountId) -> bool {
        self.held.iter().any(|(id, _)| id == account)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &AccountId> + '_ {
        self.held.iter().map(|(id, _)| id)
    }

    /// Release every lock now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        while let Some((account, guard)) = self.held.pop() {
            drop(guard);
            trace!(account = %account, "lock released");
            forget_if_idle(&self.slots, &account);
        }
    }
}
