//! Account store: owns account records and their balances.
//!
//! The store does not lock accounts for the caller; the processor holds the
//! [`LockManager`](super::LockManager) locks around every mutation. Each
//! mutation is still a single atomic read-modify-write on the backing map.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use super::error::{AccountError, StorageError};
use crate::Amount;
use crate::model::{Account, AccountId};

/// Persistence interface for accounts.
pub trait AccountStore: Send + Sync {
    fn get(&self, id: &AccountId) -> Result<Account, AccountError>;

    fn create(
        &self,
        id: AccountId,
        owner_name: String,
        initial_balance: Amount,
    ) -> Result<Account, AccountError>;

    /// Add `delta` (possibly negative) to the balance and bump the revision.
    ///
    /// Fails with `InsufficientFunds` and leaves the account untouched if the
    /// balance would go below zero.
    fn apply_delta(&self, id: &AccountId, delta: Amount) -> Result<Account, AccountError>;

    /// Remove an account whose balance is zero.
    fn delete(&self, id: &AccountId) -> Result<Account, AccountError>;

    /// All accounts, in no particular order.
    fn list(&self) -> Result<Vec<Account>, AccountError>;

    /// Debit `from` and credit `to` by `amount` as one unit.
    ///
    /// Stores with a native multi-record commit should override this. The
    /// default applies the debit, then the credit, and undoes the debit if the
    /// credit fails.
    fn apply_pair(
        &self,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
    ) -> Result<(Account, Account), AccountError> {
        let debited = self.apply_delta(from, -amount)?;
        match self.apply_delta(to, amount) {
            Ok(credited) => Ok((debited, credited)),
            Err(err) => {
                self.apply_delta(from, amount)
                    .map_err(|_| AccountError::PartialCommit {
                        from: from.clone(),
                        to: to.clone(),
                    })?;
                Err(err)
            }
        }
    }
}

/// Account store backed by a map in memory.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<AccountId, Account>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<AccountId, Account>>, StorageError> {
        self.accounts
            .read()
            .map_err(|_| StorageError::Unavailable("account table poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<AccountId, Account>>, StorageError> {
        self.accounts
            .write()
            .map_err(|_| StorageError::Unavailable("account table poisoned".into()))
    }
}

/// Balance after adding `delta`, refusing to go negative or overflow.
fn shifted(account: &Account, delta: Amount) -> Result<Amount, AccountError> {
    let balance = account
        .balance
        .checked_add(delta)
        .ok_or_else(|| AccountError::Overflow(account.id.clone()))?;
    if balance.is_negative() {
        return Err(AccountError::InsufficientFunds {
            account: account.id.clone(),
            balance: account.balance,
            requested: -delta,
        });
    }
    Ok(balance)
}

impl AccountStore for InMemoryAccountStore {
    fn get(&self, id: &AccountId) -> Result<Account, AccountError> {
        self.read()?
            .get(id)
            .cloned()
            .ok_or_else(|| AccountError::NotFound(id.clone()))
    }

    fn create(
        &self,
        id: AccountId,
        owner_name: String,
        initial_balance: Amount,
    ) -> Result<Account, AccountError> {
        if !id.is_well_formed() {
            return Err(AccountError::InvalidId(id));
        }
        if initial_balance.is_negative() {
            return Err(AccountError::NegativeBalance(id, initial_balance));
        }

        let mut accounts = self.write()?;
        if accounts.contains_key(&id) {
            return Err(AccountError::AlreadyExists(id));
        }

        let account = Account {
            id: id.clone(),
            owner_name,
            balance: initial_balance,
            revision: 0,
            created_at: Utc::now(),
        };
        accounts.insert(id, account.clone());
        Ok(account)
    }

    fn apply_delta(&self, id: &AccountId, delta: Amount) -> Result<Account, AccountError> {
        let mut accounts = self.write()?;
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| AccountError::NotFound(id.clone()))?;

        account.balance = shifted(account, delta)?;
        account.revision += 1;
        Ok(account.clone())
    }

    fn delete(&self, id: &AccountId) -> Result<Account, AccountError> {
        let mut accounts = self.write()?;
        let balance = accounts
            .get(id)
            .map(|account| account.balance)
            .ok_or_else(|| AccountError::NotFound(id.clone()))?;
        if balance != Amount::ZERO {
            return Err(AccountError::NonZeroBalance(id.clone(), balance));
        }
        accounts
            .remove(id)
            .ok_or_else(|| AccountError::NotFound(id.clone()))
    }

    fn list(&self) -> Result<Vec<Account>, AccountError> {
        Ok(self.read()?.values().cloned().collect())
    }

    /// Both balances change under one write lock.
    fn apply_pair(
        &self,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
    ) -> Result<(Account, Account), AccountError> {
        let mut accounts = self.write()?;

        let source = accounts
            .get(from)
            .ok_or_else(|| AccountError::NotFound(from.clone()))?;
        let target = accounts
            .get(to)
            .ok_or_else(|| AccountError::NotFound(to.clone()))?;
        let from_balance = shifted(source, -amount)?;
        let to_balance = shifted(target, amount)?;

        let mut commit = |id: &AccountId, balance: Amount| {
            accounts.get_mut(id).map(|account| {
                account.balance = balance;
                account.revision += 1;
                account.clone()
            })
        };
        match (commit(from, from_balance), commit(to, to_balance)) {
            (Some(debited), Some(credited)) => Ok((debited, credited)),
            // both keys were checked under the same write lock
            _ => Err(AccountError::PartialCommit {
                from: from.clone(),
                to: to.clone(),
            }),
        }
    }
}
