//! Transaction log: append-only, sequenced record of completed transfers.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use super::error::StorageError;
use crate::model::{AccountId, LedgerEntry, Posting};

/// Durable sink for ledger entries.
pub trait LedgerSink: Send + Sync {
    /// Append `posting` and return its sequence number.
    ///
    /// Sequence numbers start at 1 and increase by one per append.
    fn append(&self, posting: Posting) -> Result<u64, StorageError>;

    /// Up to `limit` entries touching `account` with `sequence >= from`,
    /// ascending.
    fn scan(
        &self,
        account: &AccountId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, StorageError>;

    /// Number of entries appended so far.
    fn len(&self) -> Result<u64, StorageError>;
}

/// Ledger sink backed by a vector in memory.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StorageError {
    StorageError::Unavailable("ledger poisoned".into())
}

impl LedgerSink for InMemoryLedger {
    fn append(&self, posting: Posting) -> Result<u64, StorageError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let sequence = entries.len() as u64 + 1;
        entries.push(LedgerEntry { sequence, posting });
        Ok(sequence)
    }

    fn scan(
        &self,
        account: &AccountId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, StorageError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        // entry with sequence n lives at index n - 1
        let start = (from.max(1) - 1) as usize;
        Ok(entries
            .iter()
            .skip(start)
            .filter(|entry| entry.posting.touches(account))
            .take(limit)
            .cloned()
            .collect())
    }

    fn len(&self) -> Result<u64, StorageError> {
        Ok(self.entries.read().map_err(|_| poisoned())?.len() as u64)
    }
}

/// Front of the ledger sink used by the processor.
#[derive(Clone)]
pub struct TransactionLog {
    sink: Arc<dyn LedgerSink>,
    page_size: usize,
}

impl TransactionLog {
    pub fn new(sink: Arc<dyn LedgerSink>, page_size: usize) -> Self {
        Self {
            sink,
            page_size: page_size.max(1),
        }
    }

    pub fn append(&self, posting: Posting) -> Result<u64, StorageError> {
        self.sink.append(posting)
    }

    pub fn len(&self) -> Result<u64, StorageError> {
        self.sink.len()
    }

    /// Entries touching `account`, oldest first, fetched lazily page by page.
    pub fn list_by_account(&self, account: &AccountId) -> AccountHistory {
        AccountHistory {
            sink: Arc::clone(&self.sink),
            account: account.clone(),
            next: 1,
            page_size: self.page_size,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }
}

/// Lazy, finite iterator over one account's ledger entries.
///
/// Each page is read from the sink when the previous one is used up, so
/// entries appended while iterating may or may not be seen.
pub struct AccountHistory {
    sink: Arc<dyn LedgerSink>,
    account: AccountId,
    next: u64,
    page_size: usize,
    buffer: VecDeque<LedgerEntry>,
    exhausted: bool,
}

impl AccountHistory {
    /// Restart the iteration at `sequence`.
    pub fn starting_at(mut self, sequence: u64) -> Self {
        self.next = sequence.max(1);
        self.buffer.clear();
        self.exhausted = false;
        self
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    fn fill(&mut self) -> Result<(), StorageError> {
        let page = self.sink.scan(&self.account, self.next, self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.next = last.sequence + 1;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for AccountHistory {
    type Item = Result<LedgerEntry, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
