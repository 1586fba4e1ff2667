//! Idempotency registry: maps a transfer key to the outcome of its first
//! successful attempt.
//!
//! The first submission of a key claims it by atomically inserting an
//! in-flight placeholder. Later submissions either replay the settled
//! outcome or wait for the in-flight attempt to settle; they never execute
//! the transfer body themselves while the placeholder stands.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error};

use super::error::{StorageError, TransientError};
use crate::model::{Transfer, TransferKey, TransferRequest, TransferStatus};

/// What the registry stores under a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyEntry {
    /// The first attempt is still executing.
    InFlight {
        request: TransferRequest,
        started_at: DateTime<Utc>,
    },
    /// Terminal outcome, replayed to every later submission.
    Settled(Transfer),
}

impl IdempotencyEntry {
    pub fn placeholder(request: TransferRequest) -> Self {
        IdempotencyEntry::InFlight {
            request,
            started_at: Utc::now(),
        }
    }

    pub fn status(&self) -> TransferStatus {
        match self {
            IdempotencyEntry::InFlight { .. } => TransferStatus::Pending,
            IdempotencyEntry::Settled(transfer) => transfer.status(),
        }
    }
}

/// Key-value substrate for the registry.
pub trait IdempotencyStore: Send + Sync {
    /// Insert `entry` unless `key` is present, in one indivisible step.
    ///
    /// Returns the existing entry when there was one.
    fn insert_if_absent(
        &self,
        key: &TransferKey,
        entry: IdempotencyEntry,
    ) -> Result<Option<IdempotencyEntry>, StorageError>;

    fn put(&self, key: &TransferKey, entry: IdempotencyEntry) -> Result<(), StorageError>;

    fn get(&self, key: &TransferKey) -> Result<Option<IdempotencyEntry>, StorageError>;

    fn remove(&self, key: &TransferKey) -> Result<(), StorageError>;

    /// Every settled outcome, in no particular order.
    fn settled(&self) -> Result<Vec<Transfer>, StorageError>;
}

/// Idempotency store backed by a map in memory.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<TransferKey, IdempotencyEntry>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<TransferKey, IdempotencyEntry>>, StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Unavailable("idempotency table poisoned".into()))
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn insert_if_absent(
        &self,
        key: &TransferKey,
        entry: IdempotencyEntry,
    ) -> Result<Option<IdempotencyEntry>, StorageError> {
        match self.table()?.entry(key.clone()) {
            Entry::Occupied(existing) => Ok(Some(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(None)
            }
        }
    }

    fn put(&self, key: &TransferKey, entry: IdempotencyEntry) -> Result<(), StorageError> {
        self.table()?.insert(key.clone(), entry);
        Ok(())
    }

    fn get(&self, key: &TransferKey) -> Result<Option<IdempotencyEntry>, StorageError> {
        Ok(self.table()?.get(key).cloned())
    }

    fn remove(&self, key: &TransferKey) -> Result<(), StorageError> {
        self.table()?.remove(key);
        Ok(())
    }

    fn settled(&self) -> Result<Vec<Transfer>, StorageError> {
        Ok(self
            .table()?
            .values()
            .filter_map(|entry| match entry {
                IdempotencyEntry::Settled(transfer) => Some(transfer.clone()),
                IdempotencyEntry::InFlight { .. } => None,
            })
            .collect())
    }
}

/// Result of [`IdempotencyRegistry::record_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub inserted: bool,
    pub existing: Option<IdempotencyEntry>,
}

/// What a submission may do with its key.
#[derive(Debug)]
pub enum Claim {
    /// The caller owns the key and must settle or release it.
    Acquired(KeyClaim),
    /// The key already settled; replay this outcome.
    Settled(Transfer),
    /// The key belongs to a transfer with different parameters.
    Conflict,
}

/// Atomic claim/settle protocol over an [`IdempotencyStore`].
///
/// Cheap to clone; clones share the store and the change signal.
#[derive(Clone)]
pub struct IdempotencyRegistry {
    shared: Arc<Shared>,
}

struct Shared {
    store: Arc<dyn IdempotencyStore>,
    // bumped whenever a placeholder settles or is abandoned
    changes: watch::Sender<u64>,
}

impl IdempotencyRegistry {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared { store, changes }),
        }
    }

    /// Claim `key` with a placeholder unless an entry is already there.
    pub fn record_if_absent(
        &self,
        key: &TransferKey,
        placeholder: IdempotencyEntry,
    ) -> Result<Reservation, StorageError> {
        let existing = self.shared.store.insert_if_absent(key, placeholder)?;
        Ok(Reservation {
            inserted: existing.is_none(),
            existing,
        })
    }

    /// Claim the request's key, waiting up to `wait` for an in-flight
    /// attempt of the same key to settle.
    ///
    /// If that attempt abandons its placeholder, the claim is retried and may
    /// succeed for this caller.
    pub async fn claim(
        &self,
        request: &TransferRequest,
        wait: Duration,
    ) -> Result<Claim, TransientError> {
        let deadline = Instant::now() + wait;
        // subscribe before looking so a settle in between is not missed
        let mut changes = self.shared.changes.subscribe();

        loop {
            let reservation = self.record_if_absent(
                &request.key,
                IdempotencyEntry::placeholder(request.clone()),
            )?;

            match reservation.existing {
                None => {
                    return Ok(Claim::Acquired(KeyClaim {
                        registry: self.clone(),
                        key: request.key.clone(),
                        armed: true,
                    }));
                }
                Some(IdempotencyEntry::Settled(transfer)) => {
                    if !transfer.matches(request) {
                        return Ok(Claim::Conflict);
                    }
                    debug!(key = %request.key, status = %transfer.status(), "replaying settled transfer");
                    return Ok(Claim::Settled(transfer));
                }
                Some(IdempotencyEntry::InFlight { request: first, .. }) => {
                    if !first.same_parameters(request) {
                        return Ok(Claim::Conflict);
                    }
                    debug!(key = %request.key, "waiting for in-flight attempt");
                    match timeout_at(deadline, changes.changed()).await {
                        Ok(Ok(())) => continue,
                        // sender lives as long as the registry
                        Ok(Err(_)) | Err(_) => {
                            return Err(TransientError::InFlight(request.key.clone()));
                        }
                    }
                }
            }
        }
    }

    /// Replace the placeholder with the terminal outcome.
    pub fn finalize(&self, transfer: &Transfer) -> Result<(), StorageError> {
        self.shared
            .store
            .put(&transfer.key, IdempotencyEntry::Settled(transfer.clone()))?;
        self.notify();
        Ok(())
    }

    /// Drop the placeholder so the key can be executed again.
    pub fn abandon(&self, key: &TransferKey) -> Result<(), StorageError> {
        self.shared.store.remove(key)?;
        self.notify();
        Ok(())
    }

    /// The settled outcome for `key`, if any.
    pub fn lookup(&self, key: &TransferKey) -> Result<Option<Transfer>, StorageError> {
        Ok(match self.shared.store.get(key)? {
            Some(IdempotencyEntry::Settled(transfer)) => Some(transfer),
            Some(IdempotencyEntry::InFlight { .. }) | None => None,
        })
    }

    /// The raw entry for `key`, placeholders included.
    pub fn entry(&self, key: &TransferKey) -> Result<Option<IdempotencyEntry>, StorageError> {
        self.shared.store.get(key)
    }

    /// Every settled outcome, oldest first.
    pub fn settled(&self) -> Result<Vec<Transfer>, StorageError> {
        let mut transfers = self.shared.store.settled()?;
        transfers.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(transfers)
    }

    fn notify(&self) {
        self.shared
            .changes
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

/// Ownership of an in-flight key.
///
/// Dropped without [`settle`](KeyClaim::settle), [`release`](KeyClaim::release)
/// or [`keep`](KeyClaim::keep), for example when the submitting future is
/// cancelled, it removes its placeholder so the key stays retryable.
#[must_use]
pub struct KeyClaim {
    registry: IdempotencyRegistry,
    key: TransferKey,
    armed: bool,
}

impl KeyClaim {
    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    /// Store `transfer` as the key's outcome.
    pub fn settle(&mut self, transfer: &Transfer) -> Result<(), StorageError> {
        debug_assert_eq!(transfer.key, self.key);
        self.registry.finalize(transfer)?;
        self.armed = false;
        Ok(())
    }

    /// Remove the placeholder so the key can be executed again.
    pub fn release(&mut self) -> Result<(), StorageError> {
        self.registry.abandon(&self.key)?;
        self.armed = false;
        Ok(())
    }

    /// Leave the placeholder in flight; the key will not execute again.
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl std::fmt::Debug for KeyClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyClaim")
            .field("key", &self.key)
            .field("armed", &self.armed)
            .finish()
    }
}

impl Drop for KeyClaim {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.registry.abandon(&self.key) {
            Ok(()) => debug!(key = %self.key, "unsettled transfer key released"),
            Err(err) => {
                error!(key = %self.key, error = %err, "unsettled transfer key could not be released");
            }
        }
    }
}
