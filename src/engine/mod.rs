//! Transfer processing engine.
//!
//! The engine moves money between two accounts exactly once per transfer key.
//! A submission goes through these steps:
//! - claim the key in the idempotency registry, or replay its settled outcome
//! - check the request's structure, before any lock is taken
//! - lock both accounts in global order
//! - read both accounts and check the source balance
//! - apply the debit/credit pair
//! - append the ledger entry
//! - settle the key, then release the locks
//!
//! Rejections settle the key like completions do, so a retried submission
//! gets the same rejection. Transient failures release the key instead, so a
//! retry executes the whole sequence again.
//!
//! The last three steps run on their own task. A caller that stops waiting
//! never leaves balances applied without a ledger entry; a caller that stops
//! waiting before that point releases the key.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_stream::{Stream, StreamExt};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::Amount;
use crate::config::EngineConfig;
use crate::model::{
    Account, AccountId, BalanceChange, Posting, Receipt, Rejection, RejectionKind, Transfer,
    TransferKey, TransferOutcome, TransferRequest,
};

mod accounts;
pub use accounts::{AccountStore, InMemoryAccountStore};

mod error;
use error::Retryable;
pub use error::{AccountError, EngineError, LockError, StorageError, TransientError};

mod idempotency;
pub use idempotency::{
    Claim, IdempotencyEntry, IdempotencyRegistry, IdempotencyStore, InMemoryIdempotencyStore,
    KeyClaim, Reservation,
};

mod ledger;
pub use ledger::{AccountHistory, InMemoryLedger, LedgerSink, TransactionLog};

mod locks;
pub use locks::{LockManager, LockSet};

/// Upper bound on the pause between background settle attempts.
const SETTLE_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Storage backends the engine runs on.
#[derive(Clone)]
pub struct Backends {
    pub accounts: Arc<dyn AccountStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub ledger: Arc<dyn LedgerSink>,
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            accounts: Arc::new(InMemoryAccountStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            ledger: Arc::new(InMemoryLedger::new()),
        }
    }
}

/// Counts of what happened to the transfers of one [`Engine::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub rejected: usize,
    pub failed: usize,
}

/// The transfer processor.
///
/// Safe to share between tasks; unrelated transfers only contend on their
/// own accounts' locks.
pub struct Engine {
    stores: Stores,
    locks: LockManager,
}

/// Everything a commit needs, owned so it can run on its own task.
#[derive(Clone)]
struct Stores {
    accounts: Arc<dyn AccountStore>,
    registry: IdempotencyRegistry,
    log: TransactionLog,
    config: EngineConfig,
}

/// Public API
impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_backends(config, Backends::default())
    }

    pub fn with_backends(config: EngineConfig, backends: Backends) -> Self {
        Self {
            locks: LockManager::new(config.lock_timeout),
            stores: Stores {
                accounts: backends.accounts,
                registry: IdempotencyRegistry::new(backends.idempotency),
                log: TransactionLog::new(backends.ledger, config.history_page_size),
                config,
            },
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.stores.config
    }

    /// Submit every transfer of `stream`, one after the other.
    pub async fn run(&self, mut stream: impl Stream<Item = TransferRequest> + Unpin) -> RunSummary {
        let mut summary = RunSummary::default();
        while let Some(request) = stream.next().await {
            // a failed transfer does not stop the run
            match self.submit_transfer(request).await {
                Ok(transfer) if transfer.is_completed() => summary.completed += 1,
                Ok(_) => summary.rejected += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }

    /// Move `request.amount` from `request.from` to `request.to`, at most once
    /// per `request.key`.
    ///
    /// Returns the settled transfer, completed or rejected. Resubmitting a
    /// settled key returns the stored transfer unchanged. `Err` means nothing
    /// was committed and the same request may be retried, or, for
    /// [`EngineError::InvariantViolation`], that the engine detected an
    /// internal fault.
    ///
    /// Dropping the returned future is safe: before the commit starts the key
    /// is released, after it the commit finishes on its own and its outcome
    /// becomes visible through [`Engine::lookup_transfer`].
    pub async fn submit_transfer(&self, request: TransferRequest) -> Result<Transfer, EngineError> {
        let span = info_span!("transfer", key = %request.key);
        async move {
            let result = self.process(request).await;
            Self::log_result(&result);
            result
        }
        .instrument(span)
        .await
    }

    /// Create an account with an opening balance.
    pub fn create_account(
        &self,
        id: impl Into<AccountId>,
        owner_name: impl Into<String>,
        initial_balance: Amount,
    ) -> Result<Account, EngineError> {
        let account = self
            .stores
            .accounts
            .create(id.into(), owner_name.into(), initial_balance)?;
        info!(account = %account.id, balance = %account.balance, "account created");
        Ok(account)
    }

    /// Read one account under its own lock only.
    pub async fn account(&self, id: &AccountId) -> Result<Account, EngineError> {
        let _lock = self.locks.acquire(std::slice::from_ref(id)).await?;
        let account = self.stores.accounts.get(id)?;
        Ok(account)
    }

    pub async fn balance(&self, id: &AccountId) -> Result<Amount, EngineError> {
        Ok(self.account(id).await?.balance)
    }

    /// Delete an account whose balance is zero.
    ///
    /// Ledger entries that reference it are kept.
    pub async fn close_account(&self, id: &AccountId) -> Result<Account, EngineError> {
        let lock = self.locks.acquire(std::slice::from_ref(id)).await?;
        let closed = self.stores.accounts.delete(id)?;
        lock.release();
        info!(account = %closed.id, "account closed");
        Ok(closed)
    }

    /// Snapshot of every account, sorted by id.
    ///
    /// Not taken under account locks; each account is read in a consistent
    /// state but in-flight transfers may be partly reflected across accounts
    /// for stores without an atomic pair commit.
    pub fn accounts(&self) -> Result<Vec<Account>, EngineError> {
        let mut accounts = self.stores.accounts.list()?;
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    /// Sum of all balances.
    pub fn total_balance(&self) -> Result<Amount, EngineError> {
        Ok(self
            .stores
            .accounts
            .list()?
            .iter()
            .map(|account| account.balance)
            .sum())
    }

    /// Ledger entries touching `id`, oldest first.
    pub fn history(&self, id: &AccountId) -> Result<AccountHistory, EngineError> {
        self.stores.accounts.get(id)?;
        Ok(self.stores.log.list_by_account(id))
    }

    pub fn ledger_len(&self) -> Result<u64, EngineError> {
        Ok(self.stores.log.len()?)
    }

    /// The settled transfer stored under `key`, if any.
    pub fn lookup_transfer(&self, key: &TransferKey) -> Result<Option<Transfer>, EngineError> {
        Ok(self.stores.registry.lookup(key)?)
    }

    /// Every settled transfer, completed or rejected, oldest first.
    pub fn transfers(&self) -> Result<Vec<Transfer>, EngineError> {
        Ok(self.stores.registry.settled()?)
    }

    /// Settled transfers sent or received by `id`, oldest first.
    pub fn account_transfers(&self, id: &AccountId) -> Result<Vec<Transfer>, EngineError> {
        self.stores.accounts.get(id)?;
        let mut transfers = self.transfers()?;
        transfers.retain(|transfer| transfer.involves(id));
        Ok(transfers)
    }
}

/// Private API
impl Engine {
    /// Small helper to log `submit_transfer` results
    fn log_result(result: &Result<Transfer, EngineError>) {
        match result {
            Ok(transfer) => match &transfer.outcome {
                TransferOutcome::Completed(receipt) => {
                    info!(
                        from = %transfer.from,
                        to = %transfer.to,
                        amount = %transfer.amount,
                        sequence = receipt.sequence,
                        "transfer completed"
                    );
                }
                TransferOutcome::Rejected(rejection) => {
                    info!(
                        from = %transfer.from,
                        to = %transfer.to,
                        amount = %transfer.amount,
                        reason = %rejection,
                        "transfer rejected"
                    );
                }
            },
            Err(EngineError::InvariantViolation(reason)) => {
                error!(reason = %reason, "transfer aborted");
            }
            Err(err) => {
                warn!(error = %err, "transfer failed");
            }
        }
    }

    async fn process(&self, request: TransferRequest) -> Result<Transfer, EngineError> {
        // a malformed key cannot hold an outcome, so nothing is recorded
        if !request.key.is_well_formed() {
            let rejection =
                Rejection::validation(format!("malformed transfer key '{}'", request.key));
            return Ok(Transfer::rejected(request, Utc::now(), rejection));
        }

        let claim = match self
            .stores
            .registry
            .claim(&request, self.stores.config.idempotency_wait)
            .await?
        {
            Claim::Acquired(claim) => claim,
            Claim::Settled(transfer) => return Ok(transfer),
            Claim::Conflict => {
                let rejection = Rejection::new(
                    RejectionKind::Conflict,
                    format!(
                        "transfer key {} was already used for a different transfer",
                        request.key
                    ),
                );
                return Ok(Transfer::rejected(request, Utc::now(), rejection));
            }
        };

        let created_at = Utc::now();
        let (locks, source, target) = match self.prepare(&request).await {
            Ok(Ok(ready)) => ready,
            Ok(Err(rejection)) => {
                return self
                    .stores
                    .settle_rejection(claim, request, created_at, rejection)
                    .await;
            }
            Err(err) => {
                debug!(error = %err, "transfer did not start");
                self.stores.release(claim).await;
                return Err(err);
            }
        };

        let commit = self
            .stores
            .clone()
            .commit(claim, locks, request, created_at, source, target)
            .in_current_span();
        tokio::spawn(commit).await.map_err(|err| {
            EngineError::InvariantViolation(format!("commit task failed: {err}"))
        })?
    }

    /// Everything before the first mutation: check the request, lock both
    /// accounts, read them and check the source balance.
    ///
    /// A rejection is returned with the locks already released.
    async fn prepare(
        &self,
        request: &TransferRequest,
    ) -> Result<Result<(LockSet, Account, Account), Rejection>, EngineError> {
        if let Err(rejection) = request.validate() {
            return Ok(Err(rejection));
        }

        let locks = self
            .locks
            .acquire(&[request.from.clone(), request.to.clone()])
            .await?;

        let (source, target) = match self.stores.load_pair(request).await? {
            Ok(pair) => pair,
            Err(rejection) => return Ok(Err(rejection)),
        };
        if source.balance < request.amount {
            return Ok(Err(Rejection::insufficient_funds(
                &source.id,
                source.balance,
                request.amount,
            )));
        }
        Ok(Ok((locks, source, target)))
    }
}

impl Stores {
    /// Apply, log and settle a prepared transfer.
    ///
    /// `Err` never settles the key. After the balances are applied the only
    /// way out is a completion, a reversal followed by a transient error, or
    /// an invariant violation that leaves the key in flight.
    async fn commit(
        self,
        mut claim: KeyClaim,
        locks: LockSet,
        request: TransferRequest,
        created_at: DateTime<Utc>,
        source: Account,
        target: Account,
    ) -> Result<Transfer, EngineError> {
        let applied = self
            .with_retries("apply transfer", || {
                self.accounts
                    .apply_pair(&request.from, &request.to, request.amount)
            })
            .await;
        let (debited, credited) = match applied {
            Ok(pair) => pair,
            Err(err) => {
                // the store guarantees nothing was mutated
                if let Some(rejection) = Self::rejection_for(&err) {
                    warn!(error = %err, "account changed while locked");
                    locks.release();
                    return self
                        .settle_rejection(claim, request, created_at, rejection)
                        .await;
                }
                return match Self::store_failure(err) {
                    err @ EngineError::Transient(_) => {
                        self.release(claim).await;
                        Err(err)
                    }
                    err => {
                        claim.keep();
                        Err(err)
                    }
                };
            }
        };

        let posting = Posting {
            transfer_key: request.key.clone(),
            amount: request.amount,
            debit: BalanceChange {
                account: request.from.clone(),
                before: source.balance,
                after: debited.balance,
            },
            credit: BalanceChange {
                account: request.to.clone(),
                before: target.balance,
                after: credited.balance,
            },
            committed_at: Utc::now(),
        };
        if !posting.is_balanced() || debited.balance.is_negative() || credited.balance.is_negative()
        {
            error!(?posting, "applied transfer is unbalanced");
            claim.keep();
            return Err(EngineError::InvariantViolation(format!(
                "transfer {} produced unbalanced balances",
                request.key
            )));
        }

        let appended = self
            .with_retries("append ledger entry", || self.log.append(posting.clone()))
            .await;
        let sequence = match appended {
            Ok(sequence) => sequence,
            Err(err) => {
                warn!(error = %err, "ledger append failed, reversing balances");
                let reversed = self
                    .with_retries("reverse transfer", || {
                        self.accounts
                            .apply_pair(&request.to, &request.from, request.amount)
                    })
                    .await;
                if let Err(undo) = reversed {
                    claim.keep();
                    return Err(EngineError::InvariantViolation(format!(
                        "transfer {} was applied but neither logged nor reversed: {undo}",
                        request.key
                    )));
                }
                self.release(claim).await;
                return Err(err.into());
            }
        };

        let receipt = Receipt {
            sequence,
            from_balance: debited.balance,
            to_balance: credited.balance,
        };
        let transfer = Transfer::completed(request, created_at, receipt);
        let settled = self
            .with_retries("settle transfer", || claim.settle(&transfer))
            .await;
        locks.release();

        if let Err(err) = settled {
            // committed regardless; the key stays in flight until the outcome lands
            warn!(error = %err, sequence, "completed transfer not settled yet, retrying in background");
            claim.keep();
            self.settle_in_background(transfer.clone());
        }
        Ok(transfer)
    }

    /// Keep storing `transfer` as its key's outcome until the store takes it.
    fn settle_in_background(&self, transfer: Transfer) {
        let registry = self.registry.clone();
        let backoff = self.config.retry_backoff;
        let settle = async move {
            let mut attempt: u32 = 1;
            loop {
                tokio::time::sleep(backoff.saturating_mul(attempt).min(SETTLE_BACKOFF_CAP)).await;
                match registry.finalize(&transfer) {
                    Ok(()) => {
                        info!(attempt, "completed transfer settled");
                        return;
                    }
                    Err(err) if attempt == 1 => {
                        warn!(error = %err, "completed transfer still not settled");
                    }
                    Err(err) => debug!(attempt, error = %err, "settle attempt failed"),
                }
                attempt = attempt.saturating_add(1);
            }
        };
        tokio::spawn(settle.in_current_span());
    }

    /// Read both accounts of `request`; a missing one is a rejection.
    async fn load_pair(
        &self,
        request: &TransferRequest,
    ) -> Result<Result<(Account, Account), Rejection>, EngineError> {
        let source = match self.load(&request.from).await? {
            Some(account) => account,
            None => return Ok(Err(Rejection::not_found(&request.from))),
        };
        let target = match self.load(&request.to).await? {
            Some(account) => account,
            None => return Ok(Err(Rejection::not_found(&request.to))),
        };
        Ok(Ok((source, target)))
    }

    async fn load(&self, id: &AccountId) -> Result<Option<Account>, EngineError> {
        match self.with_retries("load account", || self.accounts.get(id)).await {
            Ok(account) => Ok(Some(account)),
            Err(AccountError::NotFound(_)) => Ok(None),
            Err(err) => Err(Self::store_failure(err)),
        }
    }

    /// Record a rejection as the key's outcome. Callers release locks first.
    ///
    /// If the rejection cannot be stored the key is released instead and the
    /// storage failure is returned.
    async fn settle_rejection(
        &self,
        mut claim: KeyClaim,
        request: TransferRequest,
        created_at: DateTime<Utc>,
        rejection: Rejection,
    ) -> Result<Transfer, EngineError> {
        let transfer = Transfer::rejected(request, created_at, rejection);
        let settled = self
            .with_retries("settle rejection", || claim.settle(&transfer))
            .await;
        match settled {
            Ok(()) => Ok(transfer),
            Err(err) => {
                self.release(claim).await;
                Err(err.into())
            }
        }
    }

    /// Give the key back so the same request can run again.
    async fn release(&self, mut claim: KeyClaim) {
        debug!(key = %claim.key(), "releasing transfer key for retry");
        if let Err(err) = self
            .with_retries("release transfer key", || claim.release())
            .await
        {
            // dropping the claim makes one last attempt
            error!(error = %err, "transfer key could not be released");
        }
    }

    fn rejection_for(err: &AccountError) -> Option<Rejection> {
        match err {
            AccountError::NotFound(id) => Some(Rejection::not_found(id)),
            AccountError::InsufficientFunds {
                account,
                balance,
                requested,
            } => Some(Rejection::insufficient_funds(account, *balance, *requested)),
            AccountError::Overflow(id) => Some(Rejection::validation(format!(
                "balance of account {id} would overflow"
            ))),
            _ => None,
        }
    }

    /// Storage errors stay transient; anything else from the store at this
    /// point means the store broke its contract.
    fn store_failure(err: AccountError) -> EngineError {
        match err {
            AccountError::Storage(err) => err.into(),
            other => EngineError::InvariantViolation(other.to_string()),
        }
    }

    /// Call `op` until it succeeds, fails permanently, or runs out of attempts.
    async fn with_retries<T, E>(
        &self,
        operation: &'static str,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: Retryable + Display,
    {
        let mut attempt: u32 = 1;
        loop {
            match op() {
                Err(err) if err.is_retryable() && attempt < self.config.storage_retries => {
                    warn!(operation, attempt, error = %err, "storage call failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
