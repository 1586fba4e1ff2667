//! Core domain types for the ledger engine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::Amount;

/// Externally assigned account identifier.
///
/// Ordered lexicographically; that order is the global lock order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccountId(String);

impl AccountId {
    pub const MAX_LEN: usize = 50;

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Non-empty, bounded, and free of whitespace and control characters.
    pub fn is_well_formed(&self) -> bool {
        is_token(&self.0, Self::MAX_LEN)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Caller-supplied idempotency token, one per logical transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferKey(String);

impl TransferKey {
    pub const MAX_LEN: usize = 100;

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Generate a fresh key for callers that did not supply one.
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_micros();
        Self(format!("tx-{now:x}-{n:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        is_token(&self.0, Self::MAX_LEN)
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransferKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for TransferKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

fn is_token(s: &str, max_len: usize) -> bool {
    !s.is_empty()
        && s.chars().count() <= max_len
        && !s.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// An account and its current balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub owner_name: String,
    pub balance: Amount,
    /// Incremented on every successful mutation.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
}

/// A request to move `amount` from `from` to `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub key: TransferKey,
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
    pub description: Option<String>,
}

impl TransferRequest {
    pub const MAX_DESCRIPTION_LEN: usize = 500;

    pub fn new(
        key: impl Into<TransferKey>,
        from: impl Into<AccountId>,
        to: impl Into<AccountId>,
        amount: Amount,
    ) -> Self {
        Self {
            key: key.into(),
            from: from.into(),
            to: to.into(),
            amount,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether `other` asks for the same movement of money.
    pub fn same_parameters(&self, other: &TransferRequest) -> bool {
        self.from == other.from && self.to == other.to && self.amount == other.amount
    }

    /// Structural checks that need no account state.
    pub fn validate(&self) -> Result<(), Rejection> {
        if !self.key.is_well_formed() {
            return Err(Rejection::validation(format!(
                "malformed transfer key '{}'",
                self.key
            )));
        }
        if !self.amount.is_positive() {
            return Err(Rejection::validation(format!(
                "amount must be positive (got {})",
                self.amount
            )));
        }
        for id in [&self.from, &self.to] {
            if !id.is_well_formed() {
                return Err(Rejection::validation(format!("malformed account id '{id}'")));
            }
        }
        if self.from == self.to {
            return Err(Rejection::validation("cannot transfer to the same account"));
        }
        if let Some(description) = &self.description {
            if description.chars().count() > Self::MAX_DESCRIPTION_LEN {
                return Err(Rejection::validation(format!(
                    "description exceeds {} characters",
                    Self::MAX_DESCRIPTION_LEN
                )));
            }
        }
        Ok(())
    }
}

/// Externally visible status of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Only ever held by an idempotency placeholder while the first attempt runs.
    Pending,
    Completed,
    Rejected,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Pending => f.write_str("pending"),
            TransferStatus::Completed => f.write_str("completed"),
            TransferStatus::Rejected => f.write_str("rejected"),
        }
    }
}

/// Category of a caller-visible rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Malformed amount, identifiers or description, or a same-account transfer.
    Validation,
    /// One of the accounts does not exist.
    NotFound,
    /// The source balance is lower than the amount.
    InsufficientFunds,
    /// The key was already used for a different transfer.
    Conflict,
}

/// Why a transfer was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub reason: String,
}

impl Rejection {
    pub fn new(kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::new(RejectionKind::Validation, reason)
    }

    pub fn not_found(account: &AccountId) -> Self {
        Self::new(
            RejectionKind::NotFound,
            format!("account {account} not found"),
        )
    }

    pub fn insufficient_funds(account: &AccountId, balance: Amount, requested: Amount) -> Self {
        Self::new(
            RejectionKind::InsufficientFunds,
            format!("insufficient funds in account {account}: balance {balance}, requested {requested}"),
        )
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Result of a committed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Sequence number of the ledger entry.
    pub sequence: u64,
    pub from_balance: Amount,
    pub to_balance: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed(Receipt),
    Rejected(Rejection),
}

/// A transfer in a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub key: TransferKey,
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
    pub description: Option<String>,
    /// When the attempt that settled this transfer started.
    pub created_at: DateTime<Utc>,
    pub outcome: TransferOutcome,
}

impl Transfer {
    pub fn completed(request: TransferRequest, created_at: DateTime<Utc>, receipt: Receipt) -> Self {
        Self::settle(request, created_at, TransferOutcome::Completed(receipt))
    }

    pub fn rejected(
        request: TransferRequest,
        created_at: DateTime<Utc>,
        rejection: Rejection,
    ) -> Self {
        Self::settle(request, created_at, TransferOutcome::Rejected(rejection))
    }

    fn settle(request: TransferRequest, created_at: DateTime<Utc>, outcome: TransferOutcome) -> Self {
        Self {
            key: request.key,
            from: request.from,
            to: request.to,
            amount: request.amount,
            description: request.description,
            created_at,
            outcome,
        }
    }

    pub fn status(&self) -> TransferStatus {
        match self.outcome {
            TransferOutcome::Completed(_) => TransferStatus::Completed,
            TransferOutcome::Rejected(_) => TransferStatus::Rejected,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status() == TransferStatus::Completed
    }

    pub fn receipt(&self) -> Option<&Receipt> {
        match &self.outcome {
            TransferOutcome::Completed(receipt) => Some(receipt),
            TransferOutcome::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match &self.outcome {
            TransferOutcome::Completed(_) => None,
            TransferOutcome::Rejected(rejection) => Some(rejection),
        }
    }

    /// Whether this transfer was settled for the same movement `request` asks for.
    pub fn matches(&self, request: &TransferRequest) -> bool {
        self.from == request.from && self.to == request.to && self.amount == request.amount
    }

    /// Whether `account` sends or receives this transfer.
    pub fn involves(&self, account: &AccountId) -> bool {
        &self.from == account || &self.to == account
    }
}

/// Balance of one account before and after a posting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceChange {
    pub account: AccountId,
    pub before: Amount,
    pub after: Amount,
}

/// The double-entry record of one completed transfer, before it is sequenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub transfer_key: TransferKey,
    pub amount: Amount,
    pub debit: BalanceChange,
    pub credit: BalanceChange,
    pub committed_at: DateTime<Utc>,
}

impl Posting {
    /// The debit side lost exactly `amount` and the credit side gained it.
    pub fn is_balanced(&self) -> bool {
        self.debit.before.checked_sub(self.debit.after) == Some(self.amount)
            && self.credit.after.checked_sub(self.credit.before) == Some(self.amount)
    }

    pub fn touches(&self, account: &AccountId) -> bool {
        self.debit.account == *account || self.credit.account == *account
    }
}

/// An immutable, sequenced entry of the transaction log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub sequence: u64,
    pub posting: Posting,
}
