//! Balance ledger contract and the in-memory reference implementation.
//!
//! The ledger is the sole globally-shared mutable resource: it serializes
//! per-actor mutations and enforces per-key at-most-once application. The
//! orchestrator never compensates for ledger races on its own; a rejected
//! debit is surfaced, never retried blindly.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::types::{
    Actor, ActorId, ChannelId, IdempotencyKey, JobId, Locale, Operation, OperationKind,
    OperationStatus, level_for_income,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LedgerError {
    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: Decimal, required: Decimal },

    #[error("unknown actor {0}")]
    UnknownActor(ActorId),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Point-in-time view of an actor's account after (or without) a mutation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceSnapshot {
    pub actor: ActorId,
    pub balance: Decimal,
    pub level: u32,
}

/// Atomic debit/credit/read of actor balances.
///
/// Implementations must serialize concurrent mutations per actor, reject any
/// debit that would drive a balance negative, and apply each idempotency key
/// at most once: a repeated key returns the snapshot of the first application
/// without mutating anything.
#[async_trait]
pub trait BalanceLedger: Send + Sync + std::fmt::Debug {
    async fn debit(
        &self,
        actor: ActorId,
        amount: Decimal,
        reason: &str,
        channel: Option<ChannelId>,
        key: &IdempotencyKey,
    ) -> Result<BalanceSnapshot, LedgerError>;

    async fn credit(
        &self,
        actor: ActorId,
        amount: Decimal,
        reason: &str,
        channel: Option<ChannelId>,
        key: &IdempotencyKey,
    ) -> Result<BalanceSnapshot, LedgerError>;

    async fn balance(&self, actor: ActorId) -> Result<BalanceSnapshot, LedgerError>;
}

#[derive(Debug)]
struct Account {
    balance: Decimal,
    level: u32,
    lifetime_income: Decimal,
    locale: Locale,
}

/// In-memory ledger: per-actor entry locking makes check-and-mutate atomic,
/// an append-only journal keeps the balance invariant auditable.
///
/// Production deployments put a transactional store behind [`BalanceLedger`]
/// instead; tests and single-process setups use this directly.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    accounts: DashMap<ActorId, Account>,
    applied: DashMap<IdempotencyKey, BalanceSnapshot>,
    journal: Mutex<Vec<Operation>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the actor on first contact with a zero balance. Idempotent.
    pub fn register(&self, actor: ActorId, locale: Locale) -> BalanceSnapshot {
        let entry = self.accounts.entry(actor).or_insert_with(|| Account {
            balance: Decimal::ZERO,
            level: 0,
            lifetime_income: Decimal::ZERO,
            locale,
        });
        BalanceSnapshot {
            actor,
            balance: entry.balance,
            level: entry.level,
        }
    }

    /// Register with an opening balance. Test and bootstrap convenience.
    pub fn register_with_balance(
        &self,
        actor: ActorId,
        locale: Locale,
        balance: Decimal,
    ) -> BalanceSnapshot {
        self.register(actor, locale);
        if let Some(mut account) = self.accounts.get_mut(&actor) {
            account.balance = balance;
        }
        self.snapshot(actor).expect("actor just registered")
    }

    pub fn actor(&self, actor: ActorId) -> Option<Actor> {
        self.accounts.get(&actor).map(|a| Actor {
            id: actor,
            balance: a.balance,
            level: a.level,
            locale: a.locale,
        })
    }

    /// Full journal copy, oldest first.
    pub fn operations(&self) -> Vec<Operation> {
        self.journal.lock().expect("journal lock").clone()
    }

    /// Completed operations recorded for one job.
    pub fn operations_for_job(&self, job: JobId) -> Vec<Operation> {
        self.operations()
            .into_iter()
            .filter(|op| op.job == Some(job))
            .collect()
    }

    fn snapshot(&self, actor: ActorId) -> Result<BalanceSnapshot, LedgerError> {
        self.accounts
            .get(&actor)
            .map(|a| BalanceSnapshot {
                actor,
                balance: a.balance,
                level: a.level,
            })
            .ok_or(LedgerError::UnknownActor(actor))
    }

    fn record(
        &self,
        actor: ActorId,
        kind: OperationKind,
        amount: Decimal,
        status: OperationStatus,
        reason: &str,
        channel: Option<ChannelId>,
        key: &IdempotencyKey,
    ) {
        let job = Self::job_of(key);
        self.journal.lock().expect("journal lock").push(Operation {
            key: key.clone(),
            kind,
            amount,
            status,
            actor,
            job,
            at: Utc::now(),
            channel,
            reason: reason.to_string(),
        });
    }

    fn job_of(key: &IdempotencyKey) -> Option<JobId> {
        let raw = key.as_str().strip_prefix("job:")?;
        let (id, _) = raw.split_once(':')?;
        id.parse().ok().map(JobId::from_uuid)
    }
}

#[async_trait]
impl BalanceLedger for MemoryLedger {
    async fn debit(
        &self,
        actor: ActorId,
        amount: Decimal,
        reason: &str,
        channel: Option<ChannelId>,
        key: &IdempotencyKey,
    ) -> Result<BalanceSnapshot, LedgerError> {
        // The entry's shard write lock serializes concurrent mutations on this
        // actor; the replay check happens under the same lock.
        let mut account = self
            .accounts
            .get_mut(&actor)
            .ok_or(LedgerError::UnknownActor(actor))?;

        if let Some(prior) = self.applied.get(key) {
            debug!(%actor, %key, "debit replayed, returning first application");
            return Ok(*prior);
        }

        if account.balance < amount {
            let balance = account.balance;
            drop(account);
            self.record(
                actor,
                OperationKind::Outcome,
                amount,
                OperationStatus::Failed,
                reason,
                channel,
                key,
            );
            return Err(LedgerError::InsufficientFunds {
                balance,
                required: amount,
            });
        }

        account.balance -= amount;
        let snapshot = BalanceSnapshot {
            actor,
            balance: account.balance,
            level: account.level,
        };
        self.applied.insert(key.clone(), snapshot);
        drop(account);

        self.record(
            actor,
            OperationKind::Outcome,
            amount,
            OperationStatus::Completed,
            reason,
            channel,
            key,
        );
        debug!(%actor, %amount, %key, "debit applied");
        Ok(snapshot)
    }

    async fn credit(
        &self,
        actor: ActorId,
        amount: Decimal,
        reason: &str,
        channel: Option<ChannelId>,
        key: &IdempotencyKey,
    ) -> Result<BalanceSnapshot, LedgerError> {
        let mut account = self
            .accounts
            .get_mut(&actor)
            .ok_or(LedgerError::UnknownActor(actor))?;

        if let Some(prior) = self.applied.get(key) {
            debug!(%actor, %key, "credit replayed, returning first application");
            return Ok(*prior);
        }

        account.balance += amount;
        account.lifetime_income += amount;
        let level = level_for_income(account.lifetime_income);
        if level > account.level {
            account.level = level;
        }
        let snapshot = BalanceSnapshot {
            actor,
            balance: account.balance,
            level: account.level,
        };
        self.applied.insert(key.clone(), snapshot);
        drop(account);

        self.record(
            actor,
            OperationKind::Income,
            amount,
            OperationStatus::Completed,
            reason,
            channel,
            key,
        );
        debug!(%actor, %amount, %key, "credit applied");
        Ok(snapshot)
    }

    async fn balance(&self, actor: ActorId) -> Result<BalanceSnapshot, LedgerError> {
        self.snapshot(actor)
    }
}
