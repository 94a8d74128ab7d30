//! Credit ledger guard: funded operations debit up front and are refunded
//! when they fail.

use chrono::{Datelike, Duration, NaiveDate, Utc};
use metrics::counter;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::store::LedgerStore;
use crate::db::StoreError;
use crate::models::credit::{refund_reason, TransactionType};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct GrantSummary {
    pub granted: u64,
    pub already_granted: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub refunded: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    /// Accounts allowed to go negative, such as the platform account that
    /// funds scheduled catalog generation.
    overdraft_accounts: HashSet<Uuid>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            overdraft_accounts: HashSet::new(),
        }
    }

    pub fn with_overdraft_account(mut self, user_id: Uuid) -> Self {
        self.overdraft_accounts.insert(user_id);
        self
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<i64, LedgerError> {
        Ok(self.store.balance(user_id).await?)
    }

    /// Run `operation` paid with `cost` credits.
    ///
    /// The debit and its hold are written before the operation starts. If the
    /// operation fails the cost is refunded and the operation's error returned;
    /// a failed refund is logged and leaves the hold for
    /// [`CreditLedger::reconcile_stale_holds`].
    pub async fn with_credits<T, E, F, Fut>(
        &self,
        user_id: Uuid,
        cost: i64,
        reason: &str,
        operation: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if cost <= 0 {
            return Err(GuardError::InvalidCost(cost));
        }

        let allow_overdraft = self.overdraft_accounts.contains(&user_id);
        let (debit, hold) = match self.store.debit(user_id, cost, reason, allow_overdraft).await {
            Ok(written) => written,
            Err(StoreError::InsufficientCredits { balance, required }) => {
                info!(%user_id, balance, required, reason, "Debit refused, insufficient credits");
                return Err(GuardError::InsufficientCredits { balance, required });
            }
            Err(e) => return Err(GuardError::Debit(e)),
        };
        info!(%user_id, cost, reason, debit_id = %debit.id, hold_id = %hold.id, "Credits debited");

        match operation().await {
            Ok(value) => {
                if let Err(e) = self.store.settle_hold(hold.id).await {
                    warn!(%user_id, hold_id = %hold.id, error = %e, "Failed to settle credit hold");
                }
                Ok(value)
            }
            Err(op_err) => {
                let refund = refund_reason(reason);
                match self.store.refund_hold(hold.id, &refund).await {
                    Ok(tx) => {
                        counter!("credits_refunded_total").increment(cost as u64);
                        info!(%user_id, cost, refund_id = %tx.id, error = %op_err, "Operation failed, credits refunded");
                    }
                    Err(e) => {
                        error!(
                            %user_id,
                            cost,
                            hold_id = %hold.id,
                            operation_error = %op_err,
                            error = %e,
                            "Refund failed, hold left pending for reconciliation"
                        );
                    }
                }
                Err(GuardError::Operation(op_err))
            }
        }
    }

    /// One `SYSTEM_REWARD` of `amount` per active user for `day`. Safe to run
    /// more than once for the same day.
    pub async fn grant_daily_allowance(&self, amount: i64, day: NaiveDate) -> Result<GrantSummary, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let reason = format!("daily allowance {day}");
        let mut summary = GrantSummary::default();
        for user_id in self.store.active_user_ids().await? {
            match self
                .store
                .grant_once(user_id, TransactionType::SystemReward, amount, &reason)
                .await?
            {
                Some(_) => summary.granted += 1,
                None => summary.already_granted += 1,
            }
        }

        info!(%day, amount, granted = summary.granted, skipped = summary.already_granted, "Daily allowance granted");
        Ok(summary)
    }

    /// Signup credits, granted at most once per user.
    pub async fn grant_initial(&self, user_id: Uuid, amount: i64) -> Result<bool, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let granted = self
            .store
            .grant_once(user_id, TransactionType::GrantInitial, amount, "initial grant")
            .await?;
        Ok(granted.is_some())
    }

    /// Record every active user's balance for `period` (`YYYY-MM`).
    pub async fn snapshot_balances(&self, period: &str) -> Result<u64, LedgerError> {
        validate_period(period)?;
        let written = self.store.snapshot_balances(period).await?;
        info!(period, written, "Credit balances snapshotted");
        Ok(written)
    }

    /// Refund holds still pending after `older_than`, left behind by a process
    /// that died between debit and resolution.
    pub async fn reconcile_stale_holds(&self, older_than: Duration) -> Result<ReconcileSummary, LedgerError> {
        let cutoff = Utc::now() - older_than;
        let mut summary = ReconcileSummary::default();

        for hold in self.store.stale_holds(cutoff).await? {
            match self.store.refund_hold(hold.id, &refund_reason(&hold.reason)).await {
                Ok(_) => {
                    counter!("credits_refunded_total").increment(hold.amount as u64);
                    warn!(user_id = %hold.user_id, hold_id = %hold.id, amount = hold.amount, "Stale credit hold refunded");
                    summary.refunded += 1;
                }
                // Resolved concurrently by its owner.
                Err(StoreError::Conflict(_)) => {}
                Err(e) => {
                    error!(hold_id = %hold.id, error = %e, "Failed to refund stale credit hold");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}

/// `YYYY-MM` of the month before the one containing `day`.
pub fn previous_period(day: NaiveDate) -> String {
    let (year, month) = if day.month() == 1 {
        (day.year() - 1, 12)
    } else {
        (day.year(), day.month() - 1)
    };
    format!("{year:04}-{month:02}")
}

fn validate_period(period: &str) -> Result<(), LedgerError> {
    NaiveDate::parse_from_str(&format!("{period}-01"), "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| LedgerError::InvalidPeriod(period.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError<E> {
    #[error("Insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("Invalid cost: {0}")]
    InvalidCost(i64),

    #[error("Failed to debit credits: {0}")]
    Debit(StoreError),

    #[error("{0}")]
    Operation(E),
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Invalid period '{0}', expected YYYY-MM")]
    InvalidPeriod(String),
}
