use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Consumption,
    Refund,
    GrantInitial,
    SystemReward,
}

/// One append-only ledger row. Balance is the sum of `amount` per user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: TransactionType,
    pub amount: i64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldState {
    Pending,
    Settled,
    Refunded,
}

/// Write-ahead record of a debit whose funded operation has not resolved yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditHold {
    pub id: Uuid,
    pub user_id: Uuid,
    pub debit_transaction_id: Uuid,
    pub amount: i64,
    pub reason: String,
    pub state: HoldState,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Reason attached to the refund of a debit made for `reason`.
pub fn refund_reason(reason: &str) -> String {
    format!("refund: {reason}")
}
