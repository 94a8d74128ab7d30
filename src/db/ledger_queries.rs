use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::db::{parse_enum, StoreError};
use crate::models::credit::{CreditHold, CreditTransaction, TransactionType};

const TRANSACTION_COLUMNS: &str = "id, user_id, type, amount, reason, created_at";
const HOLD_COLUMNS: &str =
    "id, user_id, debit_transaction_id, amount, reason, state, created_at, resolved_at";

fn transaction_from_row(row: &PgRow) -> Result<CreditTransaction, sqlx::Error> {
    let kind: String = row.try_get("type")?;
    Ok(CreditTransaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: parse_enum(&kind)?,
        amount: row.try_get("amount")?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn hold_from_row(row: &PgRow) -> Result<CreditHold, sqlx::Error> {
    let state: String = row.try_get("state")?;
    Ok(CreditHold {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        debit_transaction_id: row.try_get("debit_transaction_id")?,
        amount: row.try_get("amount")?,
        reason: row.try_get("reason")?,
        state: parse_enum(&state)?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

/// Serialize ledger writes for one user until the surrounding transaction ends.
async fn lock_user(conn: &mut PgConnection, user_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
        .bind(user_id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn balance_on(conn: &mut PgConnection, user_id: Uuid) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(amount), 0)::BIGINT AS balance FROM credit_transactions WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_one(conn)
    .await?;
    row.try_get("balance")
}

async fn insert_transaction(
    conn: &mut PgConnection,
    user_id: Uuid,
    kind: TransactionType,
    amount: i64,
    reason: &str,
) -> Result<CreditTransaction, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO credit_transactions (user_id, type, amount, reason)
        VALUES ($1, $2, $3, $4)
        RETURNING {TRANSACTION_COLUMNS}
        "#
    ))
    .bind(user_id)
    .bind(kind.to_string())
    .bind(amount)
    .bind(reason)
    .fetch_one(conn)
    .await?;

    transaction_from_row(&row)
}

/// Current balance (sum of all ledger rows) of a user.
pub async fn get_balance(pool: &PgPool, user_id: Uuid) -> Result<i64, StoreError> {
    let mut conn = pool.acquire().await?;
    Ok(balance_on(&mut conn, user_id).await?)
}

/// Append a CONSUMPTION row of `-amount` together with its pending hold.
///
/// Refuses the debit when the balance does not cover it, unless
/// `allow_overdraft` is set.
pub async fn debit(
    pool: &PgPool,
    user_id: Uuid,
    amount: i64,
    reason: &str,
    allow_overdraft: bool,
) -> Result<(CreditTransaction, CreditHold), StoreError> {
    let mut tx = pool.begin().await?;
    lock_user(&mut tx, user_id).await?;

    let balance = balance_on(&mut tx, user_id).await?;
    if !allow_overdraft && balance < amount {
        return Err(StoreError::InsufficientCredits {
            balance,
            required: amount,
        });
    }

    let debit = insert_transaction(&mut tx, user_id, TransactionType::Consumption, -amount, reason).await?;

    let row = sqlx::query(&format!(
        r#"
        INSERT INTO credit_holds (user_id, debit_transaction_id, amount, reason, state)
        VALUES ($1, $2, $3, $4, 'PENDING')
        RETURNING {HOLD_COLUMNS}
        "#
    ))
    .bind(user_id)
    .bind(debit.id)
    .bind(amount)
    .bind(reason)
    .fetch_one(&mut *tx)
    .await?;
    let hold = hold_from_row(&row)?;

    tx.commit().await?;
    Ok((debit, hold))
}

/// Mark a pending hold as settled; the debit stands.
pub async fn settle_hold(pool: &PgPool, hold_id: Uuid) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE credit_holds
        SET state = 'SETTLED', resolved_at = NOW()
        WHERE id = $1 AND state = 'PENDING'
        "#,
    )
    .bind(hold_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!("hold {hold_id} is not pending")));
    }
    Ok(())
}

/// Append the compensating REFUND row and resolve the hold in one transaction.
pub async fn refund_hold(
    pool: &PgPool,
    hold_id: Uuid,
    reason: &str,
) -> Result<CreditTransaction, StoreError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        UPDATE credit_holds
        SET state = 'REFUNDED', resolved_at = NOW()
        WHERE id = $1 AND state = 'PENDING'
        RETURNING user_id, amount
        "#,
    )
    .bind(hold_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| StoreError::Conflict(format!("hold {hold_id} is not pending")))?;

    let user_id: Uuid = row.try_get("user_id")?;
    let amount: i64 = row.try_get("amount")?;

    let refund = insert_transaction(&mut tx, user_id, TransactionType::Refund, amount, reason).await?;
    tx.commit().await?;
    Ok(refund)
}

/// Holds still pending that were created before `before`.
pub async fn stale_holds(pool: &PgPool, before: DateTime<Utc>) -> Result<Vec<CreditHold>, StoreError> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {HOLD_COLUMNS}
        FROM credit_holds
        WHERE state = 'PENDING' AND created_at < $1
        ORDER BY created_at ASC
        "#
    ))
    .bind(before)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(hold_from_row).collect::<Result<_, _>>()?)
}

/// Append a grant unless the user already has a row with the same reason.
pub async fn grant_once(
    pool: &PgPool,
    user_id: Uuid,
    kind: TransactionType,
    amount: i64,
    reason: &str,
) -> Result<Option<CreditTransaction>, StoreError> {
    let mut tx = pool.begin().await?;
    lock_user(&mut tx, user_id).await?;

    let existing = sqlx::query("SELECT 1 FROM credit_transactions WHERE user_id = $1 AND reason = $2 LIMIT 1")
        .bind(user_id)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await?;
    if existing.is_some() {
        return Ok(None);
    }

    let grant = insert_transaction(&mut tx, user_id, kind, amount, reason).await?;
    tx.commit().await?;
    Ok(Some(grant))
}

/// Full ledger of a user, oldest first.
pub async fn list_transactions(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Vec<CreditTransaction>, StoreError> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {TRANSACTION_COLUMNS}
        FROM credit_transactions
        WHERE user_id = $1
        ORDER BY created_at ASC, seq ASC
        "#
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(transaction_from_row).collect::<Result<_, _>>()?)
}

/// Users eligible for allowances and snapshots.
pub async fn active_user_ids(pool: &PgPool) -> Result<Vec<Uuid>, StoreError> {
    let rows = sqlx::query("SELECT id FROM users WHERE is_active ORDER BY created_at ASC")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|r| r.try_get("id"))
        .collect::<Result<_, _>>()?)
}

/// Record the balance of every active user for `period`. Existing snapshots
/// for the period are left untouched. Returns the number of rows written.
pub async fn snapshot_balances(pool: &PgPool, period: &str) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO credit_balance_snapshots (user_id, period, balance)
        SELECT u.id, $1, COALESCE(SUM(t.amount), 0)::BIGINT
        FROM users u
        LEFT JOIN credit_transactions t ON t.user_id = u.id
        WHERE u.is_active
        GROUP BY u.id
        ON CONFLICT (user_id, period) DO NOTHING
        "#,
    )
    .bind(period)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
