use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::StoreError;
use crate::models::batch::BatchGenerationLog;

const LOG_COLUMNS: &str = "id, scheduled_at, executed_at, completed_at, target_count, \
     success_count, failure_count, duration_ms, error_message";

fn log_from_row(row: &PgRow) -> Result<BatchGenerationLog, sqlx::Error> {
    Ok(BatchGenerationLog {
        id: row.try_get("id")?,
        scheduled_at: row.try_get("scheduled_at")?,
        executed_at: row.try_get("executed_at")?,
        completed_at: row.try_get("completed_at")?,
        target_count: row.try_get("target_count")?,
        success_count: row.try_get("success_count")?,
        failure_count: row.try_get("failure_count")?,
        duration_ms: row.try_get("duration_ms")?,
        error_message: row.try_get("error_message")?,
    })
}

/// Open a log row for a run that starts now.
pub async fn create_log(
    pool: &PgPool,
    scheduled_at: DateTime<Utc>,
    target_count: i32,
) -> Result<BatchGenerationLog, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO batch_generation_logs (scheduled_at, executed_at, target_count)
        VALUES ($1, NOW(), $2)
        RETURNING {LOG_COLUMNS}
        "#
    ))
    .bind(scheduled_at)
    .bind(target_count)
    .fetch_one(pool)
    .await?;

    Ok(log_from_row(&row)?)
}

/// Close a log row with the run's counts.
pub async fn finish_log(
    pool: &PgPool,
    log_id: Uuid,
    success_count: i32,
    failure_count: i32,
    duration_ms: i64,
    error_message: Option<&str>,
) -> Result<BatchGenerationLog, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE batch_generation_logs
        SET completed_at = NOW(),
            success_count = $2,
            failure_count = $3,
            duration_ms = $4,
            error_message = $5
        WHERE id = $1
        RETURNING {LOG_COLUMNS}
        "#
    ))
    .bind(log_id)
    .bind(success_count)
    .bind(failure_count)
    .bind(duration_ms)
    .bind(error_message)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("batch generation log {log_id}")))?;

    Ok(log_from_row(&row)?)
}

/// Successful generations of runs scheduled in `[from, to)`.
pub async fn successes_scheduled_between(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(SUM(success_count), 0)::BIGINT AS total
        FROM batch_generation_logs
        WHERE scheduled_at >= $1 AND scheduled_at < $2
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_one(pool)
    .await?;

    Ok(row.try_get("total")?)
}

/// Logs of runs scheduled in `[from, to)`, oldest first.
pub async fn logs_scheduled_between(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<BatchGenerationLog>, StoreError> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {LOG_COLUMNS}
        FROM batch_generation_logs
        WHERE scheduled_at >= $1 AND scheduled_at < $2
        ORDER BY scheduled_at ASC
        "#
    ))
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(log_from_row).collect::<Result<_, _>>()?)
}
