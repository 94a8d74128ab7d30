use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::{parse_enum, StoreError};
use crate::models::curation::{CuratedImageItem, CurationDecision, SourceImage};

const ITEM_COLUMNS: &str = "id, source_url, source_id, status, quality_score, gender, species, \
     rejection_reason, generated_character_id, created_at, approved_at, claimed_at";

fn item_from_row(row: &PgRow) -> Result<CuratedImageItem, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(CuratedImageItem {
        id: row.try_get("id")?,
        source_url: row.try_get("source_url")?,
        source_id: row.try_get("source_id")?,
        status: parse_enum(&status)?,
        quality_score: row.try_get("quality_score")?,
        gender: row.try_get("gender")?,
        species: row.try_get("species")?,
        rejection_reason: row.try_get("rejection_reason")?,
        generated_character_id: row.try_get("generated_character_id")?,
        created_at: row.try_get("created_at")?,
        approved_at: row.try_get("approved_at")?,
        claimed_at: row.try_get("claimed_at")?,
    })
}

/// Insert candidates as PENDING items. URLs already known (or repeated within
/// the batch) are skipped; only newly inserted items are returned.
pub async fn insert_candidates(
    pool: &PgPool,
    candidates: &[SourceImage],
) -> Result<Vec<CuratedImageItem>, StoreError> {
    let mut tx = pool.begin().await?;
    let mut inserted = Vec::new();

    for candidate in candidates {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO curated_images (source_url, source_id, status)
            VALUES ($1, $2, 'PENDING')
            ON CONFLICT (source_url) DO NOTHING
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(&candidate.url)
        .bind(&candidate.source_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = row {
            inserted.push(item_from_row(&row)?);
        }
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Pending items in insertion order. `None` returns every pending item.
pub async fn pending_items(
    pool: &PgPool,
    limit: Option<usize>,
) -> Result<Vec<CuratedImageItem>, StoreError> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {ITEM_COLUMNS}
        FROM curated_images
        WHERE status = 'PENDING'
        ORDER BY seq ASC
        LIMIT $1
        "#
    ))
    .bind(limit.map(|l| l as i64))
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(item_from_row).collect::<Result<_, _>>()?)
}

/// Write the curation decision for a still-pending item.
pub async fn record_decision(
    pool: &PgPool,
    item_id: Uuid,
    decision: &CurationDecision,
) -> Result<CuratedImageItem, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE curated_images
        SET status = $2,
            quality_score = $3,
            gender = $4,
            species = $5,
            rejection_reason = $6,
            approved_at = CASE WHEN $2 = 'APPROVED' THEN NOW() ELSE approved_at END,
            updated_at = NOW()
        WHERE id = $1 AND status = 'PENDING'
        RETURNING {ITEM_COLUMNS}
        "#
    ))
    .bind(item_id)
    .bind(decision.status.to_string())
    .bind(decision.quality_score)
    .bind(&decision.gender)
    .bind(&decision.species)
    .bind(&decision.rejection_reason)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StoreError::Conflict(format!("curated image {item_id} is no longer pending")))?;

    Ok(item_from_row(&row)?)
}

/// Move up to `count` approved, unlinked items to PROCESSING, oldest approval
/// first. Rows locked by a concurrent claim are skipped, so two runs never
/// receive the same item.
pub async fn claim_approved(
    pool: &PgPool,
    count: usize,
    specific_ids: Option<&[Uuid]>,
) -> Result<Vec<CuratedImageItem>, StoreError> {
    let rows = sqlx::query(&format!(
        r#"
        UPDATE curated_images
        SET status = 'PROCESSING', claimed_at = NOW(), updated_at = NOW()
        WHERE id IN (
            SELECT id FROM curated_images
            WHERE status = 'APPROVED'
              AND generated_character_id IS NULL
              AND ($2::uuid[] IS NULL OR id = ANY($2))
            ORDER BY approved_at ASC NULLS LAST, seq ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {ITEM_COLUMNS}
        "#
    ))
    .bind(count as i64)
    .bind(specific_ids.map(|ids| ids.to_vec()))
    .fetch_all(pool)
    .await?;

    let mut items = rows.iter().map(item_from_row).collect::<Result<Vec<_>, _>>()?;
    items.sort_by_key(|item| (item.approved_at, item.created_at));
    Ok(items)
}

/// Return a claimed item to the approved pool.
pub async fn release_claim(pool: &PgPool, item_id: Uuid) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE curated_images
        SET status = 'APPROVED', claimed_at = NULL, updated_at = NOW()
        WHERE id = $1 AND status = 'PROCESSING'
        "#,
    )
    .bind(item_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Release claims older than `before` (left behind by a crashed run).
pub async fn release_stale_claims(pool: &PgPool, before: DateTime<Utc>) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE curated_images
        SET status = 'APPROVED', claimed_at = NULL, updated_at = NOW()
        WHERE status = 'PROCESSING' AND claimed_at < $1
        "#,
    )
    .bind(before)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Link the generated character and mark the item COMPLETED, together with
/// promoting the character to READY.
pub async fn complete_item(
    pool: &PgPool,
    item_id: Uuid,
    character_id: Uuid,
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        r#"
        UPDATE curated_images
        SET status = 'COMPLETED', generated_character_id = $2, claimed_at = NULL, updated_at = NOW()
        WHERE id = $1 AND status = 'PROCESSING' AND generated_character_id IS NULL
        "#,
    )
    .bind(item_id)
    .bind(character_id)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "curated image {item_id} is not claimed or already linked"
        )));
    }

    sqlx::query("UPDATE characters SET status = 'READY' WHERE id = $1")
        .bind(character_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn get_item(pool: &PgPool, item_id: Uuid) -> Result<Option<CuratedImageItem>, StoreError> {
    let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM curated_images WHERE id = $1"))
        .bind(item_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.as_ref().map(item_from_row).transpose()?)
}
