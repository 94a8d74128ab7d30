use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::{parse_enum, StoreError};
use crate::models::character::{
    Character, CharacterImage, LoraConfig, NewCharacter, NewCharacterImage,
};

const CHARACTER_COLUMNS: &str =
    "id, user_id, name, description, prompt, lora, source_image_id, status, created_at";
const IMAGE_COLUMNS: &str = "id, character_id, label, image_url, storage_key, is_active, created_at";

fn character_from_row(row: &PgRow) -> Result<Character, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let lora: Option<Json<LoraConfig>> = row.try_get("lora")?;
    Ok(Character {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        prompt: row.try_get("prompt")?,
        lora: lora.map(|l| l.0),
        source_image_id: row.try_get("source_image_id")?,
        status: parse_enum(&status)?,
        created_at: row.try_get("created_at")?,
    })
}

fn image_from_row(row: &PgRow) -> Result<CharacterImage, sqlx::Error> {
    let label: String = row.try_get("label")?;
    Ok(CharacterImage {
        id: row.try_get("id")?,
        character_id: row.try_get("character_id")?,
        label: parse_enum(&label)?,
        image_url: row.try_get("image_url")?,
        storage_key: row.try_get("storage_key")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Insert a character in DRAFT status.
pub async fn create_character(pool: &PgPool, new: &NewCharacter) -> Result<Character, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO characters (user_id, name, description, prompt, lora, source_image_id, status)
        VALUES ($1, $2, $3, $4, $5, $6, 'DRAFT')
        RETURNING {CHARACTER_COLUMNS}
        "#
    ))
    .bind(new.user_id)
    .bind(&new.name)
    .bind(&new.description)
    .bind(&new.prompt)
    .bind(new.lora.clone().map(Json))
    .bind(new.source_image_id)
    .fetch_one(pool)
    .await?;

    Ok(character_from_row(&row)?)
}

pub async fn get_character(pool: &PgPool, character_id: Uuid) -> Result<Option<Character>, StoreError> {
    let row = sqlx::query(&format!("SELECT {CHARACTER_COLUMNS} FROM characters WHERE id = $1"))
        .bind(character_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.as_ref().map(character_from_row).transpose()?)
}

/// A failed batch item leaves its character in DRAFT; later runs pick it up.
pub async fn draft_for_source(
    pool: &PgPool,
    source_image_id: Uuid,
    user_id: Uuid,
) -> Result<Option<Character>, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {CHARACTER_COLUMNS}
        FROM characters
        WHERE source_image_id = $1 AND user_id = $2 AND status = 'DRAFT'
        ORDER BY created_at DESC
        LIMIT 1
        "#
    ))
    .bind(source_image_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(character_from_row).transpose()?)
}

/// Active images of a character, oldest first.
pub async fn active_images(pool: &PgPool, character_id: Uuid) -> Result<Vec<CharacterImage>, StoreError> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {IMAGE_COLUMNS}
        FROM character_images
        WHERE character_id = $1 AND is_active
        ORDER BY created_at ASC
        "#
    ))
    .bind(character_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(image_from_row).collect::<Result<_, _>>()?)
}

/// Store a stage image as the active image for its label, deactivating the
/// previous one in the same transaction.
pub async fn insert_image(pool: &PgPool, new: &NewCharacterImage) -> Result<CharacterImage, StoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE character_images
        SET is_active = FALSE
        WHERE character_id = $1 AND label = $2 AND is_active
        "#,
    )
    .bind(new.character_id)
    .bind(new.label.to_string())
    .execute(&mut *tx)
    .await?;

    let row = sqlx::query(&format!(
        r#"
        INSERT INTO character_images (character_id, label, image_url, storage_key, is_active)
        VALUES ($1, $2, $3, $4, TRUE)
        RETURNING {IMAGE_COLUMNS}
        "#
    ))
    .bind(new.character_id)
    .bind(new.label.to_string())
    .bind(&new.image_url)
    .bind(&new.storage_key)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(image_from_row(&row)?)
}
