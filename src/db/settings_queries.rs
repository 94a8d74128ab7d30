use sqlx::{PgPool, Row};

use crate::db::StoreError;

/// Read one runtime setting; `None` when the key is not set.
pub async fn get_setting(pool: &PgPool, key: &str) -> Result<Option<String>, StoreError> {
    let row = sqlx::query("SELECT value FROM system_settings WHERE key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| r.try_get("value")).transpose()?)
}

/// Insert or overwrite a runtime setting.
pub async fn put_setting(pool: &PgPool, key: &str, value: &str) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO system_settings (key, value, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}
