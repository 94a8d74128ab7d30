use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Decode a text column into one of the strum-backed status enums.
pub(crate) fn parse_enum<T>(value: &str) -> Result<T, sqlx::Error>
where
    T: std::str::FromStr<Err = strum::ParseError>,
{
    value
        .parse::<T>()
        .map_err(|e| sqlx::Error::Decode(format!("unexpected enum value '{value}': {e}").into()))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflicting update: {0}")]
    Conflict(String),
}

pub mod batch_queries;
pub mod character_queries;
pub mod curation_queries;
pub mod ledger_queries;
pub mod memory;
pub mod settings_queries;
pub mod store;
