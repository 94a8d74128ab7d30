//! Runtime-tunable settings stored in `system_settings`, with the environment
//! configuration as fallback.

use std::str::FromStr;

use serde::Serialize;
use tracing::warn;

use crate::config::AppConfig;
use crate::db::store::SettingsStore;
use crate::db::StoreError;

pub const BATCH_GENERATION_ENABLED: &str = "batch_generation_enabled";
pub const DAILY_GENERATION_LIMIT: &str = "daily_generation_limit";
pub const BATCH_GENERATION_CRON: &str = "batch_generation_cron";
pub const BATCH_GENERATION_SIZE: &str = "batch_generation_size";
pub const DAILY_CURATION_HOUR: &str = "daily_curation_hour";
pub const CURATION_FETCH_LIMIT: &str = "curation_fetch_limit";
pub const CURATION_PROCESS_LIMIT: &str = "curation_process_limit";
pub const CHARACTER_GENERATION_COST: &str = "character_generation_cost";
pub const DAILY_CREDIT_GRANT: &str = "daily_credit_grant";

pub const KNOWN_KEYS: &[&str] = &[
    BATCH_GENERATION_ENABLED,
    DAILY_GENERATION_LIMIT,
    BATCH_GENERATION_CRON,
    BATCH_GENERATION_SIZE,
    DAILY_CURATION_HOUR,
    CURATION_FETCH_LIMIT,
    CURATION_PROCESS_LIMIT,
    CHARACTER_GENERATION_COST,
    DAILY_CREDIT_GRANT,
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeSettings {
    pub batch_generation_enabled: bool,
    pub daily_generation_limit: u32,
    pub batch_generation_cron: String,
    pub batch_generation_size: usize,
    pub daily_curation_hour: u32,
    pub curation_fetch_limit: usize,
    pub curation_process_limit: usize,
    pub character_generation_cost: i64,
    pub daily_credit_grant: i64,
}

impl From<&AppConfig> for RuntimeSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch_generation_enabled: config.batch_generation_enabled,
            daily_generation_limit: config.daily_generation_limit,
            batch_generation_cron: config.batch_generation_cron.clone(),
            batch_generation_size: config.batch_generation_size,
            daily_curation_hour: config.daily_curation_hour,
            curation_fetch_limit: config.curation_fetch_limit,
            curation_process_limit: config.curation_process_limit,
            character_generation_cost: config.character_generation_cost,
            daily_credit_grant: config.daily_credit_grant,
        }
    }
}

impl RuntimeSettings {
    /// Overlay stored settings on `fallback`. A value that does not parse is
    /// logged and the fallback kept.
    pub async fn load(store: &dyn SettingsStore, fallback: RuntimeSettings) -> Result<Self, StoreError> {
        let mut settings = fallback;

        settings.batch_generation_enabled = setting(
            store,
            BATCH_GENERATION_ENABLED,
            settings.batch_generation_enabled,
        )
        .await?;
        settings.daily_generation_limit =
            setting(store, DAILY_GENERATION_LIMIT, settings.daily_generation_limit).await?;
        settings.batch_generation_cron =
            setting(store, BATCH_GENERATION_CRON, settings.batch_generation_cron).await?;
        settings.batch_generation_size =
            setting(store, BATCH_GENERATION_SIZE, settings.batch_generation_size).await?;
        settings.daily_curation_hour =
            setting(store, DAILY_CURATION_HOUR, settings.daily_curation_hour).await?;
        settings.curation_fetch_limit =
            setting(store, CURATION_FETCH_LIMIT, settings.curation_fetch_limit).await?;
        settings.curation_process_limit =
            setting(store, CURATION_PROCESS_LIMIT, settings.curation_process_limit).await?;
        settings.character_generation_cost = setting(
            store,
            CHARACTER_GENERATION_COST,
            settings.character_generation_cost,
        )
        .await?;
        settings.daily_credit_grant =
            setting(store, DAILY_CREDIT_GRANT, settings.daily_credit_grant).await?;

        if settings.daily_curation_hour > 23 {
            warn!(
                value = settings.daily_curation_hour,
                "daily_curation_hour out of range, using 3"
            );
            settings.daily_curation_hour = 3;
        }

        Ok(settings)
    }

    /// Cron expression of the daily curation run.
    pub fn curation_cron(&self) -> String {
        format!("0 {} * * *", self.daily_curation_hour)
    }
}

async fn setting<T>(store: &dyn SettingsStore, key: &str, fallback: T) -> Result<T, StoreError>
where
    T: FromStr,
{
    let Some(raw) = store.get_setting(key).await? else {
        return Ok(fallback);
    };

    match raw.trim().parse::<T>() {
        Ok(value) => Ok(value),
        Err(_) => {
            warn!(key, value = %raw, "Unparsable setting, using fallback");
            Ok(fallback)
        }
    }
}
