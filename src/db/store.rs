//! Record-store seams consumed by the pipelines.
//!
//! Each trait covers one concern; [`PgStore`] implements all of them on top of
//! the query modules, and [`crate::db::memory::MemoryStore`] provides the
//! same contract in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::{
    batch_queries, character_queries, curation_queries, ledger_queries, settings_queries,
    StoreError,
};
use crate::models::batch::BatchGenerationLog;
use crate::models::character::{Character, CharacterImage, NewCharacter, NewCharacterImage};
use crate::models::credit::{CreditHold, CreditTransaction, TransactionType};
use crate::models::curation::{CuratedImageItem, CurationDecision, SourceImage};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn balance(&self, user_id: Uuid) -> Result<i64, StoreError>;

    /// Append `CONSUMPTION -amount` and a pending hold atomically. Fails with
    /// [`StoreError::InsufficientCredits`] when the balance does not cover
    /// `amount` and `allow_overdraft` is false.
    async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        allow_overdraft: bool,
    ) -> Result<(CreditTransaction, CreditHold), StoreError>;

    async fn settle_hold(&self, hold_id: Uuid) -> Result<(), StoreError>;

    /// Append `REFUND +amount` and resolve the hold atomically.
    async fn refund_hold(&self, hold_id: Uuid, reason: &str) -> Result<CreditTransaction, StoreError>;

    async fn stale_holds(&self, before: DateTime<Utc>) -> Result<Vec<CreditHold>, StoreError>;

    /// Append a grant unless one with the same reason exists for the user.
    async fn grant_once(
        &self,
        user_id: Uuid,
        kind: TransactionType,
        amount: i64,
        reason: &str,
    ) -> Result<Option<CreditTransaction>, StoreError>;

    async fn transactions(&self, user_id: Uuid) -> Result<Vec<CreditTransaction>, StoreError>;

    async fn active_user_ids(&self) -> Result<Vec<Uuid>, StoreError>;

    async fn snapshot_balances(&self, period: &str) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait CurationStore: Send + Sync {
    async fn insert_candidates(
        &self,
        candidates: &[SourceImage],
    ) -> Result<Vec<CuratedImageItem>, StoreError>;

    async fn pending_items(&self, limit: Option<usize>) -> Result<Vec<CuratedImageItem>, StoreError>;

    async fn record_decision(
        &self,
        item_id: Uuid,
        decision: &CurationDecision,
    ) -> Result<CuratedImageItem, StoreError>;

    async fn claim_approved(
        &self,
        count: usize,
        specific_ids: Option<&[Uuid]>,
    ) -> Result<Vec<CuratedImageItem>, StoreError>;

    async fn release_claim(&self, item_id: Uuid) -> Result<(), StoreError>;

    async fn release_stale_claims(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Set `COMPLETED` and `generated_character_id` in one write. Fails with
    /// [`StoreError::Conflict`] when the item is not claimed or already linked.
    async fn complete_item(&self, item_id: Uuid, character_id: Uuid) -> Result<(), StoreError>;

    async fn get_item(&self, item_id: Uuid) -> Result<Option<CuratedImageItem>, StoreError>;
}

#[async_trait]
pub trait CharacterStore: Send + Sync {
    async fn create_character(&self, new: &NewCharacter) -> Result<Character, StoreError>;

    async fn get_character(&self, character_id: Uuid) -> Result<Option<Character>, StoreError>;

    /// Newest DRAFT character of `user_id` drafted from a curated image.
    async fn draft_for_source(
        &self,
        source_image_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Character>, StoreError>;

    async fn active_images(&self, character_id: Uuid) -> Result<Vec<CharacterImage>, StoreError>;

    async fn insert_image(&self, new: &NewCharacterImage) -> Result<CharacterImage, StoreError>;
}

#[async_trait]
pub trait BatchLogStore: Send + Sync {
    async fn create_log(
        &self,
        scheduled_at: DateTime<Utc>,
        target_count: i32,
    ) -> Result<BatchGenerationLog, StoreError>;

    async fn finish_log(
        &self,
        log_id: Uuid,
        success_count: i32,
        failure_count: i32,
        duration_ms: i64,
        error_message: Option<&str>,
    ) -> Result<BatchGenerationLog, StoreError>;

    async fn successes_scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    async fn logs_scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BatchGenerationLog>, StoreError>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Everything the pipelines need from persistence.
pub trait Store: LedgerStore + CurationStore + CharacterStore + BatchLogStore + SettingsStore {}

impl<T> Store for T where T: LedgerStore + CurationStore + CharacterStore + BatchLogStore + SettingsStore {}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn balance(&self, user_id: Uuid) -> Result<i64, StoreError> {
        ledger_queries::get_balance(&self.pool, user_id).await
    }

    async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        allow_overdraft: bool,
    ) -> Result<(CreditTransaction, CreditHold), StoreError> {
        ledger_queries::debit(&self.pool, user_id, amount, reason, allow_overdraft).await
    }

    async fn settle_hold(&self, hold_id: Uuid) -> Result<(), StoreError> {
        ledger_queries::settle_hold(&self.pool, hold_id).await
    }

    async fn refund_hold(&self, hold_id: Uuid, reason: &str) -> Result<CreditTransaction, StoreError> {
        ledger_queries::refund_hold(&self.pool, hold_id, reason).await
    }

    async fn stale_holds(&self, before: DateTime<Utc>) -> Result<Vec<CreditHold>, StoreError> {
        ledger_queries::stale_holds(&self.pool, before).await
    }

    async fn grant_once(
        &self,
        user_id: Uuid,
        kind: TransactionType,
        amount: i64,
        reason: &str,
    ) -> Result<Option<CreditTransaction>, StoreError> {
        ledger_queries::grant_once(&self.pool, user_id, kind, amount, reason).await
    }

    async fn transactions(&self, user_id: Uuid) -> Result<Vec<CreditTransaction>, StoreError> {
        ledger_queries::list_transactions(&self.pool, user_id).await
    }

    async fn active_user_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        ledger_queries::active_user_ids(&self.pool).await
    }

    async fn snapshot_balances(&self, period: &str) -> Result<u64, StoreError> {
        ledger_queries::snapshot_balances(&self.pool, period).await
    }
}

#[async_trait]
impl CurationStore for PgStore {
    async fn insert_candidates(
        &self,
        candidates: &[SourceImage],
    ) -> Result<Vec<CuratedImageItem>, StoreError> {
        curation_queries::insert_candidates(&self.pool, candidates).await
    }

    async fn pending_items(&self, limit: Option<usize>) -> Result<Vec<CuratedImageItem>, StoreError> {
        curation_queries::pending_items(&self.pool, limit).await
    }

    async fn record_decision(
        &self,
        item_id: Uuid,
        decision: &CurationDecision,
    ) -> Result<CuratedImageItem, StoreError> {
        curation_queries::record_decision(&self.pool, item_id, decision).await
    }

    async fn claim_approved(
        &self,
        count: usize,
        specific_ids: Option<&[Uuid]>,
    ) -> Result<Vec<CuratedImageItem>, StoreError> {
        curation_queries::claim_approved(&self.pool, count, specific_ids).await
    }

    async fn release_claim(&self, item_id: Uuid) -> Result<(), StoreError> {
        curation_queries::release_claim(&self.pool, item_id).await
    }

    async fn release_stale_claims(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        curation_queries::release_stale_claims(&self.pool, before).await
    }

    async fn complete_item(&self, item_id: Uuid, character_id: Uuid) -> Result<(), StoreError> {
        curation_queries::complete_item(&self.pool, item_id, character_id).await
    }

    async fn get_item(&self, item_id: Uuid) -> Result<Option<CuratedImageItem>, StoreError> {
        curation_queries::get_item(&self.pool, item_id).await
    }
}

#[async_trait]
impl CharacterStore for PgStore {
    async fn create_character(&self, new: &NewCharacter) -> Result<Character, StoreError> {
        character_queries::create_character(&self.pool, new).await
    }

    async fn get_character(&self, character_id: Uuid) -> Result<Option<Character>, StoreError> {
        character_queries::get_character(&self.pool, character_id).await
    }

    async fn draft_for_source(
        &self,
        source_image_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Character>, StoreError> {
        character_queries::draft_for_source(&self.pool, source_image_id, user_id).await
    }

    async fn active_images(&self, character_id: Uuid) -> Result<Vec<CharacterImage>, StoreError> {
        character_queries::active_images(&self.pool, character_id).await
    }

    async fn insert_image(&self, new: &NewCharacterImage) -> Result<CharacterImage, StoreError> {
        character_queries::insert_image(&self.pool, new).await
    }
}

#[async_trait]
impl BatchLogStore for PgStore {
    async fn create_log(
        &self,
        scheduled_at: DateTime<Utc>,
        target_count: i32,
    ) -> Result<BatchGenerationLog, StoreError> {
        batch_queries::create_log(&self.pool, scheduled_at, target_count).await
    }

    async fn finish_log(
        &self,
        log_id: Uuid,
        success_count: i32,
        failure_count: i32,
        duration_ms: i64,
        error_message: Option<&str>,
    ) -> Result<BatchGenerationLog, StoreError> {
        batch_queries::finish_log(
            &self.pool,
            log_id,
            success_count,
            failure_count,
            duration_ms,
            error_message,
        )
        .await
    }

    async fn successes_scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        batch_queries::successes_scheduled_between(&self.pool, from, to).await
    }

    async fn logs_scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BatchGenerationLog>, StoreError> {
        batch_queries::logs_scheduled_between(&self.pool, from, to).await
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        settings_queries::get_setting(&self.pool, key).await
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        settings_queries::put_setting(&self.pool, key, value).await
    }
}
