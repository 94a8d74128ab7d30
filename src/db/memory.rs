//! In-memory store with the same contract as [`crate::db::store::PgStore`].
//!
//! Used by the test suite and for running the pipelines without a database.
//! Every operation takes the single state lock, so the conditional updates
//! (claims, links, hold resolution) are atomic here as well.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::db::store::{BatchLogStore, CharacterStore, CurationStore, LedgerStore, SettingsStore};
use crate::db::StoreError;
use crate::models::batch::BatchGenerationLog;
use crate::models::character::{
    Character, CharacterImage, CharacterStatus, NewCharacter, NewCharacterImage,
};
use crate::models::credit::{CreditHold, CreditTransaction, HoldState, TransactionType};
use crate::models::curation::{CuratedImageItem, CurationDecision, CurationStatus, SourceImage};

#[derive(Default)]
struct MemoryState {
    users: Vec<Uuid>,
    transactions: Vec<CreditTransaction>,
    holds: Vec<CreditHold>,
    snapshots: HashMap<(Uuid, String), i64>,
    items: Vec<CuratedImageItem>,
    characters: HashMap<Uuid, Character>,
    images: Vec<CharacterImage>,
    logs: Vec<BatchGenerationLog>,
    settings: HashMap<String, String>,
}

impl MemoryState {
    fn balance(&self, user_id: Uuid) -> i64 {
        self.transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .map(|t| t.amount)
            .sum()
    }

    fn append(&mut self, user_id: Uuid, kind: TransactionType, amount: i64, reason: &str) -> CreditTransaction {
        let transaction = CreditTransaction {
            id: Uuid::new_v4(),
            user_id,
            kind,
            amount,
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        self.transactions.push(transaction.clone());
        transaction
    }

    fn item_mut(&mut self, item_id: Uuid) -> Option<&mut CuratedImageItem> {
        self.items.iter_mut().find(|i| i.id == item_id)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an active user (the `users` table is owned by the wider product).
    pub fn add_user(&self, user_id: Uuid) {
        let mut state = self.state();
        if !state.users.contains(&user_id) {
            state.users.push(user_id);
        }
    }

    /// Snapshot value written for a user and period, if any.
    pub fn snapshot(&self, user_id: Uuid, period: &str) -> Option<i64> {
        self.state().snapshots.get(&(user_id, period.to_string())).copied()
    }

    /// Every image ever stored for a character, active or not.
    pub fn all_images(&self, character_id: Uuid) -> Vec<CharacterImage> {
        self.state()
            .images
            .iter()
            .filter(|i| i.character_id == character_id)
            .cloned()
            .collect()
    }

    pub fn characters(&self) -> Vec<Character> {
        let mut characters: Vec<_> = self.state().characters.values().cloned().collect();
        characters.sort_by_key(|c| c.created_at);
        characters
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn balance(&self, user_id: Uuid) -> Result<i64, StoreError> {
        Ok(self.state().balance(user_id))
    }

    async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        allow_overdraft: bool,
    ) -> Result<(CreditTransaction, CreditHold), StoreError> {
        let mut state = self.state();
        let balance = state.balance(user_id);
        if !allow_overdraft && balance < amount {
            return Err(StoreError::InsufficientCredits {
                balance,
                required: amount,
            });
        }

        let debit = state.append(user_id, TransactionType::Consumption, -amount, reason);
        let hold = CreditHold {
            id: Uuid::new_v4(),
            user_id,
            debit_transaction_id: debit.id,
            amount,
            reason: reason.to_string(),
            state: HoldState::Pending,
            created_at: debit.created_at,
            resolved_at: None,
        };
        state.holds.push(hold.clone());
        Ok((debit, hold))
    }

    async fn settle_hold(&self, hold_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state();
        let hold = state
            .holds
            .iter_mut()
            .find(|h| h.id == hold_id && h.state == HoldState::Pending)
            .ok_or_else(|| StoreError::Conflict(format!("hold {hold_id} is not pending")))?;
        hold.state = HoldState::Settled;
        hold.resolved_at = Some(Utc::now());
        Ok(())
    }

    async fn refund_hold(&self, hold_id: Uuid, reason: &str) -> Result<CreditTransaction, StoreError> {
        let mut state = self.state();
        let hold = state
            .holds
            .iter_mut()
            .find(|h| h.id == hold_id && h.state == HoldState::Pending)
            .ok_or_else(|| StoreError::Conflict(format!("hold {hold_id} is not pending")))?;
        hold.state = HoldState::Refunded;
        hold.resolved_at = Some(Utc::now());
        let (user_id, amount) = (hold.user_id, hold.amount);
        Ok(state.append(user_id, TransactionType::Refund, amount, reason))
    }

    async fn stale_holds(&self, before: DateTime<Utc>) -> Result<Vec<CreditHold>, StoreError> {
        Ok(self
            .state()
            .holds
            .iter()
            .filter(|h| h.state == HoldState::Pending && h.created_at < before)
            .cloned()
            .collect())
    }

    async fn grant_once(
        &self,
        user_id: Uuid,
        kind: TransactionType,
        amount: i64,
        reason: &str,
    ) -> Result<Option<CreditTransaction>, StoreError> {
        let mut state = self.state();
        if state
            .transactions
            .iter()
            .any(|t| t.user_id == user_id && t.reason == reason)
        {
            return Ok(None);
        }
        Ok(Some(state.append(user_id, kind, amount, reason)))
    }

    async fn transactions(&self, user_id: Uuid) -> Result<Vec<CreditTransaction>, StoreError> {
        Ok(self
            .state()
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn active_user_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.state().users.clone())
    }

    async fn snapshot_balances(&self, period: &str) -> Result<u64, StoreError> {
        let mut state = self.state();
        let mut written = 0;
        for user_id in state.users.clone() {
            let key = (user_id, period.to_string());
            if state.snapshots.contains_key(&key) {
                continue;
            }
            let balance = state.balance(user_id);
            state.snapshots.insert(key, balance);
            written += 1;
        }
        Ok(written)
    }
}

#[async_trait]
impl CurationStore for MemoryStore {
    async fn insert_candidates(
        &self,
        candidates: &[SourceImage],
    ) -> Result<Vec<CuratedImageItem>, StoreError> {
        let mut state = self.state();
        let mut inserted = Vec::new();
        for candidate in candidates {
            if state.items.iter().any(|i| i.source_url == candidate.url) {
                continue;
            }
            let item = CuratedImageItem {
                id: Uuid::new_v4(),
                source_url: candidate.url.clone(),
                source_id: candidate.source_id.clone(),
                status: CurationStatus::Pending,
                quality_score: None,
                gender: None,
                species: None,
                rejection_reason: None,
                generated_character_id: None,
                created_at: Utc::now(),
                approved_at: None,
                claimed_at: None,
            };
            state.items.push(item.clone());
            inserted.push(item);
        }
        Ok(inserted)
    }

    async fn pending_items(&self, limit: Option<usize>) -> Result<Vec<CuratedImageItem>, StoreError> {
        Ok(self
            .state()
            .items
            .iter()
            .filter(|i| i.status == CurationStatus::Pending)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn record_decision(
        &self,
        item_id: Uuid,
        decision: &CurationDecision,
    ) -> Result<CuratedImageItem, StoreError> {
        let mut state = self.state();
        let item = state
            .item_mut(item_id)
            .filter(|i| i.status == CurationStatus::Pending)
            .ok_or_else(|| StoreError::Conflict(format!("curated image {item_id} is no longer pending")))?;

        item.status = decision.status;
        item.quality_score = Some(decision.quality_score);
        item.gender = decision.gender.clone();
        item.species = decision.species.clone();
        item.rejection_reason = decision.rejection_reason.clone();
        if decision.status == CurationStatus::Approved {
            item.approved_at = Some(Utc::now());
        }
        Ok(item.clone())
    }

    async fn claim_approved(
        &self,
        count: usize,
        specific_ids: Option<&[Uuid]>,
    ) -> Result<Vec<CuratedImageItem>, StoreError> {
        let mut state = self.state();

        // Stable sort keeps insertion order among equal approval times.
        let mut eligible: Vec<usize> = state
            .items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.status == CurationStatus::Approved && i.generated_character_id.is_none())
            .filter(|(_, i)| specific_ids.map_or(true, |ids| ids.contains(&i.id)))
            .map(|(idx, _)| idx)
            .collect();
        eligible.sort_by_key(|&idx| state.items[idx].approved_at);

        let now = Utc::now();
        let mut claimed = Vec::new();
        for idx in eligible.into_iter().take(count) {
            let item = &mut state.items[idx];
            item.status = CurationStatus::Processing;
            item.claimed_at = Some(now);
            claimed.push(item.clone());
        }
        Ok(claimed)
    }

    async fn release_claim(&self, item_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state();
        if let Some(item) = state
            .item_mut(item_id)
            .filter(|i| i.status == CurationStatus::Processing)
        {
            item.status = CurationStatus::Approved;
            item.claimed_at = None;
        }
        Ok(())
    }

    async fn release_stale_claims(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state();
        let mut released = 0;
        for item in state.items.iter_mut() {
            if item.status == CurationStatus::Processing && item.claimed_at.is_some_and(|c| c < before) {
                item.status = CurationStatus::Approved;
                item.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn complete_item(&self, item_id: Uuid, character_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state();
        let item = state
            .item_mut(item_id)
            .filter(|i| i.status == CurationStatus::Processing && i.generated_character_id.is_none())
            .ok_or_else(|| {
                StoreError::Conflict(format!("curated image {item_id} is not claimed or already linked"))
            })?;
        item.status = CurationStatus::Completed;
        item.generated_character_id = Some(character_id);
        item.claimed_at = None;

        if let Some(character) = state.characters.get_mut(&character_id) {
            character.status = CharacterStatus::Ready;
        }
        Ok(())
    }

    async fn get_item(&self, item_id: Uuid) -> Result<Option<CuratedImageItem>, StoreError> {
        Ok(self.state().items.iter().find(|i| i.id == item_id).cloned())
    }
}

#[async_trait]
impl CharacterStore for MemoryStore {
    async fn create_character(&self, new: &NewCharacter) -> Result<Character, StoreError> {
        let character = Character {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            name: new.name.clone(),
            description: new.description.clone(),
            prompt: new.prompt.clone(),
            lora: new.lora.clone(),
            source_image_id: new.source_image_id,
            status: CharacterStatus::Draft,
            created_at: Utc::now(),
        };
        self.state().characters.insert(character.id, character.clone());
        Ok(character)
    }

    async fn get_character(&self, character_id: Uuid) -> Result<Option<Character>, StoreError> {
        Ok(self.state().characters.get(&character_id).cloned())
    }

    async fn draft_for_source(
        &self,
        source_image_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Character>, StoreError> {
        Ok(self
            .state()
            .characters
            .values()
            .filter(|c| {
                c.source_image_id == Some(source_image_id)
                    && c.user_id == user_id
                    && c.status == CharacterStatus::Draft
            })
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn active_images(&self, character_id: Uuid) -> Result<Vec<CharacterImage>, StoreError> {
        Ok(self
            .state()
            .images
            .iter()
            .filter(|i| i.character_id == character_id && i.is_active)
            .cloned()
            .collect())
    }

    async fn insert_image(&self, new: &NewCharacterImage) -> Result<CharacterImage, StoreError> {
        let mut state = self.state();
        for image in state
            .images
            .iter_mut()
            .filter(|i| i.character_id == new.character_id && i.label == new.label)
        {
            image.is_active = false;
        }
        let image = CharacterImage {
            id: Uuid::new_v4(),
            character_id: new.character_id,
            label: new.label,
            image_url: new.image_url.clone(),
            storage_key: new.storage_key.clone(),
            is_active: true,
            created_at: Utc::now(),
        };
        state.images.push(image.clone());
        Ok(image)
    }
}

#[async_trait]
impl BatchLogStore for MemoryStore {
    async fn create_log(
        &self,
        scheduled_at: DateTime<Utc>,
        target_count: i32,
    ) -> Result<BatchGenerationLog, StoreError> {
        let log = BatchGenerationLog {
            id: Uuid::new_v4(),
            scheduled_at,
            executed_at: Utc::now(),
            completed_at: None,
            target_count,
            success_count: 0,
            failure_count: 0,
            duration_ms: 0,
            error_message: None,
        };
        self.state().logs.push(log.clone());
        Ok(log)
    }

    async fn finish_log(
        &self,
        log_id: Uuid,
        success_count: i32,
        failure_count: i32,
        duration_ms: i64,
        error_message: Option<&str>,
    ) -> Result<BatchGenerationLog, StoreError> {
        let mut state = self.state();
        let log = state
            .logs
            .iter_mut()
            .find(|l| l.id == log_id)
            .ok_or_else(|| StoreError::NotFound(format!("batch generation log {log_id}")))?;
        log.completed_at = Some(Utc::now());
        log.success_count = success_count;
        log.failure_count = failure_count;
        log.duration_ms = duration_ms;
        log.error_message = error_message.map(str::to_string);
        Ok(log.clone())
    }

    async fn successes_scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        Ok(self
            .state()
            .logs
            .iter()
            .filter(|l| l.scheduled_at >= from && l.scheduled_at < to)
            .map(|l| i64::from(l.success_count))
            .sum())
    }

    async fn logs_scheduled_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BatchGenerationLog>, StoreError> {
        let mut logs: Vec<_> = self
            .state()
            .logs
            .iter()
            .filter(|l| l.scheduled_at >= from && l.scheduled_at < to)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.scheduled_at);
        Ok(logs)
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state().settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.state().settings.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(url: &str) -> SourceImage {
        SourceImage {
            source_id: url.rsplit('/').next().unwrap_or(url).to_string(),
            url: url.to_string(),
            width: Some(512),
            height: Some(768),
            author: None,
            reactions: 0,
        }
    }

    fn approve() -> CurationDecision {
        CurationDecision {
            status: CurationStatus::Approved,
            quality_score: 8.0,
            gender: Some("female".to_string()),
            species: Some("elf".to_string()),
            rejection_reason: None,
        }
    }

    #[tokio::test]
    async fn debit_is_refused_without_balance() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let err = store.debit(user, 10, "x", false).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientCredits { balance: 0, required: 10 }
        ));
        assert!(store.transactions(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hold_resolves_once() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store
            .grant_once(user, TransactionType::GrantInitial, 100, "signup")
            .await
            .unwrap();
        let (_, hold) = store.debit(user, 40, "render", false).await.unwrap();
        store.refund_hold(hold.id, "refund: render").await.unwrap();
        assert!(matches!(
            store.settle_hold(hold.id).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.balance(user).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn claim_skips_already_claimed_items() {
        let store = MemoryStore::new();
        let items = store
            .insert_candidates(&[candidate("https://img/1"), candidate("https://img/2")])
            .await
            .unwrap();
        for item in &items {
            store.record_decision(item.id, &approve()).await.unwrap();
        }

        let first = store.claim_approved(1, None).await.unwrap();
        let second = store.claim_approved(5, None).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].id, second[0].id);
        assert_eq!(first[0].id, items[0].id);
    }

    #[tokio::test]
    async fn complete_item_links_only_once() {
        let store = MemoryStore::new();
        let items = store.insert_candidates(&[candidate("https://img/1")]).await.unwrap();
        store.record_decision(items[0].id, &approve()).await.unwrap();
        store.claim_approved(1, None).await.unwrap();

        store.complete_item(items[0].id, Uuid::new_v4()).await.unwrap();
        let again = store.complete_item(items[0].id, Uuid::new_v4()).await;
        assert!(matches!(again, Err(StoreError::Conflict(_))));
    }
}
