//! In-process fakes for the external services and a wired-up pipeline harness.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use charforge::db::memory::MemoryStore;
use charforge::db::store::{CurationStore, LedgerStore};
use charforge::db::StoreError;
use charforge::models::character::{CharacterDraft, ImageView};
use charforge::models::credit::{CreditHold, CreditTransaction, TransactionType};
use charforge::models::curation::{
    CuratedImageItem, CurationDecision, CurationStatus, ImageAssessment, SourceFilter, SourceImage,
};
use charforge::models::job::JobProgress;
use charforge::services::batch::{BatchGenerator, BatchSettings};
use charforge::services::credits::CreditLedger;
use charforge::services::providers::{
    CharacterDrafter, GenerationRequest, ImageClassifier, ImageGenerator, ImageSource, ObjectStore,
    ProviderError,
};
use charforge::services::queue::ProgressSink;
use charforge::services::stages::MultiStageGenerator;
use charforge::services::storage::StorageError;

use crate::fixtures::{png_bytes, source_images};

/// Image generator returning a PNG per call. Views can be set to fail a
/// number of times (or forever) and calls can be slowed down.
#[derive(Default)]
pub struct FakeGenerator {
    failures: Mutex<HashMap<ImageView, usize>>,
    calls: Mutex<Vec<ImageView>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeGenerator {
    pub fn fail_on(&self, view: ImageView) {
        self.fail_times(view, usize::MAX);
    }

    pub fn fail_times(&self, view: ImageView, times: usize) {
        self.failures.lock().unwrap().insert(view, times);
    }

    pub fn heal(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<ImageView> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageGenerator for FakeGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, ProviderError> {
        self.calls.lock().unwrap().push(request.view);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut failures = self.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&request.view) {
            if *remaining > 0 {
                *remaining = remaining.saturating_sub(1);
                return Err(ProviderError::Status {
                    status: 503,
                    body: format!("{} view unavailable", request.view),
                });
            }
        }
        Ok(png_bytes())
    }
}

/// Approves every image unless its URL contains "blurry"; the nth call
/// (1-based) can be made to fail.
#[derive(Default)]
pub struct FakeClassifier {
    calls: AtomicUsize,
    fail_on_call: Mutex<Option<usize>>,
}

impl FakeClassifier {
    pub fn fail_on_call(&self, n: usize) {
        *self.fail_on_call.lock().unwrap() = Some(n);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageClassifier for FakeClassifier {
    async fn classify(&self, image_url: &str) -> Result<ImageAssessment, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_on_call.lock().unwrap() == Some(call) {
            return Err(ProviderError::Status {
                status: 500,
                body: "model overloaded".to_string(),
            });
        }
        Ok(ImageAssessment {
            quality_score: if image_url.contains("blurry") { 3.0 } else { 8.0 },
            gender: Some("girl".to_string()),
            species: Some("elven".to_string()),
            single_character: true,
            nsfw: false,
            description: Some("A character portrait.".to_string()),
        })
    }
}

#[derive(Default)]
pub struct FakeDrafter {
    drafted: AtomicUsize,
}

impl FakeDrafter {
    pub fn drafted(&self) -> usize {
        self.drafted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CharacterDrafter for FakeDrafter {
    async fn draft(&self, item: &CuratedImageItem) -> Result<CharacterDraft, ProviderError> {
        let n = self.drafted.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CharacterDraft {
            name: format!("Character {n}"),
            description: format!("Drafted from {}", item.source_id),
            appearance_prompt: "silver hair, green eyes, travel cloak".to_string(),
            lora: None,
        })
    }
}

/// Returns a fixed candidate list, or fails when none is set.
#[derive(Default)]
pub struct FakeSource {
    images: Mutex<Option<Vec<SourceImage>>>,
}

impl FakeSource {
    pub fn returning(images: Vec<SourceImage>) -> Self {
        Self {
            images: Mutex::new(Some(images)),
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImageSource for FakeSource {
    async fn fetch_trending_images(&self, filter: &SourceFilter) -> Result<Vec<SourceImage>, ProviderError> {
        match self.images.lock().unwrap().as_ref() {
            Some(images) => Ok(images.iter().take(filter.limit).cloned().collect()),
            None => Err(ProviderError::Status {
                status: 429,
                body: "rate limited".to_string(),
            }),
        }
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, key: &str, data: Vec<u8>, _content_type: &str) -> Result<String, StorageError> {
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(format!("https://cdn.example.com/{key}"))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

/// Ledger whose refunds always fail, as during a database outage.
pub struct RefundOutageLedger {
    pub inner: Arc<MemoryStore>,
}

#[async_trait]
impl LedgerStore for RefundOutageLedger {
    async fn balance(&self, user_id: Uuid) -> Result<i64, StoreError> {
        self.inner.balance(user_id).await
    }

    async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        allow_overdraft: bool,
    ) -> Result<(CreditTransaction, CreditHold), StoreError> {
        self.inner.debit(user_id, amount, reason, allow_overdraft).await
    }

    async fn settle_hold(&self, hold_id: Uuid) -> Result<(), StoreError> {
        self.inner.settle_hold(hold_id).await
    }

    async fn refund_hold(&self, _hold_id: Uuid, _reason: &str) -> Result<CreditTransaction, StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn stale_holds(&self, before: DateTime<Utc>) -> Result<Vec<CreditHold>, StoreError> {
        self.inner.stale_holds(before).await
    }

    async fn grant_once(
        &self,
        user_id: Uuid,
        kind: TransactionType,
        amount: i64,
        reason: &str,
    ) -> Result<Option<CreditTransaction>, StoreError> {
        self.inner.grant_once(user_id, kind, amount, reason).await
    }

    async fn transactions(&self, user_id: Uuid) -> Result<Vec<CreditTransaction>, StoreError> {
        self.inner.transactions(user_id).await
    }

    async fn active_user_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        self.inner.active_user_ids().await
    }

    async fn snapshot_balances(&self, period: &str) -> Result<u64, StoreError> {
        self.inner.snapshot_balances(period).await
    }
}

/// Records every progress update.
#[derive(Default)]
pub struct RecordingProgress {
    updates: Mutex<Vec<JobProgress>>,
}

impl RecordingProgress {
    pub fn updates(&self) -> Vec<JobProgress> {
        self.updates.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, progress: JobProgress) {
        self.updates.lock().unwrap().push(progress);
    }
}

pub const STAGE_TIMEOUT: Duration = Duration::from_secs(300);

/// Generation pipelines over the memory store and fakes.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub generator: Arc<FakeGenerator>,
    pub drafter: Arc<FakeDrafter>,
    pub objects: Arc<MemoryObjectStore>,
    pub ledger: CreditLedger,
    pub stages: Arc<MultiStageGenerator>,
    pub batch: Arc<BatchGenerator>,
    pub system_user: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let generator = Arc::new(FakeGenerator::default());
        let drafter = Arc::new(FakeDrafter::default());
        let objects = Arc::new(MemoryObjectStore::default());
        let system_user = Uuid::new_v4();
        store.add_user(system_user);

        let ledger = CreditLedger::new(store.clone()).with_overdraft_account(system_user);
        let stages = Arc::new(MultiStageGenerator::new(
            store.clone(),
            generator.clone(),
            objects.clone(),
            STAGE_TIMEOUT,
        ));
        let batch = Arc::new(BatchGenerator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            ledger.clone(),
            drafter.clone(),
            stages.clone(),
            BatchSettings {
                scheduled_max_retries: 0,
                scheduled_delay: Duration::ZERO,
                ..BatchSettings::default()
            },
        ));

        Self {
            store,
            generator,
            drafter,
            objects,
            ledger,
            stages,
            batch,
            system_user,
        }
    }

    /// A registered user holding `credits`.
    pub async fn funded_user(&self, credits: i64) -> Uuid {
        let user_id = Uuid::new_v4();
        self.store.add_user(user_id);
        if credits > 0 {
            self.ledger.grant_initial(user_id, credits).await.unwrap();
        }
        user_id
    }

    /// `n` candidates inserted and approved, oldest first.
    pub async fn approved_items(&self, n: usize) -> Vec<CuratedImageItem> {
        let inserted = self.store.insert_candidates(&source_images(0..n)).await.unwrap();
        let mut approved = Vec::with_capacity(n);
        for item in inserted {
            approved.push(
                self.store
                    .record_decision(item.id, &approve_decision())
                    .await
                    .unwrap(),
            );
        }
        approved
    }

    pub async fn item(&self, item_id: Uuid) -> CuratedImageItem {
        self.store.get_item(item_id).await.unwrap().unwrap()
    }
}

pub fn approve_decision() -> CurationDecision {
    CurationDecision {
        status: CurationStatus::Approved,
        quality_score: 8.0,
        gender: Some("female".to_string()),
        species: Some("elf".to_string()),
        rejection_reason: None,
    }
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Environment-level settings used as the fallback under stored overrides.
pub fn runtime_settings() -> charforge::config::RuntimeSettings {
    charforge::config::RuntimeSettings {
        batch_generation_enabled: true,
        daily_generation_limit: 24,
        batch_generation_cron: "0 * * * *".to_string(),
        batch_generation_size: 1,
        daily_curation_hour: 3,
        curation_fetch_limit: 50,
        curation_process_limit: 50,
        character_generation_cost: 50,
        daily_credit_grant: 10,
    }
}
