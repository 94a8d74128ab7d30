//! Batch character generation from the approved curation pool.
//!
//! Items are claimed up front, generated one at a time under a credit debit,
//! and either linked to their new character or released back to APPROVED.

use chrono::{NaiveTime, Utc};
use metrics::counter;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::store::{BatchLogStore, CharacterStore, CurationStore};
use crate::db::StoreError;
use crate::models::batch::{BatchOutcome, BatchRequest, ItemResult, ScheduledBatchOutcome, ScheduledRun};
use crate::models::character::{Character, NewCharacter};
use crate::models::curation::CuratedImageItem;
use crate::models::job::{JobProgress, StageProgress};
use crate::services::credits::{CreditLedger, GuardError};
use crate::services::providers::{CharacterDrafter, ProviderError};
use crate::services::queue::ProgressSink;
use crate::services::stages::{MultiStageGenerator, StageError};

#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// PROCESSING claims older than this belong to a dead run and are released.
    pub stale_claim_after: chrono::Duration,
    pub scheduled_max_retries: u32,
    pub scheduled_delay: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            stale_claim_after: chrono::Duration::hours(2),
            scheduled_max_retries: 1,
            scheduled_delay: Duration::from_secs(5),
        }
    }
}

pub struct BatchGenerator {
    curation: Arc<dyn CurationStore>,
    characters: Arc<dyn CharacterStore>,
    logs: Arc<dyn BatchLogStore>,
    ledger: CreditLedger,
    drafter: Arc<dyn CharacterDrafter>,
    stages: Arc<MultiStageGenerator>,
    settings: BatchSettings,
}

struct ItemSuccess {
    attempts: u32,
    character_id: Uuid,
    images: usize,
}

/// Last error of an item together with what the attempts left behind.
#[derive(Debug)]
struct ItemFailure {
    attempts: u32,
    character_id: Option<Uuid>,
    cause: BatchError,
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.cause.fmt(f)
    }
}

impl BatchGenerator {
    pub fn new(
        curation: Arc<dyn CurationStore>,
        characters: Arc<dyn CharacterStore>,
        logs: Arc<dyn BatchLogStore>,
        ledger: CreditLedger,
        drafter: Arc<dyn CharacterDrafter>,
        stages: Arc<MultiStageGenerator>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            curation,
            characters,
            logs,
            ledger,
            drafter,
            stages,
            settings,
        }
    }

    /// Generate characters for up to `request.count` approved items. Item
    /// failures are counted in the outcome; only store errors while claiming
    /// fail the whole call.
    pub async fn generate_batch(
        &self,
        request: &BatchRequest,
        progress: &dyn ProgressSink,
    ) -> Result<BatchOutcome, BatchError> {
        let cutoff = Utc::now() - self.settings.stale_claim_after;
        let released = self.curation.release_stale_claims(cutoff).await?;
        if released > 0 {
            warn!(released, "Released stale curated image claims");
        }

        let items = self
            .curation
            .claim_approved(request.count, request.specific_image_ids.as_deref())
            .await?;
        let total_items = items.len();
        info!(
            requested = request.count,
            claimed = total_items,
            user_id = %request.user_id,
            "Batch generation started"
        );

        let mut results = Vec::with_capacity(total_items);
        let (mut succeeded, mut failed) = (0, 0);

        for (idx, item) in items.iter().enumerate() {
            if idx > 0 && !request.delay_between.is_zero() {
                sleep(request.delay_between).await;
            }

            let item_progress = BatchItemProgress {
                inner: progress,
                item_index: idx + 1,
                total_items,
                succeeded,
                failed,
            };
            item_progress.report_item();

            let result = self.generate_item(item, request, &item_progress).await;
            if result.success {
                succeeded += 1;
            } else {
                failed += 1;
            }
            results.push(result);
        }

        progress.report(JobProgress::Batch {
            item_index: total_items,
            total_items,
            succeeded,
            failed,
            stage: None,
        });

        let outcome = BatchOutcome::from_results(results);
        info!(
            success_count = outcome.success_count,
            failure_count = outcome.failure_count,
            total_duration_ms = outcome.total_duration_ms,
            average_duration_ms = outcome.average_duration_ms,
            "Batch generation finished"
        );
        Ok(outcome)
    }

    async fn generate_item(
        &self,
        item: &CuratedImageItem,
        request: &BatchRequest,
        progress: &dyn ProgressSink,
    ) -> ItemResult {
        let started = Instant::now();
        let reason = format!("character generation from curated image {}", item.id);

        let funded = self
            .ledger
            .with_credits(request.user_id, request.cost, &reason, move || {
                self.attempt_item(item, request, progress)
            })
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match funded {
            Ok(done) => {
                counter!("characters_generated_total").increment(1);
                info!(
                    item_id = %item.id,
                    character_id = %done.character_id,
                    attempts = done.attempts,
                    images = done.images,
                    duration_ms,
                    "Character generated from curated image"
                );
                ItemResult {
                    item_id: item.id,
                    character_id: Some(done.character_id),
                    success: true,
                    attempts: done.attempts,
                    images: done.images,
                    duration_ms,
                    error: None,
                }
            }
            Err(e) => {
                let (attempts, character_id) = match &e {
                    GuardError::Operation(failure) => (failure.attempts, failure.character_id),
                    _ => (0, None),
                };
                if let Err(release_err) = self.curation.release_claim(item.id).await {
                    error!(item_id = %item.id, error = %release_err, "Failed to release curated image claim");
                }
                error!(
                    item_id = %item.id,
                    character_id = ?character_id,
                    attempts,
                    error = %e,
                    "Batch item failed, returned to the approved pool"
                );
                ItemResult {
                    item_id: item.id,
                    character_id,
                    success: false,
                    attempts,
                    images: 0,
                    duration_ms,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Up to `1 + max_retries` attempts. A DRAFT character left by an earlier
    /// attempt or run is reused; stages it already has are skipped.
    async fn attempt_item(
        &self,
        item: &CuratedImageItem,
        request: &BatchRequest,
        progress: &dyn ProgressSink,
    ) -> Result<ItemSuccess, ItemFailure> {
        let mut character: Option<Character> = None;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.attempt_once(item, request.user_id, &mut character, progress).await {
                Ok((character_id, images)) => {
                    return Ok(ItemSuccess {
                        attempts,
                        character_id,
                        images,
                    })
                }
                Err(cause) if cause.is_retryable() && attempts <= request.max_retries => {
                    warn!(item_id = %item.id, attempt = attempts, error = %cause, "Batch item attempt failed, retrying");
                    if !request.delay_between.is_zero() {
                        sleep(request.delay_between).await;
                    }
                }
                Err(cause) => {
                    return Err(ItemFailure {
                        attempts,
                        character_id: character.map(|c| c.id),
                        cause,
                    })
                }
            }
        }
    }

    async fn attempt_once(
        &self,
        item: &CuratedImageItem,
        user_id: Uuid,
        slot: &mut Option<Character>,
        progress: &dyn ProgressSink,
    ) -> Result<(Uuid, usize), BatchError> {
        if slot.is_none() {
            *slot = self.characters.draft_for_source(item.id, user_id).await?;
            if let Some(existing) = slot.as_ref() {
                info!(item_id = %item.id, character_id = %existing.id, "Resuming drafted character");
            }
        }

        let character = match slot.clone() {
            Some(existing) => existing,
            None => {
                let draft = self.drafter.draft(item).await.map_err(BatchError::Draft)?;
                let created = self
                    .characters
                    .create_character(&NewCharacter {
                        user_id,
                        name: draft.name,
                        description: draft.description,
                        prompt: draft.appearance_prompt,
                        lora: draft.lora,
                        source_image_id: Some(item.id),
                    })
                    .await?;
                info!(item_id = %item.id, character_id = %created.id, name = %created.name, "Character drafted");
                slot.insert(created).clone()
            }
        };

        let outcome = self.stages.run(&character, &[], false, progress).await?;
        self.curation.complete_item(item.id, character.id).await?;
        Ok((character.id, outcome.completed_stages()))
    }

    /// Quota-bound run for the hourly schedule. Successes are counted from
    /// logs scheduled on the UTC day of `run.scheduled_at`; once `daily_limit` is
    /// met only a zero-target marker log is written.
    pub async fn run_scheduled(
        &self,
        run: &ScheduledRun,
        progress: &dyn ProgressSink,
    ) -> Result<ScheduledBatchOutcome, BatchError> {
        let (scheduled_at, daily_limit) = (run.scheduled_at, run.daily_limit);
        let day_start = scheduled_at.date_naive().and_time(NaiveTime::MIN).and_utc();
        let day_end = day_start + chrono::Duration::days(1);
        let generated_today = self
            .logs
            .successes_scheduled_between(day_start, day_end)
            .await?
            .clamp(0, i64::from(u32::MAX)) as u32;

        if generated_today >= daily_limit {
            let marker = self.logs.create_log(scheduled_at, 0).await?;
            self.logs.finish_log(marker.id, 0, 0, 0, None).await?;
            info!(daily_limit, generated_today, log_id = %marker.id, "Daily generation limit reached, skipping run");
            return Ok(ScheduledBatchOutcome::skipped(marker.id, daily_limit, generated_today));
        }

        let target_count = run.batch_size.min((daily_limit - generated_today) as usize);
        let log = self
            .logs
            .create_log(scheduled_at, i32::try_from(target_count).unwrap_or(i32::MAX))
            .await?;
        info!(daily_limit, generated_today, target_count, log_id = %log.id, "Scheduled batch started");

        let started = Instant::now();
        let request = BatchRequest {
            count: target_count,
            user_id: run.user_id,
            cost: run.cost,
            specific_image_ids: None,
            max_retries: self.settings.scheduled_max_retries,
            delay_between: self.settings.scheduled_delay,
        };
        let result = self.generate_batch(&request, progress).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(outcome) => {
                self.logs
                    .finish_log(
                        log.id,
                        outcome.success_count as i32,
                        outcome.failure_count as i32,
                        duration_ms,
                        None,
                    )
                    .await?;
                Ok(ScheduledBatchOutcome::Ran {
                    log_id: log.id,
                    target_count,
                    outcome,
                })
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(log_err) = self.logs.finish_log(log.id, 0, 0, duration_ms, Some(&message)).await {
                    error!(log_id = %log.id, error = %log_err, "Failed to close batch generation log");
                }
                Err(e)
            }
        }
    }
}

/// Wraps stage progress of the current item into batch progress.
struct BatchItemProgress<'a> {
    inner: &'a dyn ProgressSink,
    item_index: usize,
    total_items: usize,
    succeeded: usize,
    failed: usize,
}

impl BatchItemProgress<'_> {
    fn report_item(&self) {
        self.inner.report(self.batch(None));
    }

    fn batch(&self, stage: Option<StageProgress>) -> JobProgress {
        JobProgress::Batch {
            item_index: self.item_index,
            total_items: self.total_items,
            succeeded: self.succeeded,
            failed: self.failed,
            stage,
        }
    }
}

impl ProgressSink for BatchItemProgress<'_> {
    fn report(&self, progress: JobProgress) {
        let stage = match progress {
            JobProgress::Stage(stage) => Some(stage),
            _ => None,
        };
        self.inner.report(self.batch(stage));
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Character draft failed: {0}")]
    Draft(#[source] ProviderError),

    #[error(transparent)]
    Stage(#[from] StageError),
}

impl BatchError {
    /// A lost race for the item will not resolve itself on retry.
    fn is_retryable(&self) -> bool {
        !matches!(self, BatchError::Store(StoreError::Conflict(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::character::ImageView;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<JobProgress>>);

    impl ProgressSink for Recorder {
        fn report(&self, progress: JobProgress) {
            self.0.lock().unwrap().push(progress);
        }
    }

    #[test]
    fn stage_progress_is_nested_in_batch_progress() {
        let recorder = Recorder::default();
        let adapter = BatchItemProgress {
            inner: &recorder,
            item_index: 2,
            total_items: 3,
            succeeded: 1,
            failed: 0,
        };
        let stage = StageProgress {
            stage_index: 2,
            total_stages: 4,
            label: ImageView::Front,
            message: "front view generated".to_string(),
            completed_images: 2,
        };
        adapter.report(JobProgress::Stage(stage.clone()));
        adapter.report(JobProgress::Percent { value: 10 });

        let seen = recorder.0.lock().unwrap();
        assert_eq!(
            seen[0],
            JobProgress::Batch {
                item_index: 2,
                total_items: 3,
                succeeded: 1,
                failed: 0,
                stage: Some(stage),
            }
        );
        assert!(matches!(seen[1], JobProgress::Batch { stage: None, .. }));
    }

    #[test]
    fn conflicts_are_not_retried() {
        assert!(!BatchError::Store(StoreError::Conflict("linked".into())).is_retryable());
        assert!(BatchError::Draft(ProviderError::Parse("bad".into())).is_retryable());
    }
}
