//! Worker-side dispatch of queued jobs to the pipelines.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::config::RuntimeSettings;
use crate::db::store::SettingsStore;
use crate::db::StoreError;
use crate::models::batch::{BatchRequest, ScheduledRun};
use crate::models::job::{
    BatchGenerate, CurationRun, DailyCreditGrant, GenerateCharacterImages, Job, JobPayload,
    MonthlyCreditSnapshot, ScheduledBatchGenerate,
};
use crate::services::batch::{BatchError, BatchGenerator};
use crate::services::credits::{previous_period, CreditLedger, GuardError, LedgerError};
use crate::services::curation::{CurationError, CurationPipeline};
use crate::services::queue::{BoxError, JobHandler, ProgressHandle, ProgressSink};
use crate::services::stages::{MultiStageGenerator, StageError};

/// Holds older than this are assumed orphaned by a crashed worker.
const DEFAULT_STALE_HOLD_HOURS: i64 = 6;

/// Routes every [`JobPayload`] variant to its pipeline. Registered as the
/// handler of all worker queues.
pub struct JobDispatcher {
    settings_store: Arc<dyn SettingsStore>,
    fallback: RuntimeSettings,
    ledger: CreditLedger,
    stages: Arc<MultiStageGenerator>,
    batch: Arc<BatchGenerator>,
    curation: Arc<CurationPipeline>,
    system_user_id: Uuid,
    stale_hold_age: chrono::Duration,
}

impl JobDispatcher {
    pub fn new(
        settings_store: Arc<dyn SettingsStore>,
        fallback: RuntimeSettings,
        ledger: CreditLedger,
        stages: Arc<MultiStageGenerator>,
        batch: Arc<BatchGenerator>,
        curation: Arc<CurationPipeline>,
        system_user_id: Uuid,
    ) -> Self {
        Self {
            settings_store,
            fallback,
            ledger,
            stages,
            batch,
            curation,
            system_user_id,
            stale_hold_age: chrono::Duration::hours(DEFAULT_STALE_HOLD_HOURS),
        }
    }

    pub fn with_stale_hold_age(mut self, age: chrono::Duration) -> Self {
        self.stale_hold_age = age;
        self
    }

    async fn settings(&self) -> Result<RuntimeSettings, JobError> {
        Ok(RuntimeSettings::load(self.settings_store.as_ref(), self.fallback.clone()).await?)
    }

    pub async fn dispatch(&self, job: &Job, progress: &ProgressHandle) -> Result<serde_json::Value, JobError> {
        match &job.payload {
            JobPayload::GenerateCharacterImages(payload) => self.generate_character_images(payload, progress).await,
            JobPayload::BatchGenerate(payload) => self.batch_generate(payload, progress).await,
            JobPayload::ScheduledBatchGenerate(payload) => self.scheduled_batch(job, payload, progress).await,
            JobPayload::CurationRun(payload) => self.curation_run(payload).await,
            JobPayload::DailyCreditGrant(payload) => self.daily_credit_grant(job, payload).await,
            JobPayload::MonthlyCreditSnapshot(payload) => self.monthly_snapshot(job, payload).await,
        }
    }

    async fn generate_character_images(
        &self,
        payload: &GenerateCharacterImages,
        progress: &ProgressHandle,
    ) -> Result<serde_json::Value, JobError> {
        let settings = self.settings().await?;
        let reason = format!("image generation for character {}", payload.character_id);
        let sink: &dyn ProgressSink = progress;
        let stages = self.stages.as_ref();
        let (character_id, requested, regenerate) = (payload.character_id, payload.stages.as_slice(), payload.regenerate);

        let outcome = self
            .ledger
            .with_credits(payload.user_id, settings.character_generation_cost, &reason, move || {
                stages.generate_for_character(character_id, requested, regenerate, sink)
            })
            .await?;

        info!(
            character_id = %payload.character_id,
            generated = outcome.generated.len(),
            skipped = outcome.skipped.len(),
            "Character images generated"
        );
        Ok(serde_json::to_value(&outcome)?)
    }

    async fn batch_generate(&self, payload: &BatchGenerate, progress: &ProgressHandle) -> Result<serde_json::Value, JobError> {
        let settings = self.settings().await?;
        let request = BatchRequest {
            count: payload.count,
            user_id: payload.user_id,
            cost: settings.character_generation_cost,
            specific_image_ids: payload.specific_image_ids.clone(),
            max_retries: payload.max_retries,
            delay_between: Duration::from_millis(payload.delay_between_ms),
        };
        let outcome = self.batch.generate_batch(&request, progress).await?;
        Ok(serde_json::to_value(&outcome)?)
    }

    async fn scheduled_batch(
        &self,
        job: &Job,
        payload: &ScheduledBatchGenerate,
        progress: &ProgressHandle,
    ) -> Result<serde_json::Value, JobError> {
        let settings = self.settings().await?;
        if !settings.batch_generation_enabled {
            info!(job_id = %job.id, "Batch generation disabled, ignoring scheduled run");
            return Ok(json!({ "status": "disabled" }));
        }

        let run = ScheduledRun {
            scheduled_at: job.created_at,
            batch_size: payload.batch_size.unwrap_or(settings.batch_generation_size),
            daily_limit: settings.daily_generation_limit,
            user_id: self.system_user_id,
            cost: settings.character_generation_cost,
        };
        let outcome = self.batch.run_scheduled(&run, progress).await?;
        info!(
            job_id = %job.id,
            log_id = %outcome.log_id(),
            succeeded = outcome.outcome().success_count,
            failed = outcome.outcome().failure_count,
            "Scheduled batch finished"
        );
        Ok(serde_json::to_value(&outcome)?)
    }

    async fn curation_run(&self, payload: &CurationRun) -> Result<serde_json::Value, JobError> {
        let settings = self.settings().await?;
        let report = self
            .curation
            .run(
                payload.fetch_limit.unwrap_or(settings.curation_fetch_limit),
                Some(payload.process_limit.unwrap_or(settings.curation_process_limit)),
            )
            .await?;
        Ok(serde_json::to_value(&report)?)
    }

    async fn daily_credit_grant(&self, job: &Job, payload: &DailyCreditGrant) -> Result<serde_json::Value, JobError> {
        let settings = self.settings().await?;
        let amount = payload.amount.unwrap_or(settings.daily_credit_grant);
        let grant = self
            .ledger
            .grant_daily_allowance(amount, job.created_at.date_naive())
            .await?;
        let reconcile = self.ledger.reconcile_stale_holds(self.stale_hold_age).await?;
        Ok(json!({ "grant": grant, "reconcile": reconcile }))
    }

    async fn monthly_snapshot(&self, job: &Job, payload: &MonthlyCreditSnapshot) -> Result<serde_json::Value, JobError> {
        let period = payload
            .period
            .clone()
            .unwrap_or_else(|| previous_period(job.created_at.date_naive()));
        let written = self.ledger.snapshot_balances(&period).await?;
        Ok(json!({ "period": period, "snapshots": written }))
    }
}

#[async_trait]
impl JobHandler for JobDispatcher {
    async fn handle(&self, job: &Job, progress: ProgressHandle) -> Result<serde_json::Value, BoxError> {
        Ok(self.dispatch(job, &progress).await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("Invalid credit cost: {0}")]
    InvalidCost(i64),

    #[error("Credit debit failed: {0}")]
    Debit(#[source] StoreError),

    #[error("Settings error: {0}")]
    Settings(#[from] StoreError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Curation(#[from] CurationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Failed to encode job result: {0}")]
    Result(#[from] serde_json::Error),
}

impl From<GuardError<StageError>> for JobError {
    fn from(err: GuardError<StageError>) -> Self {
        match err {
            GuardError::InsufficientCredits { balance, required } => JobError::InsufficientCredits { balance, required },
            GuardError::InvalidCost(cost) => JobError::InvalidCost(cost),
            GuardError::Debit(e) => JobError::Debit(e),
            GuardError::Operation(e) => JobError::Stage(e),
        }
    }
}
