use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::character::ImageView;

/// Queue for GPU-bound image generation. One job at a time: the downstream
/// generator is a single serial resource.
pub const IMAGE_GENERATION_QUEUE: &str = "image-generation";

/// Queue for candidate ingestion and classification.
pub const CURATION_QUEUE: &str = "curation";

/// Queue for ledger housekeeping (grants, snapshots, reconciliation).
pub const USAGE_PROCESSING_QUEUE: &str = "usage-processing";

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

/// Progress of a single stage of the multi-view pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageProgress {
    pub stage_index: usize,
    pub total_stages: usize,
    pub label: ImageView,
    pub message: String,
    pub completed_images: usize,
}

/// Progress value visible to observers of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobProgress {
    Percent { value: u8 },
    Stage(StageProgress),
    Batch {
        item_index: usize,
        total_items: usize,
        succeeded: usize,
        failed: usize,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        stage: Option<StageProgress>,
    },
}

/// Generate (part of) the image set of one existing character, paid by the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerateCharacterImages {
    pub character_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub stages: Vec<ImageView>,
    #[serde(default)]
    pub regenerate: bool,
}

/// On-demand batch generation from approved curated images.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchGenerate {
    pub count: usize,
    pub user_id: Uuid,
    #[serde(default)]
    pub specific_image_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub delay_between_ms: u64,
}

/// Hourly generation tick, subject to the daily cap. Batch size and limit are
/// read from runtime settings when the job runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScheduledBatchGenerate {
    #[serde(default)]
    pub batch_size: Option<usize>,
}

/// Fetch new candidates from the image source and classify pending ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CurationRun {
    #[serde(default)]
    pub fetch_limit: Option<usize>,
    #[serde(default)]
    pub process_limit: Option<usize>,
}

/// Grant the daily allowance and reconcile stale credit holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DailyCreditGrant {
    #[serde(default)]
    pub amount: Option<i64>,
}

/// Snapshot every user's balance for a `YYYY-MM` period (defaults to the
/// month that just ended).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MonthlyCreditSnapshot {
    #[serde(default)]
    pub period: Option<String>,
}

/// Job payloads, keyed by job name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "name", content = "data", rename_all = "snake_case")]
pub enum JobPayload {
    GenerateCharacterImages(GenerateCharacterImages),
    BatchGenerate(BatchGenerate),
    ScheduledBatchGenerate(ScheduledBatchGenerate),
    CurationRun(CurationRun),
    DailyCreditGrant(DailyCreditGrant),
    MonthlyCreditSnapshot(MonthlyCreditSnapshot),
}

impl JobPayload {
    /// Job name as stored alongside the job and shown on the status surface.
    pub fn name(&self) -> &'static str {
        match self {
            JobPayload::GenerateCharacterImages(_) => "generate_character_images",
            JobPayload::BatchGenerate(_) => "batch_generate",
            JobPayload::ScheduledBatchGenerate(_) => "scheduled_batch_generate",
            JobPayload::CurationRun(_) => "curation_run",
            JobPayload::DailyCreditGrant(_) => "daily_credit_grant",
            JobPayload::MonthlyCreditSnapshot(_) => "monthly_credit_snapshot",
        }
    }

    /// Queue this kind of job is processed on.
    pub fn queue(&self) -> &'static str {
        match self {
            JobPayload::GenerateCharacterImages(_)
            | JobPayload::BatchGenerate(_)
            | JobPayload::ScheduledBatchGenerate(_) => IMAGE_GENERATION_QUEUE,
            JobPayload::CurationRun(_) => CURATION_QUEUE,
            JobPayload::DailyCreditGrant(_) | JobPayload::MonthlyCreditSnapshot(_) => {
                USAGE_PROCESSING_QUEUE
            }
        }
    }
}

/// Per-job enqueue options.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobOptions {
    /// Higher values are dispatched first. FIFO within equal priority.
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub remove_on_complete: bool,
    #[serde(default)]
    pub remove_on_fail: bool,
    /// Set by the scheduler on jobs it materializes from a repeat schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_key: Option<String>,
}

/// One unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub name: String,
    pub payload: JobPayload,
    pub options: JobOptions,
    pub state: JobState,
    pub progress: Option<JobProgress>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl Job {
    pub fn new(queue: &str, payload: JobPayload, options: JobOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            name: payload.name().to_string(),
            payload,
            options,
            state: JobState::Waiting,
            progress: None,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            error: None,
            result: None,
        }
    }
}

/// Dispatch rate ceiling: at most `max` job starts per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

/// Static configuration of a consumed queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub name: String,
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
}

impl QueueDefinition {
    pub fn new(name: &str, concurrency: usize) -> Self {
        Self {
            name: name.to_string(),
            concurrency,
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(mut self, max: u32, window: Duration) -> Self {
        self.rate_limit = Some(RateLimit { max, window });
        self
    }

    /// The queues consumed by the worker process.
    pub fn defaults() -> Vec<QueueDefinition> {
        vec![
            QueueDefinition::new(IMAGE_GENERATION_QUEUE, 1),
            QueueDefinition::new(CURATION_QUEUE, 1).with_rate_limit(10, Duration::from_secs(60)),
            QueueDefinition::new(USAGE_PROCESSING_QUEUE, 2),
        ]
    }
}

/// A repeat schedule persisted in the queue backend. Each fire time of `cron`
/// materializes one job with `payload` on `queue`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    pub key: String,
    pub cron: String,
    pub queue: String,
    pub payload: JobPayload,
    #[serde(default)]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
}

/// Per-state job counts of one queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}
