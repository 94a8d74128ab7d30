use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::character::ImageView;
use crate::models::job::{Job, JobProgress, JobState};

/// Body of `POST /api/v1/characters/{character_id}/images`.
#[derive(Debug, Deserialize, Validate)]
pub struct GenerateImagesRequest {
    #[garde(skip)]
    pub user_id: Uuid,

    /// Empty means every view.
    #[garde(length(max = 4))]
    #[serde(default)]
    pub stages: Vec<ImageView>,

    #[garde(skip)]
    #[serde(default)]
    pub regenerate: bool,
}

/// Body of `POST /api/v1/admin/batch-generation`.
#[derive(Debug, Deserialize, Validate)]
pub struct BatchGenerationRequest {
    #[garde(range(min = 1, max = 100))]
    pub count: usize,

    /// Defaults to the platform account.
    #[garde(skip)]
    #[serde(default)]
    pub user_id: Option<Uuid>,

    #[garde(length(min = 1, max = 100))]
    #[serde(default)]
    pub specific_image_ids: Option<Vec<Uuid>>,

    #[garde(range(max = 5))]
    #[serde(default)]
    pub max_retries: u32,

    #[garde(range(max = 60_000))]
    #[serde(default)]
    pub delay_between_ms: u64,
}

/// Body of `POST /api/v1/admin/curation/run`.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct CurationRunRequest {
    #[garde(range(min = 1, max = 200))]
    #[serde(default)]
    pub fetch_limit: Option<usize>,

    #[garde(range(min = 1, max = 500))]
    #[serde(default)]
    pub process_limit: Option<usize>,
}

/// Body of `PUT /api/v1/admin/settings/{key}`.
#[derive(Debug, Deserialize, Validate)]
pub struct SettingValue {
    #[garde(length(min = 1, max = 200))]
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
    pub queue: String,
    pub name: String,
    pub state: JobState,
}

impl From<&Job> for EnqueueResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            queue: job.queue.clone(),
            name: job.name.clone(),
            state: job.state,
        }
    }
}

/// Job status as shown to monitoring clients.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub queue: String,
    pub name: String,
    pub state: JobState,
    pub progress: Option<JobProgress>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            queue: job.queue,
            name: job.name,
            state: job.state,
            progress: job.progress,
            created_at: job.created_at,
            processed_at: job.processed_at,
            finished_at: job.finished_at,
            result: job.result,
            error: job.error,
        }
    }
}
