use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::job::{Job, JobProgress, QueueCounts, ScheduleEntry};
use crate::services::queue::QueueError;

/// Fire claims outlive any plausible clock skew between workers.
pub const FIRE_CLAIM_TTL_SECS: u64 = 2 * 24 * 60 * 60;

/// Finished jobs kept per queue and state before the oldest are dropped.
pub const DEFAULT_FINISHED_RETENTION: usize = 1_000;

/// Storage and ordering of jobs and repeat schedules.
///
/// `pop` must hand each waiting job to exactly one caller, even when several
/// processes share the backend.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store a new job in state `waiting`.
    async fn push(&self, job: &Job) -> Result<(), QueueError>;

    /// Take the next waiting job of `queue` (highest priority, then oldest)
    /// and mark it `active`.
    async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError>;

    async fn set_progress(&self, queue: &str, job_id: Uuid, progress: &JobProgress) -> Result<(), QueueError>;

    /// Move an active job to `completed`, or drop it entirely when `remove` is set.
    /// Only the newest finished jobs of each state are retained.
    async fn complete(
        &self,
        queue: &str,
        job_id: Uuid,
        result: Option<serde_json::Value>,
        remove: bool,
    ) -> Result<(), QueueError>;

    /// Move an active job to `failed`, or drop it entirely when `remove` is set.
    async fn fail(&self, queue: &str, job_id: Uuid, error: &str, remove: bool) -> Result<(), QueueError>;

    async fn get_job(&self, queue: &str, job_id: Uuid) -> Result<Option<Job>, QueueError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError>;

    /// Delete a job in any state. Returns whether it existed.
    async fn remove_job(&self, queue: &str, job_id: Uuid) -> Result<bool, QueueError>;

    async fn put_schedule(&self, entry: &ScheduleEntry) -> Result<(), QueueError>;

    async fn remove_schedule(&self, key: &str) -> Result<bool, QueueError>;

    async fn schedules(&self) -> Result<Vec<ScheduleEntry>, QueueError>;

    /// Claim the right to materialize `key` at `fire_at`. Only the first
    /// caller for a given pair gets `true`.
    async fn claim_fire(&self, key: &str, fire_at: DateTime<Utc>) -> Result<bool, QueueError>;

    /// Give back a claim whose job could not be enqueued.
    async fn release_fire(&self, key: &str, fire_at: DateTime<Utc>) -> Result<(), QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}
