//! Recurring jobs: cron schedules persisted in the queue backend and
//! materialized as ordinary jobs at their fire times.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::RuntimeSettings;
use crate::db::store::SettingsStore;
use crate::db::StoreError;
use crate::models::job::{
    CurationRun, DailyCreditGrant, Job, JobOptions, JobPayload, MonthlyCreditSnapshot,
    ScheduleEntry, ScheduledBatchGenerate,
};
use crate::services::cron::{CronError, CronSchedule};
use crate::services::queue::{QueueBackend, QueueEngine, QueueError};

pub const DAILY_CREDIT_GRANT: &str = "daily-credit-grant";
pub const MONTHLY_CREDIT_SNAPSHOT: &str = "monthly-credit-snapshot";
pub const HOURLY_BATCH_GENERATION: &str = "hourly-batch-generation";
pub const DAILY_CURATION: &str = "daily-curation";

const DAILY_CREDIT_GRANT_CRON: &str = "0 0 * * *";
const MONTHLY_CREDIT_SNAPSHOT_CRON: &str = "0 0 1 * *";

const DEFAULT_TICK: Duration = Duration::from_secs(15);
const DEFAULT_SETTINGS_REFRESH: Duration = Duration::from_secs(300);

pub struct Scheduler {
    engine: Arc<QueueEngine>,
    backend: Arc<dyn QueueBackend>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<QueueEngine>) -> Self {
        let backend = engine.backend();
        Self {
            engine,
            backend,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Create or replace the schedule `key`. An unchanged schedule keeps its
    /// pending fire time.
    pub async fn upsert(
        &self,
        key: &str,
        cron: &str,
        payload: JobPayload,
        now: DateTime<Utc>,
    ) -> Result<ScheduleEntry, SchedulerError> {
        let schedule = CronSchedule::parse(cron)?;
        let queue = payload.queue().to_string();

        let existing = self
            .backend
            .schedules()
            .await?
            .into_iter()
            .find(|e| e.key == key);

        if let Some(existing) = existing {
            if existing.cron == schedule.expression() && existing.payload == payload && existing.queue == queue {
                return Ok(existing);
            }
        }

        let next_fire_at = schedule
            .next_after(now)
            .ok_or_else(|| SchedulerError::NeverFires(cron.to_string()))?;

        let entry = ScheduleEntry {
            key: key.to_string(),
            cron: schedule.expression().to_string(),
            queue,
            payload,
            priority: 0,
            next_fire_at: Some(next_fire_at),
        };
        self.backend.put_schedule(&entry).await?;

        info!(key, cron = %entry.cron, queue = %entry.queue, next_fire_at = %next_fire_at, "Schedule registered");
        Ok(entry)
    }

    pub async fn remove(&self, key: &str) -> Result<bool, SchedulerError> {
        let removed = self.backend.remove_schedule(key).await?;
        if removed {
            info!(key, "Schedule removed");
        }
        Ok(removed)
    }

    /// Register the platform's recurring jobs. Generation and curation are only
    /// scheduled while batch generation is enabled.
    pub async fn register_defaults(&self, settings: &RuntimeSettings, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.upsert(
            DAILY_CREDIT_GRANT,
            DAILY_CREDIT_GRANT_CRON,
            JobPayload::DailyCreditGrant(DailyCreditGrant::default()),
            now,
        )
        .await?;
        self.upsert(
            MONTHLY_CREDIT_SNAPSHOT,
            MONTHLY_CREDIT_SNAPSHOT_CRON,
            JobPayload::MonthlyCreditSnapshot(MonthlyCreditSnapshot::default()),
            now,
        )
        .await?;

        if settings.batch_generation_enabled {
            self.upsert(
                HOURLY_BATCH_GENERATION,
                &settings.batch_generation_cron,
                JobPayload::ScheduledBatchGenerate(ScheduledBatchGenerate::default()),
                now,
            )
            .await?;
            self.upsert(
                DAILY_CURATION,
                &settings.curation_cron(),
                JobPayload::CurationRun(CurationRun::default()),
                now,
            )
            .await?;
        } else {
            self.remove(HOURLY_BATCH_GENERATION).await?;
            self.remove(DAILY_CURATION).await?;
        }
        Ok(())
    }

    /// Materialize every schedule due at `now`. Each fire time is claimed in
    /// the backend first, so concurrent schedulers enqueue it once. Missed
    /// fire times collapse into a single job. A schedule that fails to fire
    /// keeps its fire time and is retried on the next tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<Job>, SchedulerError> {
        let mut fired = Vec::new();

        for entry in self.backend.schedules().await? {
            let key = entry.key.clone();
            match self.fire(entry, now).await {
                Ok(Some(job)) => fired.push(job),
                Ok(None) => {}
                Err(e) => error!(key = %key, error = %e, "Schedule fire failed, retrying next tick"),
            }
        }

        Ok(fired)
    }

    async fn fire(&self, mut entry: ScheduleEntry, now: DateTime<Utc>) -> Result<Option<Job>, SchedulerError> {
        let schedule = match CronSchedule::parse(&entry.cron) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "Skipping schedule with invalid cron");
                return Ok(None);
            }
        };

        let Some(due) = entry.next_fire_at else {
            entry.next_fire_at = schedule.next_after(now);
            self.backend.put_schedule(&entry).await?;
            return Ok(None);
        };
        if due > now {
            return Ok(None);
        }

        let mut fired = None;
        if self.backend.claim_fire(&entry.key, due).await? {
            // Finished repeat jobs would otherwise pile up once per fire.
            let options = JobOptions {
                priority: entry.priority,
                remove_on_complete: true,
                repeat_key: Some(entry.key.clone()),
                ..JobOptions::default()
            };
            match self.engine.add_job(&entry.queue, entry.payload.clone(), options).await {
                Ok(job) => {
                    info!(key = %entry.key, job_id = %job.id, fire_at = %due, "Schedule fired");
                    fired = Some(job);
                }
                Err(e) => {
                    if let Err(release_err) = self.backend.release_fire(&entry.key, due).await {
                        error!(key = %entry.key, fire_at = %due, error = %release_err, "Failed to release schedule claim");
                    }
                    return Err(e.into());
                }
            }
        }

        entry.next_fire_at = schedule.next_after(now);
        self.backend.put_schedule(&entry).await?;
        Ok(fired)
    }

    /// Tick until `shutdown` flips, re-reading runtime settings periodically so
    /// toggling batch generation takes effect without a restart.
    pub async fn run(
        self,
        settings_store: Arc<dyn SettingsStore>,
        fallback: RuntimeSettings,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = interval(DEFAULT_SETTINGS_REFRESH);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first refresh tick completes immediately; registration already
        // happened at start-up.
        refresh.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = refresh.tick() => {
                    match RuntimeSettings::load(settings_store.as_ref(), fallback.clone()).await {
                        Ok(settings) => {
                            if let Err(e) = self.register_defaults(&settings, Utc::now()).await {
                                error!(error = %e, "Failed to refresh schedules");
                            }
                        }
                        Err(e) => error!(error = %e, "Failed to reload runtime settings"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Scheduler stopped");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Cron(#[from] CronError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Settings error: {0}")]
    Settings(#[from] StoreError),

    #[error("Cron expression '{0}' has no future fire time")]
    NeverFires(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{
        JobProgress, QueueCounts, CURATION_QUEUE, IMAGE_GENERATION_QUEUE, USAGE_PROCESSING_QUEUE,
    };
    use crate::services::queue::MemoryQueueBackend;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn settings(enabled: bool) -> RuntimeSettings {
        RuntimeSettings {
            batch_generation_enabled: enabled,
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

    /// Memory backend whose next `failures` pushes fail.
    struct FlakyBackend {
        inner: MemoryQueueBackend,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl QueueBackend for FlakyBackend {
        async fn push(&self, job: &Job) -> Result<(), QueueError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(QueueError::Redis(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "connection reset",
                ))));
            }
            self.inner.push(job).await
        }
        async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError> {
            self.inner.pop(queue).await
        }
        async fn set_progress(&self, queue: &str, job_id: Uuid, progress: &JobProgress) -> Result<(), QueueError> {
            self.inner.set_progress(queue, job_id, progress).await
        }
        async fn complete(
            &self,
            queue: &str,
            job_id: Uuid,
            result: Option<serde_json::Value>,
            remove: bool,
        ) -> Result<(), QueueError> {
            self.inner.complete(queue, job_id, result, remove).await
        }
        async fn fail(&self, queue: &str, job_id: Uuid, error: &str, remove: bool) -> Result<(), QueueError> {
            self.inner.fail(queue, job_id, error, remove).await
        }
        async fn get_job(&self, queue: &str, job_id: Uuid) -> Result<Option<Job>, QueueError> {
            self.inner.get_job(queue, job_id).await
        }
        async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
            self.inner.counts(queue).await
        }
        async fn remove_job(&self, queue: &str, job_id: Uuid) -> Result<bool, QueueError> {
            self.inner.remove_job(queue, job_id).await
        }
        async fn put_schedule(&self, entry: &ScheduleEntry) -> Result<(), QueueError> {
            self.inner.put_schedule(entry).await
        }
        async fn remove_schedule(&self, key: &str) -> Result<bool, QueueError> {
            self.inner.remove_schedule(key).await
        }
        async fn schedules(&self) -> Result<Vec<ScheduleEntry>, QueueError> {
            self.inner.schedules().await
        }
        async fn claim_fire(&self, key: &str, fire_at: DateTime<Utc>) -> Result<bool, QueueError> {
            self.inner.claim_fire(key, fire_at).await
        }
        async fn release_fire(&self, key: &str, fire_at: DateTime<Utc>) -> Result<(), QueueError> {
            self.inner.release_fire(key, fire_at).await
        }
        async fn ping(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn scheduler() -> (Scheduler, Arc<dyn QueueBackend>) {
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryQueueBackend::new());
        let engine = Arc::new(QueueEngine::new(backend.clone()));
        (Scheduler::new(engine), backend)
    }

    #[tokio::test]
    async fn defaults_follow_the_generation_flag() {
        let (scheduler, backend) = scheduler();
        let now = Utc.with_ymd_and_hms(2026, 5, 10, 12, 30, 0).unwrap();

        scheduler.register_defaults(&settings(true), now).await.unwrap();
        let keys: Vec<String> = backend.schedules().await.unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(
            keys,
            vec![DAILY_CREDIT_GRANT, DAILY_CURATION, HOURLY_BATCH_GENERATION, MONTHLY_CREDIT_SNAPSHOT]
        );

        let entries = backend.schedules().await.unwrap();
        let curation = entries.iter().find(|e| e.key == DAILY_CURATION).unwrap();
        assert_eq!(curation.cron, "0 3 * * *");
        assert_eq!(curation.queue, CURATION_QUEUE);
        let hourly = entries.iter().find(|e| e.key == HOURLY_BATCH_GENERATION).unwrap();
        assert_eq!(hourly.queue, IMAGE_GENERATION_QUEUE);
        assert_eq!(
            hourly.next_fire_at,
            Some(Utc.with_ymd_and_hms(2026, 5, 10, 13, 0, 0).unwrap())
        );

        scheduler.register_defaults(&settings(false), now).await.unwrap();
        let entries = backend.schedules().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.queue == USAGE_PROCESSING_QUEUE));
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected() {
        let (scheduler, _) = scheduler();
        let mut bad = settings(true);
        bad.batch_generation_cron = "every hour".to_string();

        let err = scheduler.register_defaults(&bad, Utc::now()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Cron(_)));
    }

    #[tokio::test]
    async fn due_schedule_fires_once_and_advances() {
        let (scheduler, backend) = scheduler();
        let registered_at = Utc.with_ymd_and_hms(2026, 5, 10, 23, 10, 0).unwrap();
        scheduler.register_defaults(&settings(false), registered_at).await.unwrap();

        let midnight = Utc.with_ymd_and_hms(2026, 5, 11, 0, 0, 20).unwrap();
        let fired = scheduler.tick(midnight).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].name, "daily_credit_grant");
        assert_eq!(fired[0].options.repeat_key.as_deref(), Some(DAILY_CREDIT_GRANT));

        assert!(scheduler.tick(midnight).await.unwrap().is_empty());
        let grant = backend
            .schedules()
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.key == DAILY_CREDIT_GRANT)
            .unwrap();
        assert_eq!(
            grant.next_fire_at,
            Some(Utc.with_ymd_and_hms(2026, 5, 12, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn failed_enqueue_is_retried_on_the_next_tick() {
        let backend: Arc<dyn QueueBackend> = Arc::new(FlakyBackend {
            inner: MemoryQueueBackend::new(),
            failures: AtomicUsize::new(1),
        });
        let scheduler = Scheduler::new(Arc::new(QueueEngine::new(backend.clone())));
        let registered_at = Utc.with_ymd_and_hms(2026, 5, 10, 23, 10, 0).unwrap();
        scheduler.register_defaults(&settings(false), registered_at).await.unwrap();

        // Both default schedules are due; only the first push fails.
        let first_of_month = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 5).unwrap();
        let fired = scheduler.tick(first_of_month).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].options.repeat_key.as_deref(), Some(MONTHLY_CREDIT_SNAPSHOT));

        let grant = backend
            .schedules()
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.key == DAILY_CREDIT_GRANT)
            .unwrap();
        assert_eq!(grant.next_fire_at, Some(Utc.with_ymd_and_hms(2026, 5, 11, 0, 0, 0).unwrap()));

        let retried = scheduler.tick(first_of_month).await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].options.repeat_key.as_deref(), Some(DAILY_CREDIT_GRANT));
        assert!(scheduler.tick(first_of_month).await.unwrap().is_empty());
        assert_eq!(backend.counts(USAGE_PROCESSING_QUEUE).await.unwrap().waiting, 2);
    }

    #[tokio::test]
    async fn scheduled_jobs_are_removed_once_complete() {
        let (scheduler, backend) = scheduler();
        let registered_at = Utc.with_ymd_and_hms(2026, 5, 10, 23, 10, 0).unwrap();
        scheduler.register_defaults(&settings(false), registered_at).await.unwrap();

        let fired = scheduler
            .tick(Utc.with_ymd_and_hms(2026, 5, 11, 0, 0, 20).unwrap())
            .await
            .unwrap();
        assert!(fired[0].options.remove_on_complete);

        let job = backend.pop(USAGE_PROCESSING_QUEUE).await.unwrap().unwrap();
        backend
            .complete(USAGE_PROCESSING_QUEUE, job.id, None, job.options.remove_on_complete)
            .await
            .unwrap();
        assert!(backend.get_job(USAGE_PROCESSING_QUEUE, job.id).await.unwrap().is_none());
        assert_eq!(backend.counts(USAGE_PROCESSING_QUEUE).await.unwrap().completed, 0);
    }
}
