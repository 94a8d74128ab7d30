mod fixtures;
mod helpers;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use charforge::config::runtime::{BATCH_GENERATION_ENABLED, CHARACTER_GENERATION_COST};
use charforge::db::store::{CharacterStore, SettingsStore};
use charforge::models::character::NewCharacter;
use charforge::models::job::{
    DailyCreditGrant, GenerateCharacterImages, Job, JobOptions, JobPayload, JobProgress, JobState,
    QueueDefinition, ScheduledBatchGenerate, IMAGE_GENERATION_QUEUE, USAGE_PROCESSING_QUEUE,
};
use charforge::services::curation::{CurationPipeline, CurationPolicy};
use charforge::services::jobs::JobDispatcher;
use charforge::services::queue::{
    BoxError, JobHandler, MemoryQueueBackend, ProgressHandle, QueueBackend, QueueEngine, QueueError,
};
use charforge::services::scheduler::Scheduler;

use helpers::{eventually, runtime_settings, FakeClassifier, FakeSource, Harness};

const QUEUE: &str = "test-queue";
const WAIT: Duration = Duration::from_secs(5);

fn engine() -> QueueEngine {
    let backend: Arc<dyn QueueBackend> = Arc::new(MemoryQueueBackend::new());
    QueueEngine::with_poll_interval(backend, Duration::from_millis(20))
}

fn grant(amount: i64) -> JobPayload {
    JobPayload::DailyCreditGrant(DailyCreditGrant {
        amount: Some(amount),
    })
}

fn amount_of(job: &Job) -> i64 {
    match &job.payload {
        JobPayload::DailyCreditGrant(payload) => payload.amount.unwrap_or_default(),
        _ => 0,
    }
}

async fn state_of(engine: &QueueEngine, queue: &str, job_id: Uuid) -> Option<JobState> {
    engine
        .get_queue(queue)
        .get_job(job_id)
        .await
        .unwrap()
        .map(|j| j.state)
}

/// Sleeps for `hold`, tracking how many jobs overlap and when each started.
#[derive(Default)]
struct TrackingHandler {
    hold: Duration,
    running: AtomicUsize,
    max_running: AtomicUsize,
    starts: Mutex<Vec<Instant>>,
    order: Mutex<Vec<i64>>,
}

impl TrackingHandler {
    fn holding(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            hold,
            ..Self::default()
        })
    }
}

#[async_trait]
impl JobHandler for TrackingHandler {
    async fn handle(&self, job: &Job, _progress: ProgressHandle) -> Result<serde_json::Value, BoxError> {
        self.starts.lock().unwrap().push(Instant::now());
        self.order.lock().unwrap().push(amount_of(job));
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.hold).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "amount": amount_of(job) }))
    }
}

struct FailingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn handle(&self, _job: &Job, _progress: ProgressHandle) -> Result<serde_json::Value, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err("provider exploded".into())
    }
}

struct PanickingHandler;

#[async_trait]
impl JobHandler for PanickingHandler {
    async fn handle(&self, _job: &Job, _progress: ProgressHandle) -> Result<serde_json::Value, BoxError> {
        panic!("kaboom");
    }
}

/// Reports progress, then waits until released.
struct GatedHandler {
    release: Notify,
}

#[async_trait]
impl JobHandler for GatedHandler {
    async fn handle(&self, _job: &Job, progress: ProgressHandle) -> Result<serde_json::Value, BoxError> {
        progress.update(JobProgress::Percent { value: 50 });
        self.release.notified().await;
        Ok(json!({ "done": true }))
    }
}

#[tokio::test]
async fn concurrency_limit_is_never_exceeded() {
    let engine = &engine();
    let handler = TrackingHandler::holding(Duration::from_millis(100));
    engine
        .register_worker(QueueDefinition::new(QUEUE, 2), handler.clone())
        .unwrap();

    for n in 0..6 {
        engine.add_job(QUEUE, grant(n), JobOptions::default()).await.unwrap();
    }

    let queue = &engine.get_queue(QUEUE);
    assert!(eventually(WAIT, move || async move { queue.counts().await.unwrap().completed == 6 }).await);
    assert_eq!(handler.max_running.load(Ordering::SeqCst), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn rate_limit_spaces_job_starts() {
    let engine = &engine();
    let handler = TrackingHandler::holding(Duration::ZERO);
    engine
        .register_worker(
            QueueDefinition::new(QUEUE, 5).with_rate_limit(2, Duration::from_millis(500)),
            handler.clone(),
        )
        .unwrap();

    let started = Instant::now();
    for n in 0..5 {
        engine.add_job(QUEUE, grant(n), JobOptions::default()).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(handler.starts.lock().unwrap().len(), 2);

    let queue = &engine.get_queue(QUEUE);
    assert!(eventually(WAIT, move || async move { queue.counts().await.unwrap().completed == 5 }).await);
    let starts = handler.starts.lock().unwrap().clone();
    for pair in starts.windows(3) {
        assert!(pair[2].duration_since(pair[0]) >= Duration::from_millis(450));
    }
    assert!(started.elapsed() >= Duration::from_millis(950));
    engine.shutdown().await;
}

#[tokio::test]
async fn progress_is_visible_while_the_job_runs() {
    let engine = &engine();
    let handler = Arc::new(GatedHandler { release: Notify::new() });
    engine
        .register_worker(QueueDefinition::new(QUEUE, 1), handler.clone())
        .unwrap();

    let job = engine.add_job(QUEUE, grant(1), JobOptions::default()).await.unwrap();
    let job_id = job.id;
    let queue = &engine.get_queue(QUEUE);

    assert!(
        eventually(WAIT, move || async move {
            queue
                .get_job(job_id)
                .await
                .unwrap()
                .is_some_and(|j| j.state == JobState::Active && j.progress == Some(JobProgress::Percent { value: 50 }))
        })
        .await
    );

    handler.release.notify_one();
    assert!(eventually(WAIT, move || async move { state_of(engine, QUEUE, job_id).await == Some(JobState::Completed) }).await);
    let finished = queue.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(finished.result, Some(json!({ "done": true })));
    assert!(finished.finished_at.is_some());
    engine.shutdown().await;
}

#[tokio::test]
async fn panicking_handler_fails_the_job_and_the_worker_survives() {
    let engine = &engine();
    engine
        .register_worker(QueueDefinition::new(QUEUE, 1), Arc::new(PanickingHandler))
        .unwrap();

    let first = engine.add_job(QUEUE, grant(1), JobOptions::default()).await.unwrap();
    let second = engine.add_job(QUEUE, grant(2), JobOptions::default()).await.unwrap();

    let queue = &engine.get_queue(QUEUE);
    assert!(eventually(WAIT, move || async move { queue.counts().await.unwrap().failed == 2 }).await);
    for id in [first.id, second.id] {
        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.error.as_deref(), Some("handler panicked: kaboom"));
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn handler_error_fails_the_job_without_retry() {
    let engine = &engine();
    let handler = Arc::new(FailingHandler {
        calls: AtomicUsize::new(0),
    });
    engine
        .register_worker(QueueDefinition::new(QUEUE, 1), handler.clone())
        .unwrap();

    let job = engine.add_job(QUEUE, grant(1), JobOptions::default()).await.unwrap();
    let job_id = job.id;
    assert!(eventually(WAIT, move || async move { state_of(engine, QUEUE, job_id).await == Some(JobState::Failed) }).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    let failed = engine.get_queue(QUEUE).get_job(job_id).await.unwrap().unwrap();
    assert_eq!(failed.error.as_deref(), Some("provider exploded"));
    engine.shutdown().await;
}

#[tokio::test]
async fn higher_priority_jobs_run_first() {
    let engine = &engine();
    engine.add_job(QUEUE, grant(1), JobOptions::default()).await.unwrap();
    engine.add_job(QUEUE, grant(2), JobOptions::default()).await.unwrap();
    engine
        .add_job(
            QUEUE,
            grant(3),
            JobOptions {
                priority: 10,
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    let handler = TrackingHandler::holding(Duration::ZERO);
    engine
        .register_worker(QueueDefinition::new(QUEUE, 1), handler.clone())
        .unwrap();

    let queue = &engine.get_queue(QUEUE);
    assert!(eventually(WAIT, move || async move { queue.counts().await.unwrap().completed == 3 }).await);
    assert_eq!(*handler.order.lock().unwrap(), vec![3, 1, 2]);
    engine.shutdown().await;
}

#[tokio::test]
async fn completed_job_can_be_removed_automatically() {
    let engine = &engine();
    engine
        .register_worker(QueueDefinition::new(QUEUE, 1), TrackingHandler::holding(Duration::ZERO))
        .unwrap();

    let job = engine
        .add_job(
            QUEUE,
            grant(1),
            JobOptions {
                remove_on_complete: true,
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();
    let job_id = job.id;

    assert!(eventually(WAIT, move || async move { state_of(engine, QUEUE, job_id).await.is_none() }).await);
    let counts = engine.get_queue(QUEUE).counts().await.unwrap();
    assert_eq!(counts.completed, 0);
    assert_eq!(counts.waiting, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_jobs() {
    let engine = &engine();
    engine
        .register_worker(QueueDefinition::new(QUEUE, 1), TrackingHandler::holding(Duration::from_millis(200)))
        .unwrap();

    let job = engine.add_job(QUEUE, grant(1), JobOptions::default()).await.unwrap();
    let job_id = job.id;
    assert!(eventually(WAIT, move || async move { state_of(engine, QUEUE, job_id).await == Some(JobState::Active) }).await);

    engine.shutdown().await;
    assert_eq!(state_of(engine, QUEUE, job_id).await, Some(JobState::Completed));
    assert!(matches!(
        engine.register_worker(QueueDefinition::new("late", 1), TrackingHandler::holding(Duration::ZERO)),
        Err(QueueError::ShutDown)
    ));
}

#[tokio::test]
async fn invalid_worker_registrations_are_rejected() {
    let engine = &engine();
    assert!(matches!(
        engine.register_worker(QueueDefinition::new(QUEUE, 0), TrackingHandler::holding(Duration::ZERO)),
        Err(QueueError::InvalidDefinition(_))
    ));

    engine
        .register_worker(QueueDefinition::new(QUEUE, 1), TrackingHandler::holding(Duration::ZERO))
        .unwrap();
    assert!(matches!(
        engine.register_worker(QueueDefinition::new(QUEUE, 1), TrackingHandler::holding(Duration::ZERO)),
        Err(QueueError::DuplicateWorker(_))
    ));
    engine.shutdown().await;
}

#[tokio::test]
async fn schedulers_sharing_a_backend_fire_once() {
    let backend: Arc<dyn QueueBackend> = Arc::new(MemoryQueueBackend::new());
    let first = Scheduler::new(Arc::new(QueueEngine::new(backend.clone())));
    let second = Scheduler::new(Arc::new(QueueEngine::new(backend.clone())));

    let registered_at = Utc.with_ymd_and_hms(2026, 5, 10, 12, 1, 0).unwrap();
    first
        .upsert("every-five", "*/5 * * * *", grant(5), registered_at)
        .await
        .unwrap();

    let due = Utc.with_ymd_and_hms(2026, 5, 10, 12, 5, 3).unwrap();
    let (a, b) = tokio::join!(first.tick(due), second.tick(due));
    assert_eq!(a.unwrap().len() + b.unwrap().len(), 1);
    assert_eq!(backend.counts(USAGE_PROCESSING_QUEUE).await.unwrap().waiting, 1);

    // An hour of missed fire times produces one job.
    let late = Utc.with_ymd_and_hms(2026, 5, 10, 13, 7, 0).unwrap();
    assert_eq!(first.tick(late).await.unwrap().len(), 1);
    assert!(second.tick(late).await.unwrap().is_empty());
    assert_eq!(backend.counts(USAGE_PROCESSING_QUEUE).await.unwrap().waiting, 2);
}

// ---------------------------------------------------------------------------
// Job dispatch
// ---------------------------------------------------------------------------

fn dispatcher(h: &Harness) -> JobDispatcher {
    let curation = Arc::new(CurationPipeline::new(
        h.store.clone(),
        Arc::new(FakeClassifier::default()),
        Arc::new(FakeSource::returning(fixtures::source_images(0..2))),
        CurationPolicy::default(),
    ));
    JobDispatcher::new(
        h.store.clone(),
        runtime_settings(),
        h.ledger.clone(),
        h.stages.clone(),
        h.batch.clone(),
        curation,
        h.system_user,
    )
}

async fn owned_character(h: &Harness, user_id: Uuid) -> Uuid {
    h.store
        .create_character(&NewCharacter {
            user_id,
            name: "Ren".to_string(),
            description: "A sky pirate.".to_string(),
            prompt: "short red hair, goggles, leather jacket".to_string(),
            lora: None,
            source_image_id: None,
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn image_job_runs_through_the_queue_and_charges_the_stored_cost() {
    let h = Harness::new();
    h.store.put_setting(CHARACTER_GENERATION_COST, "30").await.unwrap();
    let user = h.funded_user(100).await;
    let character_id = owned_character(&h, user).await;

    let engine = &engine();
    engine
        .register_worker(QueueDefinition::new(IMAGE_GENERATION_QUEUE, 1), Arc::new(dispatcher(&h)))
        .unwrap();
    let job = engine
        .enqueue(
            JobPayload::GenerateCharacterImages(GenerateCharacterImages {
                character_id,
                user_id: user,
                stages: vec![],
                regenerate: false,
            }),
            JobOptions::default(),
        )
        .await
        .unwrap();
    let job_id = job.id;
    assert_eq!(job.queue, IMAGE_GENERATION_QUEUE);

    assert!(
        eventually(WAIT, move || async move {
            state_of(engine, IMAGE_GENERATION_QUEUE, job_id).await == Some(JobState::Completed)
        })
        .await
    );
    let done = engine
        .get_queue(IMAGE_GENERATION_QUEUE)
        .get_job(job.id)
        .await
        .unwrap()
        .unwrap();
    let result = done.result.unwrap();
    assert_eq!(result["generated"].as_array().unwrap().len(), 4);
    assert!(matches!(done.progress, Some(JobProgress::Stage(ref s)) if s.stage_index == 4));
    assert_eq!(h.ledger.balance(user).await.unwrap(), 70);
    engine.shutdown().await;
}

#[tokio::test]
async fn unfunded_image_job_fails_without_generating() {
    let h = Harness::new();
    let user = h.funded_user(0).await;
    let character_id = owned_character(&h, user).await;

    let engine = &engine();
    engine
        .register_worker(QueueDefinition::new(IMAGE_GENERATION_QUEUE, 1), Arc::new(dispatcher(&h)))
        .unwrap();
    let job = engine
        .enqueue(
            JobPayload::GenerateCharacterImages(GenerateCharacterImages {
                character_id,
                user_id: user,
                stages: vec![],
                regenerate: false,
            }),
            JobOptions::default(),
        )
        .await
        .unwrap();
    let job_id = job.id;

    assert!(
        eventually(WAIT, move || async move {
            state_of(engine, IMAGE_GENERATION_QUEUE, job_id).await == Some(JobState::Failed)
        })
        .await
    );
    let failed = engine
        .get_queue(IMAGE_GENERATION_QUEUE)
        .get_job(job.id)
        .await
        .unwrap()
        .unwrap();
    assert!(failed.error.unwrap().contains("Insufficient credits"));
    assert!(h.generator.calls().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn daily_grant_job_is_idempotent() {
    let h = Harness::new();
    let user = h.funded_user(0).await;
    let dispatcher = dispatcher(&h);
    let job = Job::new(
        USAGE_PROCESSING_QUEUE,
        JobPayload::DailyCreditGrant(DailyCreditGrant::default()),
        JobOptions::default(),
    );

    let first = dispatcher.dispatch(&job, &ProgressHandle::detached()).await.unwrap();
    assert_eq!(first["grant"]["granted"], 2);
    assert_eq!(first["reconcile"]["refunded"], 0);

    let second = dispatcher.dispatch(&job, &ProgressHandle::detached()).await.unwrap();
    assert_eq!(second["grant"]["granted"], 0);
    assert_eq!(second["grant"]["already_granted"], 2);
    assert_eq!(h.ledger.balance(user).await.unwrap(), 10);
}

#[tokio::test]
async fn scheduled_batch_is_ignored_while_disabled() {
    let h = Harness::new();
    h.store.put_setting(BATCH_GENERATION_ENABLED, "false").await.unwrap();
    h.approved_items(1).await;
    let job = Job::new(
        IMAGE_GENERATION_QUEUE,
        JobPayload::ScheduledBatchGenerate(ScheduledBatchGenerate::default()),
        JobOptions::default(),
    );

    let value = dispatcher(&h)
        .dispatch(&job, &ProgressHandle::detached())
        .await
        .unwrap();

    assert_eq!(value, json!({ "status": "disabled" }));
    assert!(h.store.characters().is_empty());
}

#[tokio::test]
async fn scheduled_batch_is_funded_by_the_system_account() {
    let h = Harness::new();
    h.approved_items(2).await;
    let job = Job::new(
        IMAGE_GENERATION_QUEUE,
        JobPayload::ScheduledBatchGenerate(ScheduledBatchGenerate::default()),
        JobOptions::default(),
    );
    let progress = ProgressHandle::detached();

    let value = dispatcher(&h).dispatch(&job, &progress).await.unwrap();

    assert_eq!(value["status"], "ran");
    assert_eq!(value["target_count"], 1);
    assert_eq!(h.store.characters().len(), 1);
    assert_eq!(h.ledger.balance(h.system_user).await.unwrap(), -50);
    assert!(matches!(progress.latest(), Some(JobProgress::Batch { succeeded: 1, .. })));
}
