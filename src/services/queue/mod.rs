//! Named job queues with bounded concurrency, rate limits and progress.
//!
//! [`QueueEngine`] owns one dispatcher task per registered queue. Jobs live in
//! a [`QueueBackend`]: Redis in production, memory in tests.

pub mod backend;
pub mod memory;
pub mod progress;
pub mod rate_limit;
pub mod redis_backend;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Instant};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::models::job::{Job, JobOptions, JobPayload, QueueCounts, QueueDefinition};

pub use backend::QueueBackend;
pub use memory::MemoryQueueBackend;
pub use progress::{NoopProgress, ProgressHandle, ProgressSink};
pub use rate_limit::RateLimiter;
pub use redis_backend::RedisQueueBackend;

/// Boxed error returned by job handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Processes the jobs of one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one job. The returned value is stored as the job result.
    async fn handle(&self, job: &Job, progress: ProgressHandle) -> Result<serde_json::Value, BoxError>;
}

/// Read-only view of one queue plus job removal.
#[derive(Clone)]
pub struct QueueHandle {
    name: String,
    backend: Arc<dyn QueueBackend>,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        self.backend.get_job(&self.name, job_id).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let counts = self.backend.counts(&self.name).await?;
        gauge!("queue_waiting_jobs", "queue" => self.name.clone()).set(counts.waiting as f64);
        Ok(counts)
    }

    pub async fn remove_job(&self, job_id: Uuid) -> Result<bool, QueueError> {
        self.backend.remove_job(&self.name, job_id).await
    }
}

pub struct QueueEngine {
    backend: Arc<dyn QueueBackend>,
    poll_interval: Duration,
    shutdown: watch::Sender<bool>,
    wakers: Mutex<HashMap<String, Arc<Notify>>>,
    dispatchers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl QueueEngine {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self::with_poll_interval(backend, DEFAULT_POLL_INTERVAL)
    }

    /// `poll_interval` bounds how long a dispatcher sleeps on an empty queue
    /// before checking for jobs added by other processes.
    pub fn with_poll_interval(backend: Arc<dyn QueueBackend>, poll_interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            backend,
            poll_interval,
            shutdown,
            wakers: Mutex::new(HashMap::new()),
            dispatchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        self.backend.clone()
    }

    fn waker(&self, queue: &str) -> Arc<Notify> {
        let mut wakers = self.wakers.lock().unwrap_or_else(|p| p.into_inner());
        wakers
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Enqueue a job in state `waiting`.
    pub async fn add_job(&self, queue: &str, payload: JobPayload, options: JobOptions) -> Result<Job, QueueError> {
        let job = Job::new(queue, payload, options);
        self.backend.push(&job).await?;

        counter!("jobs_enqueued_total", "queue" => queue.to_string()).increment(1);
        info!(job_id = %job.id, queue, name = %job.name, priority = job.options.priority, "Job enqueued");

        self.waker(queue).notify_one();
        Ok(job)
    }

    /// Enqueue on the queue the payload kind belongs to.
    pub async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> Result<Job, QueueError> {
        let queue = payload.queue();
        self.add_job(queue, payload, options).await
    }

    pub fn get_queue(&self, name: &str) -> QueueHandle {
        QueueHandle {
            name: name.to_string(),
            backend: self.backend.clone(),
        }
    }

    /// Start consuming `definition.name` with `handler`.
    pub fn register_worker(&self, definition: QueueDefinition, handler: Arc<dyn JobHandler>) -> Result<(), QueueError> {
        if definition.concurrency == 0 {
            return Err(QueueError::InvalidDefinition(format!(
                "queue {} needs a concurrency of at least 1",
                definition.name
            )));
        }
        if *self.shutdown.borrow() {
            return Err(QueueError::ShutDown);
        }

        let mut dispatchers = self.dispatchers.lock().unwrap_or_else(|p| p.into_inner());
        if dispatchers.contains_key(&definition.name) {
            return Err(QueueError::DuplicateWorker(definition.name));
        }

        info!(
            queue = %definition.name,
            concurrency = definition.concurrency,
            rate_limit = ?definition.rate_limit,
            "Registering queue worker"
        );

        let dispatcher = Dispatcher {
            backend: self.backend.clone(),
            handler,
            waker: self.waker(&definition.name),
            poll_interval: self.poll_interval,
            definition: definition.clone(),
        };
        let handle = tokio::spawn(dispatcher.run(self.shutdown.subscribe()));
        dispatchers.insert(definition.name, handle);
        Ok(())
    }

    /// Stop dispatching and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut dispatchers = self.dispatchers.lock().unwrap_or_else(|p| p.into_inner());
            dispatchers.drain().collect()
        };

        for (queue, handle) in handles {
            if let Err(e) = handle.await {
                error!(queue, error = %e, "Dispatcher task ended abnormally");
            }
        }
        info!("Queue engine stopped");
    }
}

struct Dispatcher {
    backend: Arc<dyn QueueBackend>,
    handler: Arc<dyn JobHandler>,
    waker: Arc<Notify>,
    poll_interval: Duration,
    definition: QueueDefinition,
}

impl Dispatcher {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.definition.name.clone();
        let semaphore = Arc::new(Semaphore::new(self.definition.concurrency));
        let mut limiter = self.definition.rate_limit.map(RateLimiter::new);
        let mut running = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(finished) = running.try_join_next() {
                if let Err(e) = finished {
                    error!(queue = %queue, error = %e, "Job task ended abnormally");
                }
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            // Jobs stay waiting in the backend while the window is full.
            if let Some(limiter) = limiter.as_mut() {
                let delay = limiter.delay(Instant::now());
                if !delay.is_zero() {
                    drop(permit);
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                    continue;
                }
            }

            match self.backend.pop(&queue).await {
                Ok(Some(job)) => {
                    if let Some(limiter) = limiter.as_mut() {
                        limiter.record(Instant::now());
                    }
                    running.spawn(execute(self.backend.clone(), self.handler.clone(), job, permit));
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.waker.notified() => {}
                        _ = sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(queue = %queue, error = %e, "Failed to fetch next job, will retry");
                    tokio::select! {
                        _ = sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        if !running.is_empty() {
            info!(queue = %queue, in_flight = running.len(), "Waiting for in-flight jobs");
        }
        while let Some(finished) = running.join_next().await {
            if let Err(e) = finished {
                error!(queue = %queue, error = %e, "Job task ended abnormally");
            }
        }
        info!(queue = %queue, "Dispatcher stopped");
    }
}

async fn execute(
    backend: Arc<dyn QueueBackend>,
    handler: Arc<dyn JobHandler>,
    job: Job,
    _permit: OwnedSemaphorePermit,
) {
    let span = info_span!("job", job_id = %job.id, queue = %job.queue, name = %job.name);

    async move {
        let started = Instant::now();
        info!("Processing job");

        let (progress, forwarder) = ProgressHandle::forward_to(backend.clone(), job.queue.clone(), job.id);
        let outcome = AssertUnwindSafe(handler.handle(&job, progress.clone()))
            .catch_unwind()
            .await;

        drop(progress);
        if let Err(e) = forwarder.await {
            warn!(error = %e, "Progress forwarder ended abnormally");
        }

        let elapsed = started.elapsed();
        histogram!("job_duration_seconds", "queue" => job.queue.clone()).record(elapsed.as_secs_f64());

        let failure = match outcome {
            Ok(Ok(result)) => {
                let result = (!result.is_null()).then_some(result);
                match backend
                    .complete(&job.queue, job.id, result, job.options.remove_on_complete)
                    .await
                {
                    Ok(()) => {
                        counter!("jobs_completed_total", "queue" => job.queue.clone()).increment(1);
                        info!(duration_ms = elapsed.as_millis() as u64, "Job completed");
                    }
                    Err(e) => error!(error = %e, "Failed to mark job completed"),
                }
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };

        if let Some(message) = failure {
            counter!("jobs_failed_total", "queue" => job.queue.clone()).increment(1);
            error!(error = %message, duration_ms = elapsed.as_millis() as u64, "Job failed");
            if let Err(e) = backend
                .fail(&job.queue, job.id, &message, job.options.remove_on_fail)
                .await
            {
                error!(error = %e, "Failed to mark job failed");
            }
        }
    }
    .instrument(span)
    .await
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("A worker is already registered for queue {0}")]
    DuplicateWorker(String),

    #[error("Invalid queue definition: {0}")]
    InvalidDefinition(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Corrupt queue entry: {0}")]
    Corrupt(String),

    #[error("Queue engine is shut down")]
    ShutDown,
}
