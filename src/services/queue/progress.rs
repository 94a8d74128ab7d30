//! Non-blocking job progress reporting.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::models::job::JobProgress;
use crate::services::queue::backend::QueueBackend;

/// Receives progress updates. Implementations must return immediately.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: JobProgress);
}

/// Sink that drops every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _progress: JobProgress) {}
}

/// Progress handle given to a job handler. Only the latest value is kept; a
/// forwarder task writes it to the backend.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    tx: Arc<watch::Sender<Option<JobProgress>>>,
}

impl ProgressHandle {
    /// A handle whose updates go nowhere but can still be read back.
    pub fn detached() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn update(&self, progress: JobProgress) {
        self.tx.send_replace(Some(progress));
    }

    pub fn latest(&self) -> Option<JobProgress> {
        self.tx.borrow().clone()
    }

    /// Start the forwarder for one job. The task ends once every clone of the
    /// returned handle is dropped, after writing the final value.
    pub(crate) fn forward_to(
        backend: Arc<dyn QueueBackend>,
        queue: String,
        job_id: Uuid,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = watch::channel::<Option<JobProgress>>(None);

        let forwarder = tokio::spawn(async move {
            let mut written: Option<JobProgress> = None;

            while rx.changed().await.is_ok() {
                let latest = rx.borrow_and_update().clone();
                if latest.is_some() && latest != written {
                    write(&*backend, &queue, job_id, latest.as_ref()).await;
                    written = latest;
                }
            }

            let last = rx.borrow().clone();
            if last.is_some() && last != written {
                write(&*backend, &queue, job_id, last.as_ref()).await;
            }
        });

        (Self { tx: Arc::new(tx) }, forwarder)
    }
}

async fn write(backend: &dyn QueueBackend, queue: &str, job_id: Uuid, progress: Option<&JobProgress>) {
    let Some(progress) = progress else { return };
    if let Err(e) = backend.set_progress(queue, job_id, progress).await {
        warn!(%job_id, queue, error = %e, "Failed to store job progress");
    }
}

impl ProgressSink for ProgressHandle {
    fn report(&self, progress: JobProgress) {
        self.update(progress);
    }
}
