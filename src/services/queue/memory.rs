use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::models::job::{Job, JobProgress, JobState, QueueCounts, ScheduleEntry};
use crate::services::queue::backend::{QueueBackend, DEFAULT_FINISHED_RETENTION, FIRE_CLAIM_TTL_SECS};
use crate::services::queue::QueueError;

#[derive(Default)]
struct QueueState {
    waiting: BTreeMap<(Reverse<u8>, u64), Uuid>,
    active: HashSet<Uuid>,
    /// Oldest first.
    completed: VecDeque<Uuid>,
    failed: VecDeque<Uuid>,
}

struct Inner {
    seq: u64,
    retention: usize,
    jobs: HashMap<Uuid, Job>,
    queues: HashMap<String, QueueState>,
    schedules: BTreeMap<String, ScheduleEntry>,
    claims: HashSet<(String, DateTime<Utc>)>,
}

impl Inner {
    fn new(retention: usize) -> Self {
        Self {
            seq: 0,
            retention,
            jobs: HashMap::new(),
            queues: HashMap::new(),
            schedules: BTreeMap::new(),
            claims: HashSet::new(),
        }
    }

    fn finish(&mut self, queue: &str, job_id: Uuid, state: JobState, remove: bool) -> Option<&mut Job> {
        let q = self.queues.entry(queue.to_string()).or_default();
        q.active.remove(&job_id);
        if remove {
            self.jobs.remove(&job_id);
            return None;
        }
        let finished = match state {
            JobState::Completed => &mut q.completed,
            _ => &mut q.failed,
        };
        finished.push_back(job_id);
        while finished.len() > self.retention {
            if let Some(expired) = finished.pop_front() {
                self.jobs.remove(&expired);
            }
        }
        let job = self.jobs.get_mut(&job_id)?;
        job.state = state;
        job.finished_at = Some(Utc::now());
        Some(job)
    }
}

/// Single-process queue backend.
pub struct MemoryQueueBackend {
    inner: Mutex<Inner>,
}

impl Default for MemoryQueueBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_FINISHED_RETENTION)
    }

    /// Keep at most `retention` completed and `retention` failed jobs per queue.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::new(retention)),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        let mut inner = self.inner();
        inner.seq += 1;
        let seq = inner.seq;
        inner
            .queues
            .entry(job.queue.clone())
            .or_default()
            .waiting
            .insert((Reverse(job.options.priority), seq), job.id);
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let mut inner = self.inner();
        let Some(q) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some((_, job_id)) = q.waiting.pop_first() else {
            return Ok(None);
        };
        q.active.insert(job_id);

        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Err(QueueError::JobNotFound(job_id));
        };
        job.state = JobState::Active;
        job.processed_at = Some(Utc::now());
        Ok(Some(job.clone()))
    }

    async fn set_progress(&self, _queue: &str, job_id: Uuid, progress: &JobProgress) -> Result<(), QueueError> {
        if let Some(job) = self.inner().jobs.get_mut(&job_id) {
            job.progress = Some(progress.clone());
        }
        Ok(())
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: Uuid,
        result: Option<serde_json::Value>,
        remove: bool,
    ) -> Result<(), QueueError> {
        if let Some(job) = self.inner().finish(queue, job_id, JobState::Completed, remove) {
            job.result = result;
        }
        Ok(())
    }

    async fn fail(&self, queue: &str, job_id: Uuid, error: &str, remove: bool) -> Result<(), QueueError> {
        if let Some(job) = self.inner().finish(queue, job_id, JobState::Failed, remove) {
            job.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn get_job(&self, queue: &str, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self
            .inner()
            .jobs
            .get(&job_id)
            .filter(|j| j.queue == queue)
            .cloned())
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        let inner = self.inner();
        Ok(inner
            .queues
            .get(queue)
            .map(|q| QueueCounts {
                waiting: q.waiting.len() as u64,
                active: q.active.len() as u64,
                completed: q.completed.len() as u64,
                failed: q.failed.len() as u64,
            })
            .unwrap_or_default())
    }

    async fn remove_job(&self, queue: &str, job_id: Uuid) -> Result<bool, QueueError> {
        let mut inner = self.inner();
        if let Some(q) = inner.queues.get_mut(queue) {
            q.waiting.retain(|_, id| *id != job_id);
            q.active.remove(&job_id);
            q.completed.retain(|id| *id != job_id);
            q.failed.retain(|id| *id != job_id);
        }
        Ok(inner.jobs.remove(&job_id).is_some())
    }

    async fn put_schedule(&self, entry: &ScheduleEntry) -> Result<(), QueueError> {
        self.inner().schedules.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn remove_schedule(&self, key: &str) -> Result<bool, QueueError> {
        Ok(self.inner().schedules.remove(key).is_some())
    }

    async fn schedules(&self) -> Result<Vec<ScheduleEntry>, QueueError> {
        Ok(self.inner().schedules.values().cloned().collect())
    }

    async fn claim_fire(&self, key: &str, fire_at: DateTime<Utc>) -> Result<bool, QueueError> {
        let horizon = fire_at - chrono::Duration::seconds(FIRE_CLAIM_TTL_SECS as i64);
        let mut inner = self.inner();
        inner.claims.retain(|(k, at)| k != key || *at >= horizon);
        Ok(inner.claims.insert((key.to_string(), fire_at)))
    }

    async fn release_fire(&self, key: &str, fire_at: DateTime<Utc>) -> Result<(), QueueError> {
        self.inner().claims.remove(&(key.to_string(), fire_at));
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
