use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use crate::models::job::{Job, JobProgress, JobState, QueueCounts, ScheduleEntry};
use crate::services::queue::backend::{QueueBackend, DEFAULT_FINISHED_RETENTION, FIRE_CLAIM_TTL_SECS};
use crate::services::queue::QueueError;

/// Priority bands are spaced far enough apart that sequence numbers never
/// cross into the next band.
const PRIORITY_BAND: f64 = 1e12;

const POP_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
redis.call('SADD', KEYS[2], popped[1])
return popped[1]
"#;

/// Drop the oldest finished jobs beyond ARGV[1], hashes included.
const TRIM_SCRIPT: &str = r#"
local excess = redis.call('ZCARD', KEYS[1]) - tonumber(ARGV[1])
if excess <= 0 then
  return 0
end
local expired = redis.call('ZRANGE', KEYS[1], 0, excess - 1)
for _, id in ipairs(expired) do
  redis.call('DEL', ARGV[2] .. id)
end
redis.call('ZREMRANGEBYRANK', KEYS[1], 0, excess - 1)
return excess
"#;

/// Redis-backed queue shared by the server and worker processes.
///
/// Layout under `{prefix}`:
/// - `{queue}:waiting` sorted set of job ids scored by priority then sequence
/// - `{queue}:active` set of job ids
/// - `{queue}:completed|failed` sorted sets of job ids scored by finish time,
///   trimmed to the newest `retention`
/// - `{queue}:job:{id}` hash with the serialized job and its latest progress
/// - `schedules` hash of repeat schedules, `schedule:{key}:{ts}` fire claims
#[derive(Clone)]
pub struct RedisQueueBackend {
    conn: ConnectionManager,
    prefix: String,
    retention: usize,
}

impl RedisQueueBackend {
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        let conn = ConnectionManager::new(client).await.map_err(QueueError::Redis)?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            retention: DEFAULT_FINISHED_RETENTION,
        })
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    fn key(&self, queue: &str, part: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, part)
    }

    fn job_key(&self, queue: &str, job_id: Uuid) -> String {
        format!("{}:{}:job:{}", self.prefix, queue, job_id)
    }

    fn schedules_key(&self) -> String {
        format!("{}:schedules", self.prefix)
    }

    fn claim_key(&self, key: &str, fire_at: DateTime<Utc>) -> String {
        format!("{}:schedule:{}:{}", self.prefix, key, fire_at.timestamp())
    }

    async fn load(&self, queue: &str, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let (data, progress): (Option<String>, Option<String>) = redis::pipe()
            .hget(self.job_key(queue, job_id), "job")
            .hget(self.job_key(queue, job_id), "progress")
            .query_async(&mut conn)
            .await?;

        let Some(data) = data else { return Ok(None) };
        let mut job: Job = serde_json::from_str(&data)?;
        if let Some(progress) = progress {
            job.progress = Some(serde_json::from_str(&progress)?);
        }
        Ok(Some(job))
    }

    async fn store(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(job)?;
        conn.hset::<_, _, _, ()>(self.job_key(&job.queue, job.id), "job", data)
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        queue: &str,
        job_id: Uuid,
        state: JobState,
        remove: bool,
        apply: impl FnOnce(&mut Job),
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let target = match state {
            JobState::Completed => self.key(queue, "completed"),
            _ => self.key(queue, "failed"),
        };

        if remove {
            redis::pipe()
                .atomic()
                .srem(self.key(queue, "active"), job_id.to_string())
                .del(self.job_key(queue, job_id))
                .query_async::<()>(&mut conn)
                .await?;
            return Ok(());
        }

        let Some(mut job) = self.load(queue, job_id).await? else {
            return Err(QueueError::JobNotFound(job_id));
        };
        let finished_at = Utc::now();
        job.state = state;
        job.finished_at = Some(finished_at);
        apply(&mut job);

        redis::pipe()
            .atomic()
            .hset(self.job_key(queue, job_id), "job", serde_json::to_string(&job)?)
            .srem(self.key(queue, "active"), job_id.to_string())
            .zadd(&target, job_id.to_string(), finished_at.timestamp_millis())
            .query_async::<()>(&mut conn)
            .await?;

        let _trimmed: i64 = Script::new(TRIM_SCRIPT)
            .key(&target)
            .arg(self.retention)
            .arg(format!("{}:{}:job:", self.prefix, queue))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn push(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let seq: u64 = conn.incr(self.key(&job.queue, "seq"), 1).await?;
        let score = f64::from(u8::MAX - job.options.priority) * PRIORITY_BAND + seq as f64;

        redis::pipe()
            .atomic()
            .hset(self.job_key(&job.queue, job.id), "job", serde_json::to_string(job)?)
            .zadd(self.key(&job.queue, "waiting"), job.id.to_string(), score)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let popped: Option<String> = Script::new(POP_SCRIPT)
            .key(self.key(queue, "waiting"))
            .key(self.key(queue, "active"))
            .invoke_async(&mut conn)
            .await?;

        let Some(id) = popped else { return Ok(None) };
        let job_id = Uuid::parse_str(&id).map_err(|e| QueueError::Corrupt(e.to_string()))?;

        let Some(mut job) = self.load(queue, job_id).await? else {
            return Err(QueueError::JobNotFound(job_id));
        };
        job.state = JobState::Active;
        job.processed_at = Some(Utc::now());
        self.store(&job).await?;
        Ok(Some(job))
    }

    async fn set_progress(&self, queue: &str, job_id: Uuid, progress: &JobProgress) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(self.job_key(queue, job_id), "progress", serde_json::to_string(progress)?)
            .await?;
        Ok(())
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: Uuid,
        result: Option<serde_json::Value>,
        remove: bool,
    ) -> Result<(), QueueError> {
        self.finish(queue, job_id, JobState::Completed, remove, |job| job.result = result)
            .await
    }

    async fn fail(&self, queue: &str, job_id: Uuid, error: &str, remove: bool) -> Result<(), QueueError> {
        self.finish(queue, job_id, JobState::Failed, remove, |job| {
            job.error = Some(error.to_string())
        })
        .await
    }

    async fn get_job(&self, queue: &str, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        self.load(queue, job_id).await
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn.clone();
        let (waiting, active, completed, failed): (u64, u64, u64, u64) = redis::pipe()
            .zcard(self.key(queue, "waiting"))
            .scard(self.key(queue, "active"))
            .zcard(self.key(queue, "completed"))
            .zcard(self.key(queue, "failed"))
            .query_async(&mut conn)
            .await?;

        Ok(QueueCounts {
            waiting,
            active,
            completed,
            failed,
        })
    }

    async fn remove_job(&self, queue: &str, job_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let id = job_id.to_string();
        let (deleted,): (u64,) = redis::pipe()
            .atomic()
            .zrem(self.key(queue, "waiting"), &id)
            .ignore()
            .srem(self.key(queue, "active"), &id)
            .ignore()
            .zrem(self.key(queue, "completed"), &id)
            .ignore()
            .zrem(self.key(queue, "failed"), &id)
            .ignore()
            .del(self.job_key(queue, job_id))
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn put_schedule(&self, entry: &ScheduleEntry) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(self.schedules_key(), &entry.key, serde_json::to_string(entry)?)
            .await?;
        Ok(())
    }

    async fn remove_schedule(&self, key: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.hdel(self.schedules_key(), key).await?;
        Ok(removed > 0)
    }

    async fn schedules(&self) -> Result<Vec<ScheduleEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.hvals(self.schedules_key()).await?;
        let mut entries = raw
            .iter()
            .map(|s| serde_json::from_str::<ScheduleEntry>(s))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn claim_fire(&self, key: &str, fire_at: DateTime<Utc>) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(self.claim_key(key, fire_at))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(FIRE_CLAIM_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(claimed.is_some())
    }

    async fn release_fire(&self, key: &str, fire_at: DateTime<Utc>) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.claim_key(key, fire_at)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
