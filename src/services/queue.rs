use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Mutex;
use std::time::Duration;

use crate::models::job::{QueueStatus, QueuedJob};

const QUEUE_KEY: &str = "shelf_import:jobs";
const PROCESSING_KEY: &str = "shelf_import:processing";
const SCHEDULED_KEY: &str = "shelf_import:scheduled";

/// Producer side of the import queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Make a job available to workers now.
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError>;

    /// Make a job available to workers after `delay`.
    async fn schedule(&self, job: &QueuedJob, delay: Duration) -> Result<(), QueueError>;

    async fn status(&self) -> Result<QueueStatus, QueueError>;
}

/// A job taken off the queue, with the exact payload needed to acknowledge it.
#[derive(Debug)]
pub struct Delivery {
    pub job: QueuedJob,
    payload: String,
}

/// Redis-backed queue: a pending list, a processing list and a delayed sorted set scored by
/// due time in epoch milliseconds.
pub struct RedisJobQueue {
    client: redis::Client,
}

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, payload in ipairs(due) do
  redis.call('ZREM', KEYS[1], payload)
  redis.call('LPUSH', KEYS[2], payload)
end
return #due
"#;

impl RedisJobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Move delayed jobs whose time has come onto the pending list.
    pub async fn promote_due(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let now = chrono::Utc::now().timestamp_millis();
        let moved: u64 = redis::Script::new(PROMOTE_SCRIPT)
            .key(SCHEDULED_KEY)
            .key(QUEUE_KEY)
            .arg(now)
            .arg(100)
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(moved)
    }

    /// Take the oldest pending job, moving it onto the processing list.
    pub async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn().await?;
        let result: Option<String> = conn
            .rpoplpush(QUEUE_KEY, PROCESSING_KEY)
            .await
            .map_err(QueueError::Redis)?;

        match result {
            Some(payload) => match serde_json::from_str::<QueuedJob>(&payload) {
                Ok(job) => Ok(Some(Delivery { job, payload })),
                Err(e) => {
                    // Unreadable payloads are dropped rather than retried.
                    let _: i64 = conn
                        .lrem(PROCESSING_KEY, 1, &payload)
                        .await
                        .map_err(QueueError::Redis)?;
                    Err(QueueError::Serialize(e))
                }
            },
            None => Ok(None),
        }
    }

    /// Return jobs left on the processing list by a worker that stopped mid-job to the
    /// pending list. Run once at worker startup; returns how many jobs were moved.
    pub async fn recover_stranded(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let stranded: u64 = conn.llen(PROCESSING_KEY).await.map_err(QueueError::Redis)?;

        let mut moved = 0;
        while moved < stranded {
            let payload: Option<String> = conn
                .rpoplpush(PROCESSING_KEY, QUEUE_KEY)
                .await
                .map_err(QueueError::Redis)?;
            if payload.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    /// Acknowledge a delivered job (remove it from the processing list).
    pub async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .lrem(PROCESSING_KEY, 1, &delivery.payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        let _: i64 = conn
            .lpush(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn schedule(&self, job: &QueuedJob, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        let due = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let _: i64 = conn
            .zadd(SCHEDULED_KEY, &payload, due)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn status(&self) -> Result<QueueStatus, QueueError> {
        let mut conn = self.conn().await?;
        let (pending, running, scheduled): (u64, u64, u64) = redis::pipe()
            .llen(QUEUE_KEY)
            .llen(PROCESSING_KEY)
            .zcard(SCHEDULED_KEY)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(QueueStatus {
            pending,
            running,
            scheduled,
        })
    }
}

/// In-process queue that records what was submitted. Used by tests and local runs.
#[derive(Default)]
pub struct MemoryJobQueue {
    pending: Mutex<Vec<QueuedJob>>,
    scheduled: Mutex<Vec<(QueuedJob, Duration)>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending jobs in submission order.
    pub fn pending(&self) -> Vec<QueuedJob> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn scheduled(&self) -> Vec<(QueuedJob, Duration)> {
        self.scheduled.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Take every pending and scheduled job, ignoring delays.
    pub fn drain(&self) -> Vec<QueuedJob> {
        let mut jobs: Vec<QueuedJob> = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        jobs.extend(
            self.scheduled
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .drain(..)
                .map(|(job, _)| job),
        );
        jobs
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(job.clone());
        Ok(())
    }

    async fn schedule(&self, job: &QueuedJob, delay: Duration) -> Result<(), QueueError> {
        self.scheduled
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((job.clone(), delay));
        Ok(())
    }

    async fn status(&self) -> Result<QueueStatus, QueueError> {
        Ok(QueueStatus {
            pending: self.pending.lock().unwrap_or_else(|p| p.into_inner()).len() as u64,
            running: 0,
            scheduled: self.scheduled.lock().unwrap_or_else(|p| p.into_inner()).len() as u64,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
