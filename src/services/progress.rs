use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::models::batch::{BatchProgress, BatchStatus, ImageCompletion, ProgressCounter};
use crate::models::product::ProductStatus;

const KEY_PREFIX: &str = "shelf_import:batch";

/// Batch progress shared between the API and workers.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn init_batch(&self, batch_id: Uuid, total_images: i64) -> Result<(), ProgressError>;

    /// Record the stage and image currently being worked on. A completed batch keeps its status.
    async fn set_stage(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        current_image: &str,
    ) -> Result<(), ProgressError>;

    /// Count one decided detection towards `total_products`, and towards the status
    /// counter when it became a product.
    ///
    /// Each (image, detection index) pair is counted at most once per batch, so a retried
    /// job can report the same detection again. Returns whether this call counted it.
    async fn record_detection(
        &self,
        batch_id: Uuid,
        content_hash: &str,
        detection_index: usize,
        created: Option<ProductStatus>,
    ) -> Result<bool, ProgressError>;

    /// Count one image as finished and complete the batch once nothing is outstanding.
    ///
    /// Each image is counted at most once per batch. Returns whether this call counted it.
    async fn finish_image(
        &self,
        batch_id: Uuid,
        content_hash: &str,
        completion: ImageCompletion,
    ) -> Result<bool, ProgressError>;

    async fn mark_completed(&self, batch_id: Uuid) -> Result<(), ProgressError>;

    /// Current progress, or `None` when the batch is unknown or expired.
    async fn snapshot(&self, batch_id: Uuid) -> Result<Option<BatchProgress>, ProgressError>;
}

fn batch_key(batch_id: Uuid) -> String {
    format!("{}:{}", KEY_PREFIX, batch_id)
}

fn finished_key(batch_id: Uuid) -> String {
    format!("{}:{}:finished", KEY_PREFIX, batch_id)
}

fn detections_key(batch_id: Uuid) -> String {
    format!("{}:{}:detections", KEY_PREFIX, batch_id)
}

fn status_counter(status: ProductStatus) -> ProgressCounter {
    match status {
        ProductStatus::Verified => ProgressCounter::VerifiedProducts,
        ProductStatus::NeedsReview => ProgressCounter::ReviewProducts,
    }
}

fn completion_field(completion: ImageCompletion) -> &'static str {
    match completion {
        ImageCompletion::Processed => "processed_images",
        ImageCompletion::Failed => "failed_images",
    }
}

const SET_STAGE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
if redis.call('HGET', KEYS[1], 'status') ~= 'completed' then
  redis.call('HSET', KEYS[1], 'status', ARGV[1])
end
redis.call('HSET', KEYS[1], 'current_image', ARGV[2], 'updated_at', ARGV[3])
redis.call('EXPIRE', KEYS[1], ARGV[4])
return 1
"#;

const RECORD_DETECTION_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
local added = redis.call('SADD', KEYS[2], ARGV[1])
redis.call('EXPIRE', KEYS[2], ARGV[5])
if added == 1 then
  redis.call('HINCRBY', KEYS[1], ARGV[2], 1)
  if ARGV[3] ~= '' then
    redis.call('HINCRBY', KEYS[1], ARGV[3], 1)
  end
end
redis.call('HSET', KEYS[1], 'updated_at', ARGV[4])
redis.call('EXPIRE', KEYS[1], ARGV[5])
return added
"#;

const FINISH_IMAGE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
local added = redis.call('SADD', KEYS[2], ARGV[1])
redis.call('EXPIRE', KEYS[2], ARGV[4])
if added == 1 then
  redis.call('HINCRBY', KEYS[1], ARGV[2], 1)
end
local total = tonumber(redis.call('HGET', KEYS[1], 'total_images') or '0')
local done = tonumber(redis.call('HGET', KEYS[1], 'processed_images') or '0')
  + tonumber(redis.call('HGET', KEYS[1], 'failed_images') or '0')
if done >= total then
  redis.call('HSET', KEYS[1], 'status', 'completed', 'current_image', '')
end
redis.call('HSET', KEYS[1], 'updated_at', ARGV[3])
redis.call('EXPIRE', KEYS[1], ARGV[4])
return added
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('HSET', KEYS[1], 'status', 'completed', 'current_image', '', 'updated_at', ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
return 1
"#;

/// Progress kept in one Redis hash per batch, expiring after the configured TTL.
pub struct RedisProgressStore {
    client: redis::Client,
    ttl_secs: i64,
    set_stage: redis::Script,
    record_detection: redis::Script,
    finish_image: redis::Script,
    complete: redis::Script,
}

impl RedisProgressStore {
    pub fn new(redis_url: &str, ttl: Duration) -> Result<Self, ProgressError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            ttl_secs: ttl.as_secs().max(1) as i64,
            set_stage: redis::Script::new(SET_STAGE_SCRIPT),
            record_detection: redis::Script::new(RECORD_DETECTION_SCRIPT),
            finish_image: redis::Script::new(FINISH_IMAGE_SCRIPT),
            complete: redis::Script::new(COMPLETE_SCRIPT),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, ProgressError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    async fn init_batch(&self, batch_id: Uuid, total_images: i64) -> Result<(), ProgressError> {
        let mut conn = self.conn().await?;
        let key = batch_key(batch_id);
        let now = Utc::now().to_rfc3339();
        let fields: [(&str, String); 10] = [
            ("status", BatchStatus::Queued.to_string()),
            ("total_images", total_images.to_string()),
            ("processed_images", "0".to_string()),
            ("failed_images", "0".to_string()),
            ("total_products", "0".to_string()),
            ("verified_products", "0".to_string()),
            ("review_products", "0".to_string()),
            ("current_image", String::new()),
            ("created_at", now.clone()),
            ("updated_at", now),
        ];
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .expire(&key, self.ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_stage(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        current_image: &str,
    ) -> Result<(), ProgressError> {
        let mut conn = self.conn().await?;
        let _: i64 = self
            .set_stage
            .key(batch_key(batch_id))
            .arg(status.as_ref())
            .arg(current_image)
            .arg(Utc::now().to_rfc3339())
            .arg(self.ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn record_detection(
        &self,
        batch_id: Uuid,
        content_hash: &str,
        detection_index: usize,
        created: Option<ProductStatus>,
    ) -> Result<bool, ProgressError> {
        let mut conn = self.conn().await?;
        let counter = created.map(status_counter);
        let status_field: &str = match &counter {
            Some(c) => c.as_ref(),
            None => "",
        };
        let added: i64 = self
            .record_detection
            .key(batch_key(batch_id))
            .key(detections_key(batch_id))
            .arg(format!("{}:{}", content_hash, detection_index))
            .arg(ProgressCounter::TotalProducts.as_ref())
            .arg(status_field)
            .arg(Utc::now().to_rfc3339())
            .arg(self.ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn finish_image(
        &self,
        batch_id: Uuid,
        content_hash: &str,
        completion: ImageCompletion,
    ) -> Result<bool, ProgressError> {
        let mut conn = self.conn().await?;
        let added: i64 = self
            .finish_image
            .key(batch_key(batch_id))
            .key(finished_key(batch_id))
            .arg(content_hash)
            .arg(completion_field(completion))
            .arg(Utc::now().to_rfc3339())
            .arg(self.ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn mark_completed(&self, batch_id: Uuid) -> Result<(), ProgressError> {
        let mut conn = self.conn().await?;
        let _: i64 = self
            .complete
            .key(batch_key(batch_id))
            .arg(Utc::now().to_rfc3339())
            .arg(self.ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn snapshot(&self, batch_id: Uuid) -> Result<Option<BatchProgress>, ProgressError> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(batch_key(batch_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_progress(batch_id, &fields).map(Some)
    }
}

fn parse_progress(batch_id: Uuid, fields: &HashMap<String, String>) -> Result<BatchProgress, ProgressError> {
    let count = |name: &str| -> i64 {
        fields
            .get(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };
    let time = |name: &str| -> Option<DateTime<Utc>> {
        fields
            .get(name)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    };

    let raw_status = fields.get("status").map(String::as_str).unwrap_or_default();
    let status = BatchStatus::from_str(raw_status)
        .map_err(|_| ProgressError::Corrupt(format!("unknown status {:?}", raw_status)))?;

    Ok(BatchProgress {
        batch_id,
        status,
        total_images: count("total_images"),
        processed_images: count("processed_images"),
        failed_images: count("failed_images"),
        total_products: count("total_products"),
        verified_products: count("verified_products"),
        review_products: count("review_products"),
        current_image: fields.get("current_image").cloned().unwrap_or_default(),
        created_at: time("created_at"),
        updated_at: time("updated_at"),
    })
}

/// In-process progress store used by tests and local runs. Entries never expire.
#[derive(Default)]
pub struct MemoryProgressStore {
    batches: Mutex<HashMap<Uuid, MemoryBatch>>,
}

struct MemoryBatch {
    progress: BatchProgress,
    finished: HashSet<String>,
    detections: HashSet<(String, usize)>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_batch<R>(&self, batch_id: Uuid, f: impl FnOnce(&mut MemoryBatch) -> R) -> Option<R> {
        let mut batches = self.batches.lock().unwrap_or_else(|p| p.into_inner());
        batches.get_mut(&batch_id).map(|batch| {
            let result = f(batch);
            batch.progress.updated_at = Some(Utc::now());
            result
        })
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn init_batch(&self, batch_id: Uuid, total_images: i64) -> Result<(), ProgressError> {
        let now = Utc::now();
        let progress = BatchProgress {
            batch_id,
            status: BatchStatus::Queued,
            total_images,
            processed_images: 0,
            failed_images: 0,
            total_products: 0,
            verified_products: 0,
            review_products: 0,
            current_image: String::new(),
            created_at: Some(now),
            updated_at: Some(now),
        };
        self.batches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                batch_id,
                MemoryBatch {
                    progress,
                    finished: HashSet::new(),
                    detections: HashSet::new(),
                },
            );
        Ok(())
    }

    async fn set_stage(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        current_image: &str,
    ) -> Result<(), ProgressError> {
        self.with_batch(batch_id, |batch| {
            if batch.progress.status != BatchStatus::Completed {
                batch.progress.status = status;
            }
            batch.progress.current_image = current_image.to_string();
        });
        Ok(())
    }

    async fn record_detection(
        &self,
        batch_id: Uuid,
        content_hash: &str,
        detection_index: usize,
        created: Option<ProductStatus>,
    ) -> Result<bool, ProgressError> {
        let counted = self.with_batch(batch_id, |batch| {
            let added = batch
                .detections
                .insert((content_hash.to_string(), detection_index));
            if added {
                batch.progress.total_products += 1;
                match created {
                    Some(ProductStatus::Verified) => batch.progress.verified_products += 1,
                    Some(ProductStatus::NeedsReview) => batch.progress.review_products += 1,
                    None => {}
                }
            }
            added
        });
        Ok(counted.unwrap_or(false))
    }

    async fn finish_image(
        &self,
        batch_id: Uuid,
        content_hash: &str,
        completion: ImageCompletion,
    ) -> Result<bool, ProgressError> {
        let counted = self.with_batch(batch_id, |batch| {
            let progress = &mut batch.progress;
            let added = batch.finished.insert(content_hash.to_string());
            if added {
                match completion {
                    ImageCompletion::Processed => progress.processed_images += 1,
                    ImageCompletion::Failed => progress.failed_images += 1,
                }
            }
            if progress.outstanding_images() == 0 {
                progress.status = BatchStatus::Completed;
                progress.current_image.clear();
            }
            added
        });
        Ok(counted.unwrap_or(false))
    }

    async fn mark_completed(&self, batch_id: Uuid) -> Result<(), ProgressError> {
        self.with_batch(batch_id, |batch| {
            batch.progress.status = BatchStatus::Completed;
            batch.progress.current_image.clear();
        });
        Ok(())
    }

    async fn snapshot(&self, batch_id: Uuid) -> Result<Option<BatchProgress>, ProgressError> {
        Ok(self
            .batches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&batch_id)
            .map(|batch| batch.progress.clone()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Corrupt progress record: {0}")]
    Corrupt(String),
}
