use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Work items carried by the import queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImportJob {
    /// Run the full detect→materialize pipeline over one stored source image.
    ProcessImage {
        batch_id: Uuid,
        content_hash: String,
        stored_key: String,
        original_filename: String,
    },
    /// Deferred check that flips the batch to completed.
    CompleteBatch {
        batch_id: Uuid,
        #[serde(default)]
        check: u32,
    },
}

impl ImportJob {
    pub fn batch_id(&self) -> Uuid {
        match self {
            ImportJob::ProcessImage { batch_id, .. } | ImportJob::CompleteBatch { batch_id, .. } => {
                *batch_id
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ImportJob::ProcessImage { .. } => "process_image",
            ImportJob::CompleteBatch { .. } => "complete_batch",
        }
    }
}

/// Job envelope serialized into Redis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedJob {
    pub job_id: Uuid,
    #[serde(default)]
    pub attempt: u32,
    pub job: ImportJob,
}

impl QueuedJob {
    pub fn new(job: ImportJob) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            attempt: 0,
            job,
        }
    }

    /// Same job, one attempt later.
    pub fn retried(&self) -> Self {
        Self {
            job_id: self.job_id,
            attempt: self.attempt + 1,
            job: self.job.clone(),
        }
    }

    /// Delay before this attempt runs: five seconds per earlier attempt.
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(5 * u64::from(self.attempt))
    }
}

/// Per-group job counts exposed to operators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueueStatus {
    pub pending: u64,
    pub running: u64,
    pub scheduled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_is_tagged_by_type() {
        let job = ImportJob::CompleteBatch {
            batch_id: Uuid::nil(),
            check: 2,
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "complete_batch");
        assert_eq!(value["check"], 2);
    }

    #[test]
    fn test_retried_keeps_identity() {
        let queued = QueuedJob::new(ImportJob::CompleteBatch {
            batch_id: Uuid::new_v4(),
            check: 0,
        });
        let again = queued.retried();
        assert_eq!(again.job_id, queued.job_id);
        assert_eq!(again.attempt, 1);
        assert_eq!(again.job, queued.job);
        assert_eq!(again.backoff(), Duration::from_secs(5));
        assert_eq!(again.retried().retried().backoff(), Duration::from_secs(15));
    }
}
