use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Lifecycle of an import batch as seen by the polling client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, AsRefStr, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Detecting,
    Processing,
    Completed,
}

/// Cumulative counters for one batch, read back by the polling endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total_images: i64,
    pub processed_images: i64,
    pub failed_images: i64,
    pub total_products: i64,
    pub verified_products: i64,
    pub review_products: i64,
    pub current_image: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl BatchProgress {
    /// Image jobs that have neither finished nor been given up on.
    pub fn outstanding_images(&self) -> i64 {
        (self.total_images - self.processed_images - self.failed_images).max(0)
    }
}

/// Counters that image jobs bump while a batch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ProgressCounter {
    TotalProducts,
    VerifiedProducts,
    ReviewProducts,
}

/// How an image job ended, for completion accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCompletion {
    Processed,
    Failed,
}

/// Uploaded shelf photo, stored once per distinct byte content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceImage {
    pub content_hash: String,
    pub stored_key: String,
    pub original_filename: String,
    pub content_type: String,
    pub batch_id: Uuid,
}

/// Permanent record that every detection of an image was materialized or discarded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedImageMarker {
    pub content_hash: String,
    pub original_filename: String,
    pub batch_id: Uuid,
    pub products_detected: i32,
    pub products_created: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(total: i64, processed: i64, failed: i64) -> BatchProgress {
        BatchProgress {
            batch_id: Uuid::new_v4(),
            status: BatchStatus::Processing,
            total_images: total,
            processed_images: processed,
            failed_images: failed,
            total_products: 0,
            verified_products: 0,
            review_products: 0,
            current_image: String::new(),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_outstanding_counts_failed_as_finished() {
        assert_eq!(progress(3, 1, 1).outstanding_images(), 1);
        assert_eq!(progress(3, 2, 1).outstanding_images(), 0);
    }

    #[test]
    fn test_outstanding_never_negative() {
        assert_eq!(progress(1, 2, 0).outstanding_images(), 0);
    }

    #[test]
    fn test_counter_field_names() {
        assert_eq!(ProgressCounter::ReviewProducts.as_ref(), "review_products");
        assert_eq!(BatchStatus::Completed.to_string(), "completed");
    }
}
