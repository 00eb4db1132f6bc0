use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::batch::{BatchProgress, BatchStatus};

/// Response after submitting a batch of shelf photos.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total_images: usize,
    /// Files skipped because the same bytes appeared earlier in this upload.
    pub duplicates: usize,
    pub message: String,
}

/// Response for polling a batch.
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchStatusResponse {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total_images: i64,
    pub processed_images: i64,
    pub failed_images: i64,
    pub total_products: i64,
    pub verified_products: i64,
    pub review_products: i64,
    pub current_image: String,
}

impl From<BatchProgress> for BatchStatusResponse {
    fn from(p: BatchProgress) -> Self {
        Self {
            batch_id: p.batch_id,
            status: p.status,
            total_images: p.total_images,
            processed_images: p.processed_images,
            failed_images: p.failed_images,
            total_products: p.total_products,
            verified_products: p.verified_products,
            review_products: p.review_products,
            current_image: p.current_image,
        }
    }
}
