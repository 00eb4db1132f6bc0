use image::ImageFormat;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::batch::SourceImage;
use crate::models::job::{ImportJob, QueuedJob};
use crate::services::crop::{content_type_for, extension_for};
use crate::services::ledger::{ImageLedger, LedgerError};
use crate::services::pipeline::ImageStage;
use crate::services::progress::{ProgressError, ProgressStore};
use crate::services::queue::{JobQueue, QueueError};
use crate::services::sku;
use crate::services::storage::{ImageStore, StorageError};

pub const MAX_FILES_PER_BATCH: usize = 10;
pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;

/// One uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// What intake accepted for a new batch.
#[derive(Debug, Clone, PartialEq)]
pub struct IntakeReceipt {
    pub batch_id: Uuid,
    /// Distinct images queued for processing.
    pub total_images: usize,
    /// Uploads dropped because the same bytes appeared earlier in the batch.
    pub duplicates: usize,
}

/// Accepts a batch of shelf photos and queues one job per distinct image.
pub struct BatchIntake {
    store: Arc<dyn ImageStore>,
    ledger: Arc<dyn ImageLedger>,
    progress: Arc<dyn ProgressStore>,
    queue: Arc<dyn JobQueue>,
    completion_delay: Duration,
}

struct AcceptedImage {
    filename: String,
    bytes: Vec<u8>,
    format: ImageFormat,
    content_hash: String,
}

impl BatchIntake {
    pub fn new(
        store: Arc<dyn ImageStore>,
        ledger: Arc<dyn ImageLedger>,
        progress: Arc<dyn ProgressStore>,
        queue: Arc<dyn JobQueue>,
        completion_delay: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            progress,
            queue,
            completion_delay,
        }
    }

    /// Validate, store and enqueue a batch. Nothing is stored unless every file is acceptable.
    pub async fn submit(&self, files: Vec<UploadedImage>) -> Result<IntakeReceipt, IntakeError> {
        if files.is_empty() {
            return Err(IntakeError::NoFiles);
        }
        if files.len() > MAX_FILES_PER_BATCH {
            return Err(IntakeError::TooManyFiles {
                max: MAX_FILES_PER_BATCH,
                got: files.len(),
            });
        }

        let mut accepted = Vec::with_capacity(files.len());
        let mut seen = HashSet::new();
        let mut duplicates = 0usize;
        for file in files {
            let format = check_file(&file)?;
            let content_hash = sku::content_hash(&file.bytes);
            if !seen.insert(content_hash.clone()) {
                tracing::info!(filename = %file.filename, content_hash = %content_hash, "Duplicate image in batch skipped");
                duplicates += 1;
                continue;
            }
            accepted.push(AcceptedImage {
                filename: file.filename,
                bytes: file.bytes,
                format,
                content_hash,
            });
        }

        let batch_id = Uuid::new_v4();
        let mut jobs = Vec::with_capacity(accepted.len());

        for image in &accepted {
            let stored_key = sku::source_image_key(&image.content_hash, extension_for(image.format));
            let content_type = content_type_for(image.format);
            self.store.put(&stored_key, &image.bytes, content_type).await?;

            let is_new = self
                .ledger
                .record_source(&SourceImage {
                    content_hash: image.content_hash.clone(),
                    stored_key: stored_key.clone(),
                    original_filename: image.filename.clone(),
                    content_type: content_type.to_string(),
                    batch_id,
                })
                .await?;
            if !is_new {
                tracing::debug!(content_hash = %image.content_hash, "Source image already known");
            }

            jobs.push(QueuedJob::new(ImportJob::ProcessImage {
                batch_id,
                content_hash: image.content_hash.clone(),
                stored_key,
                original_filename: image.filename.clone(),
            }));
        }

        self.progress.init_batch(batch_id, jobs.len() as i64).await?;

        for job in &jobs {
            self.queue.enqueue(job).await?;
            if let ImportJob::ProcessImage {
                content_hash,
                original_filename,
                ..
            } = &job.job
            {
                tracing::debug!(
                    batch_id = %batch_id,
                    content_hash = %content_hash,
                    filename = %original_filename,
                    stage = %ImageStage::Queued,
                    "Image queued"
                );
            }
        }
        self.queue
            .schedule(
                &QueuedJob::new(ImportJob::CompleteBatch { batch_id, check: 0 }),
                self.completion_delay,
            )
            .await?;

        metrics::counter!("import_batches_total").increment(1);
        metrics::counter!("import_images_total").increment(jobs.len() as u64);

        tracing::info!(
            batch_id = %batch_id,
            images = jobs.len(),
            duplicates,
            "Import batch queued"
        );

        Ok(IntakeReceipt {
            batch_id,
            total_images: jobs.len(),
            duplicates,
        })
    }
}

fn check_file(file: &UploadedImage) -> Result<ImageFormat, IntakeError> {
    if file.bytes.len() > MAX_FILE_BYTES {
        return Err(IntakeError::TooLarge {
            filename: file.filename.clone(),
            max_bytes: MAX_FILE_BYTES,
        });
    }
    match image::guess_format(&file.bytes) {
        Ok(format @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP)) => Ok(format),
        _ => Err(IntakeError::UnsupportedType {
            filename: file.filename.clone(),
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("No images uploaded")]
    NoFiles,

    #[error("Too many images: {got} (max {max})")]
    TooManyFiles { max: usize, got: usize },

    #[error("{filename} exceeds {max_bytes} bytes")]
    TooLarge { filename: String, max_bytes: usize },

    #[error("{filename} is not a JPEG, PNG or WebP image")]
    UnsupportedType { filename: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::batch::BatchStatus;
    use crate::services::ledger::MemoryLedger;
    use crate::services::progress::MemoryProgressStore;
    use crate::services::queue::MemoryJobQueue;
    use crate::services::storage::MemoryImageStore;
    use image::{DynamicImage, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(shade: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([shade, shade, shade])))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    struct Parts {
        store: Arc<MemoryImageStore>,
        ledger: Arc<MemoryLedger>,
        progress: Arc<MemoryProgressStore>,
        queue: Arc<MemoryJobQueue>,
        intake: BatchIntake,
    }

    fn parts() -> Parts {
        let store = Arc::new(MemoryImageStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let progress = Arc::new(MemoryProgressStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let intake = BatchIntake::new(
            store.clone(),
            ledger.clone(),
            progress.clone(),
            queue.clone(),
            Duration::from_secs(30),
        );
        Parts {
            store,
            ledger,
            progress,
            queue,
            intake,
        }
    }

    fn upload(name: &str, bytes: Vec<u8>) -> UploadedImage {
        UploadedImage {
            filename: name.into(),
            bytes,
        }
    }

    #[tokio::test]
    async fn test_batch_is_stored_and_queued() {
        let p = parts();
        let receipt = p
            .intake
            .submit(vec![upload("a.png", png(10)), upload("b.png", png(20)), upload("a-copy.png", png(10))])
            .await
            .unwrap();

        assert_eq!(receipt.total_images, 2);
        assert_eq!(receipt.duplicates, 1);
        assert_eq!(p.ledger.source_count(), 2);
        assert_eq!(p.store.keys().len(), 2);
        assert!(p.store.keys().iter().all(|k| k.starts_with("source/") && k.ends_with(".png")));

        assert_eq!(p.queue.pending().len(), 2);
        let scheduled = p.queue.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].1, Duration::from_secs(30));
        assert!(matches!(scheduled[0].0.job, ImportJob::CompleteBatch { check: 0, .. }));

        let progress = p.progress.snapshot(receipt.batch_id).await.unwrap().unwrap();
        assert_eq!(progress.status, BatchStatus::Queued);
        assert_eq!(progress.total_images, 2);
    }

    #[tokio::test]
    async fn test_rejects_bad_batches_before_storing() {
        let p = parts();
        assert!(matches!(p.intake.submit(Vec::new()).await, Err(IntakeError::NoFiles)));

        let eleven = (0..11).map(|i| upload("x.png", png(i))).collect();
        assert!(matches!(
            p.intake.submit(eleven).await,
            Err(IntakeError::TooManyFiles { got: 11, .. })
        ));

        let result = p
            .intake
            .submit(vec![upload("ok.png", png(1)), upload("notes.txt", b"hello".to_vec())])
            .await;
        assert!(matches!(result, Err(IntakeError::UnsupportedType { .. })));

        let mut huge = png(2);
        huge.resize(MAX_FILE_BYTES + 1, 0);
        assert!(matches!(
            p.intake.submit(vec![upload("big.png", huge)]).await,
            Err(IntakeError::TooLarge { .. })
        ));

        assert!(p.store.keys().is_empty());
        assert!(p.queue.pending().is_empty());
    }
}
