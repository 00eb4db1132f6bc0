use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::batch::{BatchStatus, ImageCompletion, ProcessedImageMarker};
use crate::models::detection::Detection;
use crate::models::job::{ImportJob, QueuedJob};
use crate::models::product::{CandidateProduct, NewCatalogProduct, ProductStatus};
use crate::services::catalog::{CatalogError, CatalogStore, CreateOutcome};
use crate::services::crop::{self, CropError, CroppedImage, SourcePicture};
use crate::services::detection::{DetectionClient, DetectionError};
use crate::services::enhancement::{EnhancementRequest, EnhancementWorker};
use crate::services::identification::{IdentificationError, ProductIdentifier};
use crate::services::ledger::{ImageLedger, LedgerError};
use crate::services::pricing;
use crate::services::progress::{ProgressError, ProgressStore};
use crate::services::queue::{JobQueue, QueueError};
use crate::services::sku;
use crate::services::storage::{ImageStore, StorageError};
use crate::services::validation::{CrossValidator, LookupBudget};

/// Per-image stages, logged as the `stage` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ImageStage {
    Queued,
    Detecting,
    Cropping,
    Identifying,
    Validating,
    Pricing,
    Materializing,
    Processed,
}

/// Why a detection did not become a catalog product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SkipReason {
    AlreadyMaterialized,
    TooSmall,
    NotAProduct,
    DuplicateUpc,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
    Created {
        id: Uuid,
        sku: String,
        status: ProductStatus,
    },
    /// An earlier attempt already made a product from this detection.
    Existing { status: ProductStatus },
    Skipped(SkipReason),
}

impl DetectionOutcome {
    /// Status of the product this detection stands for, if it became one.
    pub fn product_status(&self) -> Option<ProductStatus> {
        match self {
            DetectionOutcome::Created { status, .. } | DetectionOutcome::Existing { status } => {
                Some(*status)
            }
            DetectionOutcome::Skipped(_) => None,
        }
    }
}

/// Summary of one image job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageReport {
    /// The image carried a processed marker before this run.
    pub already_processed: bool,
    pub detections: usize,
    pub verified: usize,
    pub needs_review: usize,
    pub skipped: usize,
}

impl ImageReport {
    pub fn created(&self) -> usize {
        self.verified + self.needs_review
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub crop_padding: u32,
    pub min_crop_size: u32,
    pub completion_delay: Duration,
    pub max_completion_checks: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            crop_padding: 5,
            min_crop_size: 30,
            completion_delay: Duration::from_secs(30),
            max_completion_checks: 20,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            crop_padding: config.crop_padding,
            min_crop_size: config.min_crop_size,
            completion_delay: config.batch_grace(),
            max_completion_checks: config.max_completion_checks,
        }
    }
}

/// Collaborators of the import pipeline.
pub struct PipelineParts {
    pub detector: DetectionClient,
    pub identifier: Arc<dyn ProductIdentifier>,
    pub validator: CrossValidator,
    pub enhancer: Arc<EnhancementWorker>,
    pub store: Arc<dyn ImageStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub ledger: Arc<dyn ImageLedger>,
    pub progress: Arc<dyn ProgressStore>,
    pub queue: Arc<dyn JobQueue>,
}

/// Turns one stored shelf photo into draft catalog products.
pub struct ImportPipeline {
    parts: PipelineParts,
    settings: PipelineSettings,
}

/// State carried across the detections of one image.
struct ImageRun<'a> {
    batch_id: Uuid,
    content_hash: &'a str,
    original_filename: &'a str,
    picture: SourcePicture,
    budget: LookupBudget,
    seen_upcs: HashSet<String>,
    enhancements: Vec<JoinHandle<bool>>,
}

impl ImportPipeline {
    pub fn new(parts: PipelineParts, settings: PipelineSettings) -> Self {
        Self { parts, settings }
    }

    pub async fn run(&self, job: &QueuedJob) -> Result<(), PipelineError> {
        match &job.job {
            ImportJob::ProcessImage {
                batch_id,
                content_hash,
                stored_key,
                original_filename,
            } => {
                self.process_image(*batch_id, content_hash, stored_key, original_filename)
                    .await?;
                Ok(())
            }
            ImportJob::CompleteBatch { batch_id, check } => {
                self.complete_batch(*batch_id, *check).await
            }
        }
    }

    /// Process every detection of one image, then mark it processed.
    pub async fn process_image(
        &self,
        batch_id: Uuid,
        content_hash: &str,
        stored_key: &str,
        original_filename: &str,
    ) -> Result<ImageReport, PipelineError> {
        let started = Instant::now();
        let p = &self.parts;

        if p.ledger.is_processed(content_hash).await? {
            tracing::info!(
                batch_id = %batch_id,
                content_hash,
                "Image already processed, skipping"
            );
            p.progress
                .finish_image(batch_id, content_hash, ImageCompletion::Processed)
                .await?;
            return Ok(ImageReport {
                already_processed: true,
                ..ImageReport::default()
            });
        }

        tracing::info!(
            batch_id = %batch_id,
            content_hash,
            filename = original_filename,
            stage = %ImageStage::Detecting,
            "Processing image"
        );
        p.progress
            .set_stage(batch_id, BatchStatus::Detecting, original_filename)
            .await?;

        let bytes = p.store.get(stored_key).await?;
        let picture = SourcePicture::decode(&bytes)?;
        let detections = p.detector.detect_products(&bytes).await?;
        drop(bytes);

        p.progress
            .set_stage(batch_id, BatchStatus::Processing, original_filename)
            .await?;

        let mut run = ImageRun {
            batch_id,
            content_hash,
            original_filename,
            picture,
            budget: LookupBudget::default(),
            seen_upcs: HashSet::new(),
            enhancements: Vec::new(),
        };
        let mut report = ImageReport {
            detections: detections.len(),
            ..ImageReport::default()
        };

        for (index, detection) in detections.iter().enumerate() {
            let outcome = self.process_detection(&mut run, index, detection).await?;
            p.progress
                .record_detection(batch_id, content_hash, index, outcome.product_status())
                .await?;

            match outcome {
                DetectionOutcome::Created { sku, status, .. } => {
                    match status {
                        ProductStatus::Verified => report.verified += 1,
                        ProductStatus::NeedsReview => report.needs_review += 1,
                    }
                    metrics::counter!("import_products_created_total", "status" => status.to_string())
                        .increment(1);
                    tracing::info!(
                        batch_id = %batch_id,
                        content_hash,
                        detection = index,
                        sku = %sku,
                        status = %status,
                        "Draft product created"
                    );
                }
                DetectionOutcome::Existing { .. } => {
                    report.skipped += 1;
                    self.log_skip(batch_id, content_hash, index, SkipReason::AlreadyMaterialized);
                }
                DetectionOutcome::Skipped(reason) => {
                    report.skipped += 1;
                    self.log_skip(batch_id, content_hash, index, reason);
                }
            }
        }

        for handle in run.enhancements.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!(content_hash, error = %e, "Enhancement task aborted");
            }
        }

        p.ledger
            .mark_processed(&ProcessedImageMarker {
                content_hash: content_hash.to_string(),
                original_filename: original_filename.to_string(),
                batch_id,
                products_detected: report.detections as i32,
                products_created: report.created() as i32,
            })
            .await?;
        p.progress
            .finish_image(batch_id, content_hash, ImageCompletion::Processed)
            .await?;

        let elapsed = started.elapsed();
        metrics::histogram!("import_image_seconds").record(elapsed.as_secs_f64());
        tracing::info!(
            batch_id = %batch_id,
            content_hash,
            stage = %ImageStage::Processed,
            detections = report.detections,
            verified = report.verified,
            needs_review = report.needs_review,
            skipped = report.skipped,
            elapsed_ms = elapsed.as_millis() as u64,
            "Image processed"
        );

        Ok(report)
    }

    fn log_skip(&self, batch_id: Uuid, content_hash: &str, index: usize, reason: SkipReason) {
        metrics::counter!("import_detections_skipped_total", "reason" => reason.to_string())
            .increment(1);
        tracing::info!(
            batch_id = %batch_id,
            content_hash,
            detection = index,
            reason = %reason,
            "Detection skipped"
        );
    }

    async fn process_detection(
        &self,
        run: &mut ImageRun<'_>,
        index: usize,
        detection: &Detection,
    ) -> Result<DetectionOutcome, PipelineError> {
        let p = &self.parts;

        if let Some(status) = p
            .catalog
            .materialized_status(run.content_hash, index as i32)
            .await?
        {
            return Ok(DetectionOutcome::Existing { status });
        }

        tracing::debug!(content_hash = run.content_hash, detection = index, stage = %ImageStage::Cropping, "Detection stage");
        let Some(cropped) = crop::crop_detection(
            &run.picture,
            &detection.bbox,
            self.settings.crop_padding,
            self.settings.min_crop_size,
        )?
        else {
            return Ok(DetectionOutcome::Skipped(SkipReason::TooSmall));
        };

        tracing::debug!(content_hash = run.content_hash, detection = index, stage = %ImageStage::Identifying, "Detection stage");
        let candidate = p.identifier.identify(&cropped.bytes).await?;
        if !candidate.is_usable() {
            return Ok(DetectionOutcome::Skipped(SkipReason::NotAProduct));
        }

        let temp_sku = sku::derive_sku(&candidate.brand, &candidate.product_name);
        let interim_key =
            sku::interim_crop_key(run.content_hash, index, &temp_sku, cropped.extension());
        p.store
            .put(&interim_key, &cropped.bytes, cropped.content_type())
            .await?;

        let outcome = self.materialize(run, index, &candidate, &cropped).await;
        self.discard(&interim_key).await;
        outcome
    }

    async fn materialize(
        &self,
        run: &mut ImageRun<'_>,
        index: usize,
        candidate: &CandidateProduct,
        cropped: &CroppedImage,
    ) -> Result<DetectionOutcome, PipelineError> {
        let p = &self.parts;

        tracing::debug!(content_hash = run.content_hash, detection = index, stage = %ImageStage::Validating, "Detection stage");
        let validation = p.validator.validate(candidate, &mut run.budget).await;

        if let Some(upc) = validation.upc.as_deref() {
            if run.seen_upcs.contains(upc) || p.catalog.exists_by_upc(upc).await? {
                return Ok(DetectionOutcome::Skipped(SkipReason::DuplicateUpc));
            }
        }

        tracing::debug!(content_hash = run.content_hash, detection = index, stage = %ImageStage::Pricing, "Detection stage");
        let price = pricing::resolve_price(&validation, candidate.estimated_price);

        tracing::debug!(content_hash = run.content_hash, detection = index, stage = %ImageStage::Materializing, "Detection stage");
        let base_sku = sku::derive_sku(&validation.canonical_brand, &validation.canonical_name);
        let suffixed = sku::with_discriminator(&base_sku, run.content_hash, index);
        let attempts = if p.catalog.sku_taken(&base_sku).await? {
            vec![suffixed]
        } else {
            vec![base_sku, suffixed]
        };

        let status = validation.status();
        let mut last_sku = String::new();
        for product_sku in attempts {
            let image_key = sku::product_image_key(&product_sku, cropped.extension());
            let draft = NewCatalogProduct {
                sku: product_sku.clone(),
                name: validation.canonical_name.clone(),
                brand: validation.canonical_brand.clone(),
                price,
                status,
                upc: validation.upc.clone(),
                categories: validation.categories.clone(),
                size: candidate.size.clone(),
                description: validation.description.clone(),
                image_key: image_key.clone(),
                source_hash: run.content_hash.to_string(),
                source_image: run.original_filename.to_string(),
                detection_index: index as i32,
            };

            // The product image key belongs to whichever job wins the insert.
            match p.catalog.create_draft(&draft).await? {
                CreateOutcome::Created(id) => {
                    p.store
                        .put(&image_key, &cropped.bytes, cropped.content_type())
                        .await?;
                    if let Some(upc) = &validation.upc {
                        run.seen_upcs.insert(upc.clone());
                    }
                    run.enhancements.push(p.enhancer.submit(EnhancementRequest {
                        image_key,
                        description: format!("{} {}", draft.brand, draft.name),
                    }));
                    return Ok(DetectionOutcome::Created {
                        id,
                        sku: product_sku,
                        status,
                    });
                }
                CreateOutcome::DuplicateUpc => {
                    return Ok(DetectionOutcome::Skipped(SkipReason::DuplicateUpc));
                }
                CreateOutcome::AlreadyMaterialized => {
                    return Ok(
                        match p
                            .catalog
                            .materialized_status(run.content_hash, index as i32)
                            .await?
                        {
                            Some(status) => DetectionOutcome::Existing { status },
                            None => DetectionOutcome::Skipped(SkipReason::AlreadyMaterialized),
                        },
                    );
                }
                CreateOutcome::DuplicateSku => {
                    tracing::warn!(
                        batch_id = %run.batch_id,
                        content_hash = run.content_hash,
                        detection = index,
                        sku = %product_sku,
                        "SKU taken at insert"
                    );
                    last_sku = product_sku;
                }
            }
        }

        Err(CatalogError::SkuExhausted(last_sku).into())
    }

    async fn discard(&self, key: &str) {
        if let Err(e) = self.parts.store.delete(key).await {
            tracing::warn!(key, error = %e, "Failed to delete image");
        }
    }

    /// Flip the batch to completed once no image jobs are outstanding, else check again later.
    pub async fn complete_batch(&self, batch_id: Uuid, check: u32) -> Result<(), PipelineError> {
        let p = &self.parts;
        let Some(progress) = p.progress.snapshot(batch_id).await? else {
            tracing::warn!(batch_id = %batch_id, "Batch progress expired before completion");
            return Ok(());
        };

        if progress.status == BatchStatus::Completed {
            return Ok(());
        }

        let outstanding = progress.outstanding_images();
        if outstanding == 0 || check + 1 >= self.settings.max_completion_checks {
            if outstanding > 0 {
                tracing::warn!(
                    batch_id = %batch_id,
                    outstanding,
                    checks = check + 1,
                    "Completing batch with image jobs still outstanding"
                );
            }
            p.progress.mark_completed(batch_id).await?;
            tracing::info!(batch_id = %batch_id, "Batch completed");
            return Ok(());
        }

        p.queue
            .schedule(
                &QueuedJob::new(ImportJob::CompleteBatch {
                    batch_id,
                    check: check + 1,
                }),
                self.settings.completion_delay,
            )
            .await?;
        tracing::debug!(batch_id = %batch_id, outstanding, check, "Batch still running");
        Ok(())
    }

    /// Give up on an image after its last retry so the batch can still complete.
    pub async fn record_failure(&self, batch_id: Uuid, content_hash: &str) -> Result<(), PipelineError> {
        self.parts
            .progress
            .finish_image(batch_id, content_hash, ImageCompletion::Failed)
            .await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Identification(#[from] IdentificationError),

    #[error(transparent)]
    Crop(#[from] CropError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl PipelineError {
    /// Whether running the same job again could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::Crop(CropError::Decode(_) | CropError::UnsupportedFormat(_))
                | PipelineError::Storage(StorageError::NotFound(_))
        )
    }
}
