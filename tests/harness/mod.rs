//! In-memory pipeline wiring with a scripted prediction service

use async_trait::async_trait;
use base64::Engine;
use shelf_import::models::job::{ImportJob, QueuedJob};
use shelf_import::models::product::{NewCatalogProduct, ProductStatus};
use shelf_import::services::{
    adjudicator::PredictionAdjudicator,
    catalog::{CatalogError, CatalogStore, CreateOutcome, MemoryCatalog},
    detection::{DetectionClient, PRODUCT_QUERIES},
    enhancement::EnhancementWorker,
    identification::PredictionIdentifier,
    intake::{BatchIntake, IntakeReceipt, UploadedImage},
    ledger::MemoryLedger,
    open_food_facts::{OffProduct, OpenProductLookup},
    pipeline::{ImportPipeline, PipelineParts, PipelineSettings},
    prediction::{PollPolicy, Prediction, PredictionError, PredictionStatus, Predictor},
    progress::MemoryProgressStore,
    queue::MemoryJobQueue,
    storage::MemoryImageStore,
    upc_lookup::{LookupError, Offer, UpcItem, UpcLookup},
    validation::CrossValidator,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::fixtures::{self, Shade, ShelfItem};

pub const DETECTOR: &str = "detector-v1";
pub const LANGUAGE: &str = "language-v1";
pub const ENHANCER: &str = "enhancer-v1";

pub const MAX_RETRIES: u32 = 3;

/// How the detector answers.
#[derive(Debug, Clone)]
pub enum DetectorScript {
    /// The first product query finds these items; the others find nothing.
    Finds(Vec<ShelfItem>),
    /// Every prediction stays in `processing` until the poll deadline.
    Stalls,
    /// Every request fails at the HTTP level.
    Unreachable,
}

/// Prediction service double keyed by model version.
pub struct ScriptedPredictor {
    detector: Mutex<DetectorScript>,
    identify_calls: AtomicUsize,
    failing_identify_calls: Mutex<HashSet<usize>>,
    pub detector_calls: AtomicUsize,
}

impl ScriptedPredictor {
    pub fn new(detector: DetectorScript) -> Self {
        Self {
            detector: Mutex::new(detector),
            identify_calls: AtomicUsize::new(0),
            failing_identify_calls: Mutex::new(HashSet::new()),
            detector_calls: AtomicUsize::new(0),
        }
    }

    /// Make the n-th identification request (1-based) fail at the transport level.
    pub fn fail_identify_call(&self, n: usize) {
        self.failing_identify_calls.lock().unwrap().insert(n);
    }

    pub fn identify_calls(&self) -> usize {
        self.identify_calls.load(Ordering::SeqCst)
    }

    fn detect(&self, input: &serde_json::Value) -> Result<Prediction, PredictionError> {
        self.detector_calls.fetch_add(1, Ordering::SeqCst);
        match &*self.detector.lock().unwrap() {
            DetectorScript::Finds(items) => {
                let output = if input["query"] == PRODUCT_QUERIES[0] {
                    fixtures::detector_output(items)
                } else {
                    serde_json::json!({ "detections": [] })
                };
                Ok(done("det", Some(output)))
            }
            DetectorScript::Stalls => Ok(Prediction {
                id: "det-stalled".into(),
                status: PredictionStatus::Processing,
                output: None,
                error: None,
            }),
            DetectorScript::Unreachable => Err(PredictionError::Api {
                status: 502,
                body: "bad gateway".into(),
            }),
        }
    }

    fn identify(&self, input: &serde_json::Value) -> Result<Prediction, PredictionError> {
        let call = self.identify_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_identify_calls.lock().unwrap().contains(&call) {
            return Err(PredictionError::Api {
                status: 503,
                body: "overloaded".into(),
            });
        }
        let uri = input["images"][0].as_str().unwrap_or_default();
        let shade = crop_shade(uri);
        Ok(done(
            "ident",
            Some(serde_json::json!(fixtures::identification_answer(shade))),
        ))
    }
}

fn done(id: &str, output: Option<serde_json::Value>) -> Prediction {
    Prediction {
        id: id.into(),
        status: PredictionStatus::Succeeded,
        output,
        error: None,
    }
}

/// Shade at the center of a base64 data URI crop.
fn crop_shade(uri: &str) -> Shade {
    let encoded = uri.split_once(";base64,").map(|(_, d)| d).unwrap_or_default();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .expect("crop is base64");
    let crop = image::load_from_memory(&bytes).expect("crop decodes").to_rgb8();
    let pixel = crop.get_pixel(crop.width() / 2, crop.height() / 2);
    Shade::nearest(pixel.0)
}

#[async_trait]
impl Predictor for ScriptedPredictor {
    async fn submit(
        &self,
        version: &str,
        input: serde_json::Value,
    ) -> Result<Prediction, PredictionError> {
        match version {
            DETECTOR => self.detect(&input),
            LANGUAGE if input.get("images").is_some() => self.identify(&input),
            LANGUAGE => Ok(done(
                "judge",
                Some(serde_json::json!(r#"{"is_match": false, "reason": "different product"}"#)),
            )),
            ENHANCER => Ok(Prediction {
                id: "enh".into(),
                status: PredictionStatus::Failed,
                output: None,
                error: Some(serde_json::json!("no capacity")),
            }),
            other => panic!("unexpected model version {}", other),
        }
    }

    async fn fetch(&self, id: &str) -> Result<Prediction, PredictionError> {
        Ok(Prediction {
            id: id.into(),
            status: PredictionStatus::Processing,
            output: None,
            error: None,
        })
    }
}

/// UPC database double that knows Goya Black Beans.
#[derive(Default)]
pub struct FakeUpcDb {
    pub rate_limited: AtomicBool,
    pub calls: AtomicUsize,
}

pub fn goya_record() -> UpcItem {
    UpcItem {
        title: "Goya Black Beans 15.5 oz".into(),
        brand: "Goya".into(),
        category: "Canned Beans".into(),
        description: "Premium black beans".into(),
        ean: Some(fixtures::GOYA_UPC.into()),
        offers: vec![Offer {
            price: Some(fixtures::GOYA_PRICE),
        }],
        ..UpcItem::default()
    }
}

#[async_trait]
impl UpcLookup for FakeUpcDb {
    async fn search(&self, query: &str) -> Result<Vec<UpcItem>, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.rate_limited.load(Ordering::SeqCst) {
            return Err(LookupError::RateLimited);
        }
        if query.contains("Black Beans") {
            Ok(vec![goya_record()])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Open product database double with no matching products.
pub struct EmptyOpenDb;

#[async_trait]
impl OpenProductLookup for EmptyOpenDb {
    async fn search(&self, _query: &str) -> Result<Vec<OffProduct>, LookupError> {
        Ok(Vec::new())
    }
}

/// Catalog whose advisory lookups always miss, as when another worker commits the same
/// UPC or SKU between this job's lookup and its insert.
pub struct StaleLookupCatalog(pub Arc<MemoryCatalog>);

#[async_trait]
impl CatalogStore for StaleLookupCatalog {
    async fn create_draft(&self, product: &NewCatalogProduct) -> Result<CreateOutcome, CatalogError> {
        self.0.create_draft(product).await
    }

    async fn exists_by_upc(&self, _upc: &str) -> Result<bool, CatalogError> {
        Ok(false)
    }

    async fn sku_taken(&self, _sku: &str) -> Result<bool, CatalogError> {
        Ok(false)
    }

    async fn materialized_status(
        &self,
        source_hash: &str,
        detection_index: i32,
    ) -> Result<Option<ProductStatus>, CatalogError> {
        self.0.materialized_status(source_hash, detection_index).await
    }
}

pub struct Harness {
    pub predictor: Arc<ScriptedPredictor>,
    pub upc: Arc<FakeUpcDb>,
    pub store: Arc<MemoryImageStore>,
    pub catalog: Arc<MemoryCatalog>,
    pub ledger: Arc<MemoryLedger>,
    pub progress: Arc<MemoryProgressStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub intake: BatchIntake,
    pub pipeline: ImportPipeline,
}

impl Harness {
    pub fn new(detector: DetectorScript) -> Self {
        Self::build(detector, false)
    }

    /// Pipeline sees a catalog whose UPC and SKU lookups never find anything.
    pub fn with_stale_lookups(detector: DetectorScript) -> Self {
        Self::build(detector, true)
    }

    fn build(detector: DetectorScript, stale_lookups: bool) -> Self {
        let predictor = Arc::new(ScriptedPredictor::new(detector));
        let upc = Arc::new(FakeUpcDb::default());
        let store = Arc::new(MemoryImageStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let ledger = Arc::new(MemoryLedger::new());
        let progress = Arc::new(MemoryProgressStore::new());
        let queue = Arc::new(MemoryJobQueue::new());

        let policy = PollPolicy {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(20),
        };

        let intake = BatchIntake::new(
            store.clone(),
            ledger.clone(),
            progress.clone(),
            queue.clone(),
            Duration::ZERO,
        );

        let validator = CrossValidator::new(
            upc.clone(),
            Arc::new(EmptyOpenDb),
            Arc::new(PredictionAdjudicator::new(predictor.clone(), LANGUAGE, policy)),
        );

        let enhancer = EnhancementWorker::new(predictor.clone(), store.clone(), ENHANCER, policy, 2)
            .expect("enhancement worker");

        let pipeline = ImportPipeline::new(
            PipelineParts {
                detector: DetectionClient::new(predictor.clone(), DETECTOR, policy, 0.5),
                identifier: Arc::new(PredictionIdentifier::new(predictor.clone(), LANGUAGE, policy)),
                validator,
                enhancer: Arc::new(enhancer),
                store: store.clone(),
                catalog: if stale_lookups {
                    Arc::new(StaleLookupCatalog(catalog.clone()))
                } else {
                    catalog.clone()
                },
                ledger: ledger.clone(),
                progress: progress.clone(),
                queue: queue.clone(),
            },
            PipelineSettings {
                completion_delay: Duration::ZERO,
                ..PipelineSettings::default()
            },
        );

        Self {
            predictor,
            upc,
            store,
            catalog,
            ledger,
            progress,
            queue,
            intake,
            pipeline,
        }
    }

    pub async fn submit(&self, photos: &[(&str, Vec<u8>)]) -> IntakeReceipt {
        let files = photos
            .iter()
            .map(|(name, bytes)| UploadedImage {
                filename: name.to_string(),
                bytes: bytes.clone(),
            })
            .collect();
        self.intake.submit(files).await.expect("batch accepted")
    }

    /// Run queued jobs the way the worker does, retries included, until the queue is empty.
    pub async fn run_until_idle(&self) -> usize {
        let mut failures = 0;
        loop {
            let jobs = self.queue.drain();
            if jobs.is_empty() {
                return failures;
            }
            for job in jobs {
                if let Err(e) = self.pipeline.run(&job).await {
                    failures += 1;
                    if e.is_retryable() && job.attempt < MAX_RETRIES {
                        self.requeue(&job.retried()).await;
                    } else if let ImportJob::ProcessImage {
                        batch_id,
                        content_hash,
                        ..
                    } = &job.job
                    {
                        self.pipeline
                            .record_failure(*batch_id, content_hash)
                            .await
                            .expect("record failure");
                    }
                }
            }
        }
    }

    async fn requeue(&self, job: &QueuedJob) {
        use shelf_import::services::queue::JobQueue;
        self.queue.enqueue(job).await.expect("requeue");
    }
}
