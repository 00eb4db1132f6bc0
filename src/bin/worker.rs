use shelf_import::{
    config::AppConfig,
    db::{self, catalog_queries::PgCatalogStore, image_queries::PgImageLedger},
    models::job::{ImportJob, QueuedJob},
    services::{
        adjudicator::PredictionAdjudicator,
        detection::DetectionClient,
        enhancement::EnhancementWorker,
        identification::PredictionIdentifier,
        open_food_facts::OpenFoodFactsClient,
        pipeline::{ImportPipeline, PipelineParts, PipelineSettings},
        prediction::{Predictor, ReplicateClient},
        progress::RedisProgressStore,
        queue::{Delivery, JobQueue, RedisJobQueue},
        storage::{ImageStore, R2ImageStore},
        upc_lookup::UpcItemDbClient,
        validation::CrossValidator,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL_MS: u64 = 1000;

struct Worker {
    pipeline: ImportPipeline,
    queue: Arc<RedisJobQueue>,
    max_retries: u32,
}

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting shelf import worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus metrics exporter");

    metrics::describe_counter!(
        "import_products_created_total",
        "Draft products created, by review status"
    );
    metrics::describe_counter!(
        "import_detections_skipped_total",
        "Detections that did not become products, by reason"
    );
    metrics::describe_counter!(
        "import_jobs_failed_total",
        "Import jobs given up on after the last retry"
    );
    metrics::describe_histogram!("import_image_seconds", "Time to process one source image");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.database_max_connections)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Initializing services");
    let store: Arc<dyn ImageStore> = Arc::new(
        R2ImageStore::new(
            &config.r2_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
        )
        .expect("Failed to initialize R2 client"),
    );

    let predictor: Arc<dyn Predictor> = Arc::new(
        ReplicateClient::new(&config.replicate_base_url, &config.replicate_api_token)
            .expect("Failed to initialize prediction client"),
    );
    let policy = config.poll_policy();

    let queue = Arc::new(RedisJobQueue::new(&config.redis_url).expect("Failed to initialize job queue"));
    let progress = Arc::new(
        RedisProgressStore::new(&config.redis_url, config.progress_ttl())
            .expect("Failed to initialize progress store"),
    );

    let validator = CrossValidator::new(
        Arc::new(
            UpcItemDbClient::new(config.upcitemdb_api_key.clone())
                .expect("Failed to initialize UPC lookup client"),
        ),
        Arc::new(
            OpenFoodFactsClient::new(config.lookup_delay())
                .expect("Failed to initialize Open Food Facts client"),
        ),
        Arc::new(PredictionAdjudicator::new(
            predictor.clone(),
            config.identification_model.clone(),
            policy,
        )),
    );

    let enhancer = EnhancementWorker::new(
        predictor.clone(),
        store.clone(),
        config.enhancement_model.clone(),
        policy,
        config.enhancement_concurrency,
    )
    .expect("Failed to initialize enhancement worker");

    let pipeline = ImportPipeline::new(
        PipelineParts {
            detector: DetectionClient::new(
                predictor.clone(),
                config.detection_model.clone(),
                policy,
                config.iou_threshold,
            ),
            identifier: Arc::new(PredictionIdentifier::new(
                predictor,
                config.identification_model.clone(),
                policy,
            )),
            validator,
            enhancer: Arc::new(enhancer),
            store,
            catalog: Arc::new(PgCatalogStore::new(db_pool.clone())),
            ledger: Arc::new(PgImageLedger::new(db_pool)),
            progress,
            queue: queue.clone(),
        },
        PipelineSettings::from_config(&config),
    );

    let worker = Arc::new(Worker {
        pipeline,
        queue,
        max_retries: config.max_job_retries,
    });
    let permits = Arc::new(Semaphore::new(config.worker_concurrency));

    match worker.queue.recover_stranded().await {
        Ok(0) => {}
        Ok(moved) => tracing::warn!(moved, "Requeued jobs stranded by a previous worker"),
        Err(e) => tracing::error!(error = %e, "Failed to requeue stranded jobs"),
    }

    tracing::info!(
        concurrency = config.worker_concurrency,
        "Worker ready, starting job processing loop"
    );

    loop {
        if let Err(e) = worker.queue.promote_due().await {
            tracing::error!(error = %e, "Failed to promote scheduled jobs");
            sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            continue;
        }

        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .expect("Worker semaphore closed");

        match worker.queue.dequeue().await {
            Ok(Some(delivery)) => {
                let worker = Arc::clone(&worker);
                tokio::spawn(async move {
                    worker.handle(delivery).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tracing::trace!("No jobs available, sleeping");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                drop(permit);
                tracing::error!(error = %e, "Failed to dequeue job");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

impl Worker {
    async fn handle(&self, delivery: Delivery) {
        let job = &delivery.job;
        let start = Instant::now();

        tracing::info!(
            job_id = %job.job_id,
            batch_id = %job.job.batch_id(),
            kind = job.job.kind(),
            attempt = job.attempt,
            "Processing import job"
        );

        match self.pipeline.run(job).await {
            Ok(()) => {
                tracing::info!(
                    job_id = %job.job_id,
                    kind = job.job.kind(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Job completed"
                );
            }
            Err(e) if e.is_retryable() && job.attempt < self.max_retries => {
                let retry = job.retried();
                tracing::warn!(
                    job_id = %job.job_id,
                    attempt = retry.attempt,
                    error = %e,
                    "Job failed, scheduling retry"
                );
                if let Err(qe) = self.queue.schedule(&retry, retry.backoff()).await {
                    tracing::error!(job_id = %job.job_id, error = %qe, "Failed to schedule retry");
                    self.give_up(job).await;
                }
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job.job_id,
                    attempt = job.attempt,
                    error = %e,
                    "Job failed permanently"
                );
                self.give_up(job).await;
            }
        }

        if let Err(e) = self.queue.complete(&delivery).await {
            tracing::error!(job_id = %job.job_id, error = %e, "Failed to acknowledge job");
        }
    }

    async fn give_up(&self, job: &QueuedJob) {
        metrics::counter!("import_jobs_failed_total").increment(1);
        if let ImportJob::ProcessImage {
            batch_id,
            content_hash,
            ..
        } = &job.job
        {
            if let Err(e) = self.pipeline.record_failure(*batch_id, content_hash).await {
                tracing::error!(batch_id = %batch_id, error = %e, "Failed to record failed image");
            }
        }
    }
}
