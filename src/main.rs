use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use shelf_import::app_state::AppState;
use shelf_import::config::AppConfig;
use shelf_import::db::{self, image_queries::PgImageLedger};
use shelf_import::routes::{self, metrics::MetricsState};
use shelf_import::services::{
    intake::{BatchIntake, MAX_FILES_PER_BATCH, MAX_FILE_BYTES},
    progress::RedisProgressStore,
    queue::RedisJobQueue,
    storage::R2ImageStore,
};

/// Every file at the size limit plus room for multipart framing.
const MAX_REQUEST_BYTES: usize = MAX_FILES_PER_BATCH * MAX_FILE_BYTES + 5 * 1024 * 1024;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing shelf-import server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("import_batches_total", "Import batches accepted");
    metrics::describe_counter!("import_images_total", "Distinct images queued for import");
    metrics::describe_gauge!(
        "import_queue_depth",
        "Import jobs per queue group (pending, running, scheduled)"
    );

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, config.database_max_connections)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing R2 storage client");
    let store = R2ImageStore::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");

    tracing::info!("Connecting to Redis");
    let queue = Arc::new(RedisJobQueue::new(&config.redis_url).expect("Failed to initialize job queue"));
    let progress = Arc::new(
        RedisProgressStore::new(&config.redis_url, config.progress_ttl())
            .expect("Failed to initialize progress store"),
    );

    let intake = BatchIntake::new(
        Arc::new(store),
        Arc::new(PgImageLedger::new(db_pool.clone())),
        progress.clone(),
        queue.clone(),
        config.batch_grace(),
    );

    let state = AppState::new(db_pool, intake, progress, queue.clone());
    let metrics_state = MetricsState {
        handle: prometheus_handle,
        queue,
    };

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/imports", post(routes::imports::submit_import))
        .route(
            "/api/v1/imports/{batch_id}",
            get(routes::imports::get_import_status),
        )
        .route("/api/v1/queue", get(routes::imports::get_queue_status))
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(metrics_state),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
