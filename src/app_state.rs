use sqlx::PgPool;
use std::sync::Arc;

use crate::services::intake::BatchIntake;
use crate::services::progress::ProgressStore;
use crate::services::queue::RedisJobQueue;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub intake: Arc<BatchIntake>,
    pub progress: Arc<dyn ProgressStore>,
    pub queue: Arc<RedisJobQueue>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        intake: BatchIntake,
        progress: Arc<dyn ProgressStore>,
        queue: Arc<RedisJobQueue>,
    ) -> Self {
        Self {
            db,
            intake: Arc::new(intake),
            progress,
            queue,
        }
    }
}
