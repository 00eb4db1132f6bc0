use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::models::batch::{ProcessedImageMarker, SourceImage};
use crate::services::ledger::{ImageLedger, LedgerError};

/// Record an uploaded source image; returns false when the hash was already known
pub async fn insert_source(pool: &PgPool, image: &SourceImage) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO source_images (content_hash, stored_key, original_filename, content_type, batch_id)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (content_hash) DO NOTHING
        "#,
    )
    .bind(&image.content_hash)
    .bind(&image.stored_key)
    .bind(&image.original_filename)
    .bind(&image.content_type)
    .bind(image.batch_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn marker_exists(pool: &PgPool, content_hash: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        "SELECT EXISTS(SELECT 1 FROM processed_images WHERE content_hash = $1) AS found",
    )
    .bind(content_hash)
    .fetch_one(pool)
    .await?;
    row.try_get("found")
}

/// Write the processed marker; returns false when another job wrote it first
pub async fn insert_marker(
    pool: &PgPool,
    marker: &ProcessedImageMarker,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO processed_images
            (content_hash, original_filename, batch_id, products_detected, products_created)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (content_hash) DO NOTHING
        "#,
    )
    .bind(&marker.content_hash)
    .bind(&marker.original_filename)
    .bind(marker.batch_id)
    .bind(marker.products_detected)
    .bind(marker.products_created)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Get the processed marker for an image, if any
pub async fn get_marker(
    pool: &PgPool,
    content_hash: &str,
) -> Result<Option<ProcessedImageMarker>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT content_hash, original_filename, batch_id, products_detected, products_created
        FROM processed_images
        WHERE content_hash = $1
        "#,
    )
    .bind(content_hash)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        Ok(ProcessedImageMarker {
            content_hash: r.try_get("content_hash")?,
            original_filename: r.try_get("original_filename")?,
            batch_id: r.try_get("batch_id")?,
            products_detected: r.try_get("products_detected")?,
            products_created: r.try_get("products_created")?,
        })
    })
    .transpose()
}

/// Postgres-backed image ledger.
#[derive(Clone)]
pub struct PgImageLedger {
    pool: PgPool,
}

impl PgImageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImageLedger for PgImageLedger {
    async fn record_source(&self, image: &SourceImage) -> Result<bool, LedgerError> {
        Ok(insert_source(&self.pool, image).await?)
    }

    async fn is_processed(&self, content_hash: &str) -> Result<bool, LedgerError> {
        Ok(marker_exists(&self.pool, content_hash).await?)
    }

    async fn mark_processed(&self, marker: &ProcessedImageMarker) -> Result<bool, LedgerError> {
        Ok(insert_marker(&self.pool, marker).await?)
    }
}
