use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::product::{NewCatalogProduct, ProductStatus};
use crate::services::catalog::{CatalogError, CatalogStore, CreateOutcome};

const SKU_CONSTRAINT: &str = "catalog_products_sku_key";
const UPC_CONSTRAINT: &str = "catalog_products_upc_key";
const DETECTION_CONSTRAINT: &str = "catalog_products_detection_key";

/// Insert a draft product, reporting unique-constraint conflicts as outcomes
pub async fn insert_draft(
    pool: &PgPool,
    product: &NewCatalogProduct,
) -> Result<CreateOutcome, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO catalog_products
            (sku, name, brand, price, status, upc, categories, size, description,
             image_key, source_hash, source_image, detection_index)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING id
        "#,
    )
    .bind(&product.sku)
    .bind(&product.name)
    .bind(&product.brand)
    .bind(product.price)
    .bind(product.status.as_ref())
    .bind(product.upc.as_deref())
    .bind(&product.categories)
    .bind(&product.size)
    .bind(product.description.as_deref())
    .bind(&product.image_key)
    .bind(&product.source_hash)
    .bind(&product.source_image)
    .bind(product.detection_index)
    .fetch_one(pool)
    .await;

    match result {
        Ok(row) => Ok(CreateOutcome::Created(row.try_get::<Uuid, _>("id")?)),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            match db_err.constraint() {
                Some(UPC_CONSTRAINT) => Ok(CreateOutcome::DuplicateUpc),
                Some(SKU_CONSTRAINT) => Ok(CreateOutcome::DuplicateSku),
                Some(DETECTION_CONSTRAINT) => Ok(CreateOutcome::AlreadyMaterialized),
                _ => Err(sqlx::Error::Database(db_err)),
            }
        }
        Err(e) => Err(e),
    }
}

pub async fn upc_exists(pool: &PgPool, upc: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM catalog_products WHERE upc = $1) AS found")
        .bind(upc)
        .fetch_one(pool)
        .await?;
    row.try_get("found")
}

pub async fn sku_exists(pool: &PgPool, sku: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM catalog_products WHERE sku = $1) AS found")
        .bind(sku)
        .fetch_one(pool)
        .await?;
    row.try_get("found")
}

pub async fn detection_status(
    pool: &PgPool,
    source_hash: &str,
    detection_index: i32,
) -> Result<Option<ProductStatus>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT status FROM catalog_products
        WHERE source_hash = $1 AND detection_index = $2
        "#,
    )
    .bind(source_hash)
    .bind(detection_index)
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        let raw: String = row.try_get("status")?;
        ProductStatus::from_str(&raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
    })
    .transpose()
}

/// Count draft products created from one source image
pub async fn count_for_source(pool: &PgPool, source_hash: &str) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS total FROM catalog_products WHERE source_hash = $1")
        .bind(source_hash)
        .fetch_one(pool)
        .await?;
    row.try_get("total")
}

/// Postgres-backed catalog store.
#[derive(Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn create_draft(&self, product: &NewCatalogProduct) -> Result<CreateOutcome, CatalogError> {
        Ok(insert_draft(&self.pool, product).await?)
    }

    async fn exists_by_upc(&self, upc: &str) -> Result<bool, CatalogError> {
        Ok(upc_exists(&self.pool, upc).await?)
    }

    async fn sku_taken(&self, sku: &str) -> Result<bool, CatalogError> {
        Ok(sku_exists(&self.pool, sku).await?)
    }

    async fn materialized_status(
        &self,
        source_hash: &str,
        detection_index: i32,
    ) -> Result<Option<ProductStatus>, CatalogError> {
        Ok(detection_status(&self.pool, source_hash, detection_index).await?)
    }
}
