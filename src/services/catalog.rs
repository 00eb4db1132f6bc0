use async_trait::async_trait;
use chrono::Utc;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::product::{CatalogProduct, NewCatalogProduct, ProductStatus};

/// Result of trying to insert a draft product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Uuid),
    /// Another product already carries this UPC.
    DuplicateUpc,
    DuplicateSku,
    /// This detection of this source image was materialized by an earlier attempt.
    AlreadyMaterialized,
}

/// Persistent catalog of draft products.
///
/// Uniqueness of SKU, UPC and `(source_hash, detection_index)` is enforced by the store at
/// write time; the lookups below are advisory fast paths.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn create_draft(&self, product: &NewCatalogProduct) -> Result<CreateOutcome, CatalogError>;

    async fn exists_by_upc(&self, upc: &str) -> Result<bool, CatalogError>;

    async fn sku_taken(&self, sku: &str) -> Result<bool, CatalogError>;

    /// Status of the product an earlier attempt made from this detection, if any.
    async fn materialized_status(
        &self,
        source_hash: &str,
        detection_index: i32,
    ) -> Result<Option<ProductStatus>, CatalogError>;
}

/// In-process catalog used by tests and local runs.
#[derive(Default)]
pub struct MemoryCatalog {
    products: Mutex<Vec<CatalogProduct>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn products(&self) -> Vec<CatalogProduct> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CatalogProduct>> {
        self.products.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn create_draft(&self, product: &NewCatalogProduct) -> Result<CreateOutcome, CatalogError> {
        let mut products = self.lock();

        if products
            .iter()
            .any(|p| p.source_hash == product.source_hash && p.detection_index == product.detection_index)
        {
            return Ok(CreateOutcome::AlreadyMaterialized);
        }
        if let Some(upc) = product.upc.as_deref() {
            if products.iter().any(|p| p.upc.as_deref() == Some(upc)) {
                return Ok(CreateOutcome::DuplicateUpc);
            }
        }
        if products.iter().any(|p| p.sku == product.sku) {
            return Ok(CreateOutcome::DuplicateSku);
        }

        let id = Uuid::new_v4();
        products.push(CatalogProduct::from_new(id, product.clone(), Utc::now()));
        Ok(CreateOutcome::Created(id))
    }

    async fn exists_by_upc(&self, upc: &str) -> Result<bool, CatalogError> {
        Ok(self.lock().iter().any(|p| p.upc.as_deref() == Some(upc)))
    }

    async fn sku_taken(&self, sku: &str) -> Result<bool, CatalogError> {
        Ok(self.lock().iter().any(|p| p.sku == sku))
    }

    async fn materialized_status(
        &self,
        source_hash: &str,
        detection_index: i32,
    ) -> Result<Option<ProductStatus>, CatalogError> {
        Ok(self
            .lock()
            .iter()
            .find(|p| p.source_hash == source_hash && p.detection_index == detection_index)
            .map(|p| p.status))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("SKU {0} is still taken after adding a discriminator")]
    SkuExhausted(String),
}
