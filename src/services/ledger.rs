use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::batch::{ProcessedImageMarker, SourceImage};

/// Durable record of uploaded source images and of images whose processing finished.
#[async_trait]
pub trait ImageLedger: Send + Sync {
    /// Record an uploaded image. Returns `false` when the content was already known.
    async fn record_source(&self, image: &SourceImage) -> Result<bool, LedgerError>;

    async fn is_processed(&self, content_hash: &str) -> Result<bool, LedgerError>;

    /// Write the processed marker. Returns `false` if another job wrote it first.
    async fn mark_processed(&self, marker: &ProcessedImageMarker) -> Result<bool, LedgerError>;
}

#[derive(Default)]
pub struct MemoryLedger {
    sources: Mutex<HashMap<String, SourceImage>>,
    markers: Mutex<HashMap<String, ProcessedImageMarker>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn marker(&self, content_hash: &str) -> Option<ProcessedImageMarker> {
        self.markers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(content_hash)
            .cloned()
    }

    pub fn source_count(&self) -> usize {
        self.sources.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl ImageLedger for MemoryLedger {
    async fn record_source(&self, image: &SourceImage) -> Result<bool, LedgerError> {
        let mut sources = self.sources.lock().unwrap_or_else(|p| p.into_inner());
        if sources.contains_key(&image.content_hash) {
            return Ok(false);
        }
        sources.insert(image.content_hash.clone(), image.clone());
        Ok(true)
    }

    async fn is_processed(&self, content_hash: &str) -> Result<bool, LedgerError> {
        Ok(self
            .markers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(content_hash))
    }

    async fn mark_processed(&self, marker: &ProcessedImageMarker) -> Result<bool, LedgerError> {
        let mut markers = self.markers.lock().unwrap_or_else(|p| p.into_inner());
        if markers.contains_key(&marker.content_hash) {
            return Ok(false);
        }
        markers.insert(marker.content_hash.clone(), marker.clone());
        Ok(true)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Image ledger database error: {0}")]
    Database(#[from] sqlx::Error),
}
