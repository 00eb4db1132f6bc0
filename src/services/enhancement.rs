use base64::Engine;
use image::{DynamicImage, ImageFormat};
use serde::Deserialize;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::services::crop::content_type_for;
use crate::services::prediction::{self, PollPolicy, PredictionError, Predictor};
use crate::services::storage::{ImageStore, StorageError};

/// One product image to redraw on a clean background.
#[derive(Debug, Clone)]
pub struct EnhancementRequest {
    pub image_key: String,
    pub description: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImageOutput {
    Single(String),
    Many(Vec<String>),
}

impl ImageOutput {
    fn first(self) -> Option<String> {
        match self {
            ImageOutput::Single(url) => Some(url),
            ImageOutput::Many(urls) => urls.into_iter().next(),
        }
    }
}

/// Best-effort product image enhancement with a fixed number of concurrent calls.
///
/// Failures never propagate: the original image simply stays in place.
pub struct EnhancementWorker {
    predictor: Arc<dyn Predictor>,
    store: Arc<dyn ImageStore>,
    http: reqwest::Client,
    model: String,
    policy: PollPolicy,
    permits: Arc<Semaphore>,
}

impl EnhancementWorker {
    pub fn new(
        predictor: Arc<dyn Predictor>,
        store: Arc<dyn ImageStore>,
        model: impl Into<String>,
        policy: PollPolicy,
        concurrency: usize,
    ) -> Result<Self, EnhancementError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            predictor,
            store,
            http,
            model: model.into(),
            policy,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        })
    }

    /// Queue an enhancement. The handle resolves to whether the image was replaced.
    pub fn submit(self: &Arc<Self>, request: EnhancementRequest) -> JoinHandle<bool> {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(_permit) = worker.permits.acquire().await else {
                return false;
            };
            match worker.enhance(&request).await {
                Ok(()) => {
                    tracing::info!(image_key = %request.image_key, "Product image enhanced");
                    true
                }
                Err(e) => {
                    tracing::warn!(
                        image_key = %request.image_key,
                        error = %e,
                        "Enhancement failed, keeping original image"
                    );
                    false
                }
            }
        })
    }

    async fn enhance(&self, request: &EnhancementRequest) -> Result<(), EnhancementError> {
        let original = self.store.get(&request.image_key).await?;

        let input = serde_json::json!({
            "prompt": enhancement_prompt(&request.description),
            "image_input": [prediction::image_data_uri(&original)],
            "aspect_ratio": "1:1",
            "resolution": "1K",
            "output_format": "jpg",
        });

        let done = prediction::run_prediction(self.predictor.as_ref(), &self.model, input, self.policy).await?;
        if !done.succeeded() {
            return Err(EnhancementError::NotSucceeded(format!("{:?}", done.status)));
        }

        let location = done
            .output
            .and_then(|o| serde_json::from_value::<ImageOutput>(o).ok())
            .and_then(ImageOutput::first)
            .filter(|l| !l.trim().is_empty())
            .ok_or(EnhancementError::NoOutput)?;

        let bytes = self.download(&location).await?;
        let format = image::guess_format(&bytes).map_err(|_| EnhancementError::NotAnImage)?;

        // The catalog row names the key, so the stored bytes must keep its extension's format.
        let target = ImageFormat::from_path(&request.image_key).unwrap_or(format);
        let bytes = if target == format {
            bytes
        } else {
            reencode(&bytes, target)?
        };

        self.store
            .put(&request.image_key, &bytes, content_type_for(target))
            .await?;
        Ok(())
    }

    async fn download(&self, location: &str) -> Result<Vec<u8>, EnhancementError> {
        if let Some(encoded) = location
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(";base64,"))
            .map(|(_, data)| data)
        {
            return base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|_| EnhancementError::NotAnImage);
        }

        let response = self.http.get(location).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

fn reencode(bytes: &[u8], target: ImageFormat) -> Result<Vec<u8>, EnhancementError> {
    let decoded = image::load_from_memory(bytes)?;
    // JPEG has no alpha channel.
    let decoded = if target == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(decoded.to_rgb8())
    } else {
        decoded
    };
    let mut out = Vec::new();
    decoded.write_to(&mut Cursor::new(&mut out), target)?;
    Ok(out)
}

pub fn enhancement_prompt(description: &str) -> String {
    format!(
        "Product photo of {}, clean white background, professional product photography",
        description
    )
}

#[derive(Debug, thiserror::Error)]
pub enum EnhancementError {
    #[error("Enhancement prediction failed: {0}")]
    Prediction(#[from] PredictionError),

    #[error("Enhancement ended with status {0}")]
    NotSucceeded(String),

    #[error("Enhancement produced no image")]
    NoOutput,

    #[error("Enhanced output is not an image")]
    NotAnImage,

    #[error("Failed to re-encode enhanced image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Failed to download enhanced image: {0}")]
    Download(#[from] reqwest::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
