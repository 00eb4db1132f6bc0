use async_trait::async_trait;
use std::sync::Arc;

use crate::models::product::{CandidateProduct, Category};
use crate::services::prediction::{self, PollPolicy, PredictionError, Predictor};

/// Reads brand, name and pricing hints off one cropped product image.
#[async_trait]
pub trait ProductIdentifier: Send + Sync {
    /// Identify the product in `crop`.
    ///
    /// A crop the model cannot read comes back with `is_product = false`. Errors are
    /// reserved for the service being unreachable or too slow.
    async fn identify(&self, crop: &[u8]) -> Result<CandidateProduct, IdentificationError>;
}

/// Identifier backed by a vision LLM on the prediction service.
pub struct PredictionIdentifier {
    predictor: Arc<dyn Predictor>,
    model_version: String,
    policy: PollPolicy,
}

impl PredictionIdentifier {
    pub fn new(predictor: Arc<dyn Predictor>, model_version: impl Into<String>, policy: PollPolicy) -> Self {
        Self {
            predictor,
            model_version: model_version.into(),
            policy,
        }
    }
}

#[async_trait]
impl ProductIdentifier for PredictionIdentifier {
    async fn identify(&self, crop: &[u8]) -> Result<CandidateProduct, IdentificationError> {
        let input = serde_json::json!({
            "images": [prediction::image_data_uri(crop)],
            "prompt": identification_prompt(),
            "max_output_tokens": 500,
            "temperature": 0.1,
        });

        let done = prediction::run_prediction(
            self.predictor.as_ref(),
            &self.model_version,
            input,
            self.policy,
        )
        .await?;

        if !done.succeeded() {
            tracing::warn!(
                prediction_id = %done.id,
                status = ?done.status,
                "Identification did not succeed, treating crop as unreadable"
            );
            return Ok(CandidateProduct::not_a_product());
        }

        let Some(output) = done.output else {
            return Ok(CandidateProduct::not_a_product());
        };

        let Some(text) = prediction::output_text(output) else {
            tracing::warn!("Identification output is not text");
            return Ok(CandidateProduct::not_a_product());
        };

        match parse_candidate(&text) {
            Some(mut candidate) => {
                candidate.normalize();
                Ok(candidate)
            }
            None => {
                tracing::warn!(
                    output = %text.chars().take(200).collect::<String>(),
                    "Identification output is not a product record"
                );
                Ok(CandidateProduct::not_a_product())
            }
        }
    }
}

/// Instructions sent with every crop. The category list is the store taxonomy.
pub fn identification_prompt() -> String {
    let categories = Category::ALL
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        concat!(
            "You are identifying a single grocery product in a cropped shelf photo.\n",
            "Return ONLY a JSON object with these fields:\n",
            "- brand: the brand name printed on the package (empty string if unreadable)\n",
            "- product_name: the product name without the brand (empty string if unreadable)\n",
            "- full_name: brand and product name together as shown to shoppers\n",
            "- is_product: true only if this is a sellable product and brand and name are readable\n",
            "- product_type: one of packaged, produce, meat, bakery, dairy, other\n",
            "- category: exactly one of: {}\n",
            "- size: net weight or volume as printed (e.g. \"12 oz\"), empty if not visible\n",
            "- estimated_price_usd: typical US grocery retail price as a number\n",
            "Price guidelines: canned goods and sauces 1-4, snacks 1-5, beverages 1-3 per unit, ",
            "dairy 2-6, fresh meat 4-12 per pound, produce 0.5-3 per unit or pound, bakery 2-6.\n",
            "If the brand or product name cannot be read, set is_product to false."
        ),
        categories
    )
}

/// Pull the product record out of free model text.
pub fn parse_candidate(text: &str) -> Option<CandidateProduct> {
    prediction::extract_json(text)
}

#[derive(Debug, thiserror::Error)]
pub enum IdentificationError {
    #[error("Identification prediction failed: {0}")]
    Prediction(#[from] PredictionError),
}
