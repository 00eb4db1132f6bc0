use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::services::prediction::{self, PollPolicy, PredictionError, Predictor};

/// Decision on whether a database hit is the detected product.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MatchVerdict {
    #[serde(default)]
    pub is_match: bool,
    #[serde(default)]
    pub reason: String,
}

impl MatchVerdict {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            is_match: false,
            reason: reason.into(),
        }
    }
}

/// Both sides of a candidate match, as brand and product name.
#[derive(Debug, Clone, Copy)]
pub struct MatchQuery<'a> {
    pub detected_brand: &'a str,
    pub detected_name: &'a str,
    pub found_brand: &'a str,
    pub found_name: &'a str,
}

#[async_trait]
pub trait MatchAdjudicator: Send + Sync {
    /// Decide whether the found record describes the detected product.
    ///
    /// Never fails: an adjudication that cannot be completed is a rejection.
    async fn adjudicate(&self, query: MatchQuery<'_>) -> MatchVerdict;
}

/// Adjudicator that asks the text LLM on the prediction service.
pub struct PredictionAdjudicator {
    predictor: Arc<dyn Predictor>,
    model_version: String,
    policy: PollPolicy,
}

impl PredictionAdjudicator {
    pub fn new(predictor: Arc<dyn Predictor>, model_version: impl Into<String>, policy: PollPolicy) -> Self {
        Self {
            predictor,
            model_version: model_version.into(),
            policy,
        }
    }

    async fn ask(&self, query: MatchQuery<'_>) -> Result<MatchVerdict, PredictionError> {
        let input = serde_json::json!({
            "prompt": adjudication_prompt(query),
            "max_output_tokens": 200,
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
            return Ok(MatchVerdict::rejected("adjudication did not succeed"));
        }

        let verdict = done
            .output
            .and_then(prediction::output_text)
            .and_then(|text| prediction::extract_json::<MatchVerdict>(&text))
            .unwrap_or_else(|| MatchVerdict::rejected("unparseable adjudication"));
        Ok(verdict)
    }
}

#[async_trait]
impl MatchAdjudicator for PredictionAdjudicator {
    async fn adjudicate(&self, query: MatchQuery<'_>) -> MatchVerdict {
        match self.ask(query).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!(error = %e, "Match adjudication failed, treating as no match");
                MatchVerdict::rejected("adjudication error")
            }
        }
    }
}

fn adjudication_prompt(query: MatchQuery<'_>) -> String {
    format!(
        r#"A product was read from a shelf photo and a possible match was found in a product database.
Decide whether they are the SAME product.

DETECTED FROM IMAGE:
- Brand: "{}"
- Product: "{}"

DATABASE RESULT:
- Brand: "{}"
- Product: "{}"

RULES:
- The brands must be the same company (exact match or a known variant)
- The product type must match (both creams, both yogurts, etc.)
- Capitalization and minor spelling differences are fine
- A different product from the same brand is NOT a match
- A completely different brand is NOT a match

Return ONLY JSON: {{"is_match": true or false, "reason": "brief explanation"}}"#,
        query.detected_brand, query.detected_name, query.found_brand, query.found_name
    )
}
