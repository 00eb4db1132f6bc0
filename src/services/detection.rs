use serde::Deserialize;
use std::sync::Arc;

use crate::models::detection::Detection;
use crate::services::dedup;
use crate::services::prediction::{self, PollPolicy, PredictionError, Predictor};

/// One prompt per product family; a single prompt misses anything outside its vocabulary.
pub const PRODUCT_QUERIES: [&str; 5] = [
    "bottle . jar . carton . can . box . package",
    "tomato . lime . pepper . avocado . onion . lettuce . cucumber . chili",
    "chicken . meat . sausage . chorizo",
    "bread . tortilla . pan dulce . pastry",
    "yogurt . cream . cheese . milk",
];

const BOX_THRESHOLD: f64 = 0.15;
const TEXT_THRESHOLD: f64 = 0.15;

/// Output record of the grounding detector.
#[derive(Debug, Deserialize)]
struct DetectorOutput {
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Open-vocabulary product detector over the prediction service.
pub struct DetectionClient {
    predictor: Arc<dyn Predictor>,
    model_version: String,
    policy: PollPolicy,
    iou_threshold: f64,
}

impl DetectionClient {
    pub fn new(
        predictor: Arc<dyn Predictor>,
        model_version: impl Into<String>,
        policy: PollPolicy,
        iou_threshold: f64,
    ) -> Self {
        Self {
            predictor,
            model_version: model_version.into(),
            policy,
            iou_threshold,
        }
    }

    /// Run every product query over the image and merge the results.
    ///
    /// A query that times out, fails, or returns malformed output contributes nothing.
    /// Only when every query fails at the transport level is the image reported as
    /// undetectable, so the job can be retried as a whole.
    pub async fn detect_products(&self, image_bytes: &[u8]) -> Result<Vec<Detection>, DetectionError> {
        let image = prediction::image_data_uri(image_bytes);
        let mut all = Vec::new();
        let mut transport_failures = 0usize;
        let mut last_error = None;

        for (index, query) in PRODUCT_QUERIES.iter().enumerate() {
            match self.run_query(&image, query).await {
                Ok(found) => {
                    tracing::debug!(
                        query_index = index + 1,
                        query,
                        found = found.len(),
                        "Detection query complete"
                    );
                    all.extend(found);
                }
                Err(QueryFailure::Prediction(e)) if e.is_transport() => {
                    tracing::warn!(query, error = %e, "Detection query could not reach the service");
                    transport_failures += 1;
                    last_error = Some(e);
                }
                Err(failure) => {
                    tracing::warn!(query, error = %failure, "Detection query yielded nothing");
                }
            }
        }

        if transport_failures == PRODUCT_QUERIES.len() {
            if let Some(e) = last_error {
                return Err(DetectionError::Unavailable(e));
            }
        }

        let raw = all.len();
        let unique = dedup::suppress_overlaps(all, self.iou_threshold);
        tracing::info!(raw, unique = unique.len(), "Detections merged");
        Ok(unique)
    }

    async fn run_query(&self, image: &str, query: &str) -> Result<Vec<Detection>, QueryFailure> {
        let input = serde_json::json!({
            "image": image,
            "query": query,
            "box_threshold": BOX_THRESHOLD,
            "text_threshold": TEXT_THRESHOLD,
            "show_visualisation": false,
        });

        let done = prediction::run_prediction(
            self.predictor.as_ref(),
            &self.model_version,
            input,
            self.policy,
        )
        .await
        .map_err(QueryFailure::Prediction)?;

        if !done.succeeded() {
            return Err(QueryFailure::NotSucceeded(format!("{:?}", done.status)));
        }

        let output = done.output.unwrap_or(serde_json::Value::Null);
        if output.is_null() {
            return Ok(Vec::new());
        }
        let parsed: DetectorOutput =
            serde_json::from_value(output).map_err(QueryFailure::Malformed)?;
        Ok(parsed.detections)
    }
}

#[derive(Debug, thiserror::Error)]
enum QueryFailure {
    #[error("{0}")]
    Prediction(PredictionError),

    #[error("prediction ended with status {0}")]
    NotSucceeded(String),

    #[error("malformed detector output: {0}")]
    Malformed(serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("Detection service unavailable for every query: {0}")]
    Unavailable(PredictionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::prediction::{Prediction, PredictionStatus};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers each query from a table keyed by query text.
    struct QueryTable {
        answers: Vec<(&'static str, Result<serde_json::Value, ()>)>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Predictor for QueryTable {
        async fn submit(
            &self,
            _version: &str,
            input: serde_json::Value,
        ) -> Result<Prediction, PredictionError> {
            let query = input["query"].as_str().unwrap_or_default().to_string();
            self.seen.lock().unwrap().push(query.clone());
            match self.answers.iter().find(|(q, _)| *q == query) {
                Some((_, Ok(output))) => Ok(Prediction {
                    id: query,
                    status: PredictionStatus::Succeeded,
                    output: Some(output.clone()),
                    error: None,
                }),
                Some((_, Err(()))) => Err(PredictionError::Api {
                    status: 502,
                    body: "bad gateway".into(),
                }),
                None => Ok(Prediction {
                    id: query,
                    status: PredictionStatus::Failed,
                    output: None,
                    error: None,
                }),
            }
        }

        async fn fetch(&self, id: &str) -> Result<Prediction, PredictionError> {
            Err(PredictionError::Timeout {
                id: id.to_string(),
                waited: Duration::ZERO,
            })
        }
    }

    fn client(table: QueryTable) -> DetectionClient {
        DetectionClient::new(
            Arc::new(table),
            "dino",
            PollPolicy {
                interval: Duration::from_millis(1),
                timeout: Duration::from_millis(10),
            },
            0.5,
        )
    }

    #[tokio::test]
    async fn test_merges_queries_and_removes_overlaps() {
        let table = QueryTable {
            answers: vec![
                (
                    PRODUCT_QUERIES[0],
                    Ok(serde_json::json!({"detections": [
                        {"bbox": [0, 0, 100, 100], "confidence": 0.6, "label": "jar"},
                        {"bbox": [300, 0, 400, 100], "confidence": 0.5, "label": "can"}
                    ]})),
                ),
                (
                    PRODUCT_QUERIES[4],
                    Ok(serde_json::json!({"detections": [
                        {"bbox": [2, 2, 100, 100], "confidence": 0.8, "label": "cheese"}
                    ]})),
                ),
            ],
            seen: Mutex::new(Vec::new()),
        };
        let detector = client(table);
        let found = detector.detect_products(b"img").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].label, "cheese");
        assert_eq!(found[1].label, "can");
    }

    #[tokio::test]
    async fn test_one_failing_query_does_not_abort_others() {
        let table = QueryTable {
            answers: vec![
                (PRODUCT_QUERIES[0], Err(())),
                (
                    PRODUCT_QUERIES[1],
                    Ok(serde_json::json!({"detections": [
                        {"bbox": [0, 0, 50, 50], "confidence": 0.4, "label": "lime"}
                    ]})),
                ),
                (PRODUCT_QUERIES[2], Ok(serde_json::json!({"unexpected": true, "detections": "nope"}))),
            ],
            seen: Mutex::new(Vec::new()),
        };
        let detector = client(table);
        let found = detector.detect_products(b"img").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].label, "lime");
    }

    #[tokio::test]
    async fn test_every_query_unreachable_is_an_error() {
        let table = QueryTable {
            answers: PRODUCT_QUERIES.iter().map(|q| (*q, Err(()))).collect(),
            seen: Mutex::new(Vec::new()),
        };
        let detector = client(table);
        assert!(matches!(
            detector.detect_products(b"img").await,
            Err(DetectionError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_all_queries_failed_status_is_empty_not_error() {
        let table = QueryTable {
            answers: Vec::new(),
            seen: Mutex::new(Vec::new()),
        };
        let detector = client(table);
        let found = detector.detect_products(b"img").await.unwrap();
        assert!(found.is_empty());
    }
}
