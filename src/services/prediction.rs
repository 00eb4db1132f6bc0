//! Submit-and-poll access to the hosted inference service.
//!
//! Every model call in the pipeline (detection, identification, adjudication, enhancement)
//! is a prediction: submit once, then wait for a terminal status. Waiting is expressed by
//! [`await_terminal`], so callers never see the transport and a push-based backend can be
//! swapped in behind [`Predictor`] without touching them.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl PredictionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PredictionStatus::Succeeded | PredictionStatus::Failed | PredictionStatus::Canceled
        )
    }
}

/// Prediction record as returned by the service. `output` is model specific and is
/// decoded into a typed record by each client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl Prediction {
    pub fn succeeded(&self) -> bool {
        self.status == PredictionStatus::Succeeded
    }
}

/// Poll cadence and deadline for one prediction.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Transport to a prediction service.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Create a prediction for `version` with model-specific `input`.
    async fn submit(
        &self,
        version: &str,
        input: serde_json::Value,
    ) -> Result<Prediction, PredictionError>;

    /// Fetch the current state of a prediction.
    async fn fetch(&self, id: &str) -> Result<Prediction, PredictionError>;
}

/// Suspend until `prediction` reaches a terminal status or the policy deadline passes.
pub async fn await_terminal(
    predictor: &dyn Predictor,
    mut prediction: Prediction,
    policy: PollPolicy,
) -> Result<Prediction, PredictionError> {
    let deadline = Instant::now() + policy.timeout;

    while !prediction.status.is_terminal() {
        if Instant::now() >= deadline {
            return Err(PredictionError::Timeout {
                id: prediction.id,
                waited: policy.timeout,
            });
        }
        tokio::time::sleep(policy.interval).await;
        prediction = predictor.fetch(&prediction.id).await?;
    }

    Ok(prediction)
}

/// Submit a prediction and wait for it to finish.
pub async fn run_prediction(
    predictor: &dyn Predictor,
    version: &str,
    input: serde_json::Value,
    policy: PollPolicy,
) -> Result<Prediction, PredictionError> {
    let prediction = predictor.submit(version, input).await?;
    tracing::debug!(prediction_id = %prediction.id, version, "Prediction submitted");
    await_terminal(predictor, prediction, policy).await
}

/// Language model output: one string, or a stream of parts that are strings or `{text}` objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TextOutput {
    Whole(String),
    Parts(Vec<TextPart>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TextPart {
    Plain(String),
    Tagged { text: String },
    Other(serde_json::Value),
}

/// Concatenate a language model's output into one string, or `None` when it is not text.
pub fn output_text(output: serde_json::Value) -> Option<String> {
    match serde_json::from_value::<TextOutput>(output).ok()? {
        TextOutput::Whole(text) => Some(text),
        TextOutput::Parts(parts) => Some(
            parts
                .into_iter()
                .filter_map(|part| match part {
                    TextPart::Plain(text) | TextPart::Tagged { text } => Some(text),
                    TextPart::Other(_) => None,
                })
                .collect(),
        ),
    }
}

/// Decode the outermost `{...}` object in model text, ignoring markdown fences and chatter.
pub fn extract_json<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    let cleaned = text.replace("```json", "").replace("```", "");
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&cleaned[start..=end]).ok()
}

/// Encode raw image bytes as a data URI accepted by the prediction service.
pub fn image_data_uri(bytes: &[u8]) -> String {
    let mime = match image::guess_format(bytes) {
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::WebP) => "image/webp",
        _ => "image/jpeg",
    };
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Client for a Replicate-compatible predictions API.
pub struct ReplicateClient {
    http: Client,
    base_url: String,
    api_token: String,
}

#[derive(Serialize)]
struct CreatePrediction<'a> {
    version: &'a str,
    input: serde_json::Value,
}

impl ReplicateClient {
    pub fn new(base_url: &str, api_token: &str) -> Result<Self, PredictionError> {
        if api_token.trim().is_empty() {
            return Err(PredictionError::MissingCredentials);
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(PredictionError::Http)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
        })
    }

    async fn decode(response: reqwest::Response) -> Result<Prediction, PredictionError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PredictionError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PredictionError::Api {
                status: status.as_u16(),
                body,
            });
        }
        response.json::<Prediction>().await.map_err(PredictionError::Http)
    }
}

#[async_trait]
impl Predictor for ReplicateClient {
    async fn submit(
        &self,
        version: &str,
        input: serde_json::Value,
    ) -> Result<Prediction, PredictionError> {
        let url = format!("{}/predictions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&CreatePrediction { version, input })
            .send()
            .await
            .map_err(PredictionError::Http)?;

        Self::decode(response).await
    }

    async fn fetch(&self, id: &str) -> Result<Prediction, PredictionError> {
        let url = format!("{}/predictions/{}", self.base_url, id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(PredictionError::Http)?;

        Self::decode(response).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Prediction API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Prediction API rate limited the request")]
    RateLimited,

    #[error("Prediction {id} did not finish within {waited:?}")]
    Timeout { id: String, waited: Duration },

    #[error("Prediction API token is not configured")]
    MissingCredentials,
}

impl PredictionError {
    /// Failures of the transport itself, as opposed to one slow or failed prediction.
    pub fn is_transport(&self) -> bool {
        !matches!(self, PredictionError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedPoller {
        states: Mutex<VecDeque<PredictionStatus>>,
        fetches: Mutex<u32>,
    }

    #[async_trait]
    impl Predictor for ScriptedPoller {
        async fn submit(
            &self,
            _version: &str,
            _input: serde_json::Value,
        ) -> Result<Prediction, PredictionError> {
            Ok(prediction(PredictionStatus::Starting))
        }

        async fn fetch(&self, _id: &str) -> Result<Prediction, PredictionError> {
            *self.fetches.lock().unwrap() += 1;
            let status = self
                .states
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(PredictionStatus::Processing);
            Ok(prediction(status))
        }
    }

    fn prediction(status: PredictionStatus) -> Prediction {
        Prediction {
            id: "p1".into(),
            status,
            output: None,
            error: None,
        }
    }

    fn fast_policy(timeout_ms: u64) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn test_polls_until_terminal() {
        let poller = ScriptedPoller {
            states: Mutex::new(VecDeque::from(vec![
                PredictionStatus::Processing,
                PredictionStatus::Succeeded,
            ])),
            fetches: Mutex::new(0),
        };
        let done = run_prediction(&poller, "v", serde_json::json!({}), fast_policy(5_000))
            .await
            .unwrap();
        assert!(done.succeeded());
        assert_eq!(*poller.fetches.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_times_out_when_never_terminal() {
        let poller = ScriptedPoller {
            states: Mutex::new(VecDeque::new()),
            fetches: Mutex::new(0),
        };
        let err = run_prediction(&poller, "v", serde_json::json!({}), fast_policy(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PredictionError::Timeout { .. }));
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn test_terminal_submission_skips_polling() {
        let poller = ScriptedPoller {
            states: Mutex::new(VecDeque::new()),
            fetches: Mutex::new(0),
        };
        let done = await_terminal(&poller, prediction(PredictionStatus::Failed), fast_policy(10))
            .await
            .unwrap();
        assert_eq!(done.status, PredictionStatus::Failed);
        assert_eq!(*poller.fetches.lock().unwrap(), 0);
    }

    #[test]
    fn test_unknown_status_is_not_terminal() {
        let p: Prediction = serde_json::from_str(r#"{"id": "x", "status": "queued"}"#).unwrap();
        assert_eq!(p.status, PredictionStatus::Unknown);
        assert!(!p.status.is_terminal());
    }

    #[test]
    fn test_missing_token_is_rejected() {
        assert!(matches!(
            ReplicateClient::new("https://api.replicate.com/v1", ""),
            Err(PredictionError::MissingCredentials)
        ));
    }

    #[test]
    fn test_output_text_joins_mixed_parts() {
        let output = serde_json::json!(["{\"a\": ", {"text": "1}"}, {"finish": true}]);
        assert_eq!(output_text(output).as_deref(), Some("{\"a\": 1}"));
        assert_eq!(output_text(serde_json::json!(42)), None);
    }

    #[test]
    fn test_extract_json_skips_fences() {
        let value: serde_json::Value =
            extract_json("Sure!\n```json\n{\"is_match\": true}\n```").unwrap();
        assert_eq!(value["is_match"], true);
        assert!(extract_json::<serde_json::Value>("nothing here").is_none());
    }

    #[test]
    fn test_data_uri_uses_detected_mime() {
        let png_magic = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        assert!(image_data_uri(&png_magic).starts_with("data:image/png;base64,"));
        assert!(image_data_uri(b"not an image").starts_with("data:image/jpeg;base64,"));
    }
}
