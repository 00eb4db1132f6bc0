use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::services::upc_lookup::LookupError;

const DEFAULT_BASE_URL: &str = "https://world.openfoodfacts.org";
const USER_AGENT: &str = "shelf-import/0.1 (catalog drafting)";
const PAGE_SIZE: u32 = 5;

/// Product record from the open food database.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct OffProduct {
    #[serde(default)]
    pub brands: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub product_name_en: String,
    /// Comma-separated category path, most general first.
    #[serde(default)]
    pub categories: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl OffProduct {
    /// Localized name, falling back to the English one.
    pub fn name(&self) -> &str {
        if self.product_name.trim().is_empty() {
            self.product_name_en.trim()
        } else {
            self.product_name.trim()
        }
    }

    pub fn category_list(&self) -> Vec<String> {
        self.categories
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    products: Vec<OffProduct>,
}

/// Full-text search over an open product database.
#[async_trait]
pub trait OpenProductLookup: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<OffProduct>, LookupError>;
}

/// Spaces consecutive requests at least `min_interval` apart.
struct RateLimiter {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval,
        }
    }

    async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.min_interval {
                let pause = self.min_interval - elapsed;
                tracing::debug!(?pause, "Spacing open product db requests");
                tokio::time::sleep(pause).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Open Food Facts search client.
pub struct OpenFoodFactsClient {
    http: Client,
    base_url: String,
    limiter: RateLimiter,
}

impl OpenFoodFactsClient {
    pub fn new(min_interval: Duration) -> Result<Self, LookupError> {
        Self::with_base_url(DEFAULT_BASE_URL, min_interval)
    }

    pub fn with_base_url(base_url: &str, min_interval: Duration) -> Result<Self, LookupError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::new(min_interval),
        })
    }
}

#[async_trait]
impl OpenProductLookup for OpenFoodFactsClient {
    async fn search(&self, query: &str) -> Result<Vec<OffProduct>, LookupError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        self.limiter.wait().await;

        let url = format!("{}/cgi/search.pl", self.base_url);
        let page_size = PAGE_SIZE.to_string();
        let response = self
            .http
            .get(&url)
            .query(&[
                ("search_terms", query),
                ("json", "1"),
                ("page_size", page_size.as_str()),
            ])
            .send()
            .await?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => Err(LookupError::RateLimited),
            status if status.is_success() => {
                let body: SearchResponse = response.json().await?;
                Ok(body.products)
            }
            status => Err(LookupError::Status(status.as_u16())),
        }
    }
}
