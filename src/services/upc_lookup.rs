use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::services::pricing;

const TRIAL_SEARCH_URL: &str = "https://api.upcitemdb.com/prod/trial/search";
const PAID_SEARCH_URL: &str = "https://api.upcitemdb.com/prod/v1/search";

/// One item from a UPC database search.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct UpcItem {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub upc: Option<String>,
    #[serde(default)]
    pub ean: Option<String>,
    #[serde(default)]
    pub offers: Vec<Offer>,
    #[serde(default)]
    pub lowest_recorded_price: Option<f64>,
    #[serde(default)]
    pub highest_recorded_price: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Offer {
    #[serde(default)]
    pub price: Option<f64>,
}

impl UpcItem {
    /// Barcode of the item, preferring the EAN when both are present.
    pub fn code(&self) -> Option<&str> {
        [self.ean.as_deref(), self.upc.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|c| !c.is_empty())
    }

    pub fn price(&self) -> Option<f64> {
        let offers: Vec<f64> = self.offers.iter().filter_map(|o| o.price).collect();
        pricing::offer_price(&offers, self.lowest_recorded_price, self.highest_recorded_price)
    }

    /// First item whose brand contains `brand` (case-insensitive), else the first item.
    pub fn best_match<'a>(items: &'a [UpcItem], brand: &str) -> Option<&'a UpcItem> {
        let wanted = brand.trim().to_lowercase();
        items
            .iter()
            .find(|item| !wanted.is_empty() && item.brand.to_lowercase().contains(&wanted))
            .or_else(|| items.first())
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<UpcItem>,
}

/// Keyword search against a barcode and price database.
#[async_trait]
pub trait UpcLookup: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<UpcItem>, LookupError>;
}

/// UPCitemdb search client. Without a key the rate-limited trial endpoint is used.
pub struct UpcItemDbClient {
    http: Client,
    api_key: Option<String>,
}

impl UpcItemDbClient {
    pub fn new(api_key: Option<String>) -> Result<Self, LookupError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }
}

#[async_trait]
impl UpcLookup for UpcItemDbClient {
    async fn search(&self, query: &str) -> Result<Vec<UpcItem>, LookupError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let url = if self.api_key.is_some() {
            PAID_SEARCH_URL
        } else {
            TRIAL_SEARCH_URL
        };

        let mut request = self
            .http
            .get(url)
            .query(&[("s", query)])
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("user_key", key).header("key_type", "3scale");
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => Err(LookupError::RateLimited),
            status if status.is_success() => {
                let body: SearchResponse = response.json().await?;
                Ok(body.items)
            }
            status => Err(LookupError::Status(status.as_u16())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("Lookup request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Lookup service returned HTTP {0}")]
    Status(u16),

    #[error("Lookup service rate limited the request")]
    RateLimited,
}
