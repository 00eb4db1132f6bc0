use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::product::{CandidateProduct, ValidationResult, ValidationSource};
use crate::services::adjudicator::{MatchAdjudicator, MatchQuery};
use crate::services::open_food_facts::{OffProduct, OpenProductLookup};
use crate::services::upc_lookup::{LookupError, UpcItem, UpcLookup};

/// Open database hits checked by the adjudicator per search.
const MAX_ADJUDICATED_HITS: usize = 3;

/// Lookup sources that rate limited us while one image was being processed.
///
/// A limited source is not called again for the rest of that image.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LookupBudget {
    pub upc_limited: bool,
    pub open_db_limited: bool,
}

/// Confirms detected products against the UPC database and then the open product database.
///
/// Request spacing is left to the lookup clients.
pub struct CrossValidator {
    upc: Arc<dyn UpcLookup>,
    open_db: Arc<dyn OpenProductLookup>,
    adjudicator: Arc<dyn MatchAdjudicator>,
}

enum Step {
    Resolved(ValidationResult),
    NotFound,
    RateLimited,
}

impl CrossValidator {
    pub fn new(
        upc: Arc<dyn UpcLookup>,
        open_db: Arc<dyn OpenProductLookup>,
        adjudicator: Arc<dyn MatchAdjudicator>,
    ) -> Self {
        Self {
            upc,
            open_db,
            adjudicator,
        }
    }

    /// Validate one candidate.
    ///
    /// Never fails. Anything short of a confirmed match, including a rate-limited source,
    /// yields an unresolved result carrying the detected identity.
    pub async fn validate(&self, candidate: &CandidateProduct, budget: &mut LookupBudget) -> ValidationResult {
        // ── UPC / price database ─────────────────────────────────────────
        if !budget.upc_limited {
            match self.check_upc(candidate).await {
                Step::Resolved(result) => return result,
                Step::RateLimited => {
                    warn!(brand = %candidate.brand, "UPC database rate limited, skipping it for this image");
                    budget.upc_limited = true;
                    return ValidationResult::unresolved(candidate);
                }
                Step::NotFound => {}
            }
        }

        // ── Open product database with adjudication ──────────────────────
        if !budget.open_db_limited {
            match self.check_open_db(candidate).await {
                Step::Resolved(result) => return result,
                Step::RateLimited => {
                    warn!(brand = %candidate.brand, "Open product database rate limited, skipping it for this image");
                    budget.open_db_limited = true;
                }
                Step::NotFound => {}
            }
        }

        info!(name = %candidate.full_name, "Product unconfirmed, drafting for review");
        ValidationResult::unresolved(candidate)
    }

    async fn check_upc(&self, candidate: &CandidateProduct) -> Step {
        let query = search_query(candidate);
        let items = match self.upc.search(&query).await {
            Ok(items) => items,
            Err(LookupError::RateLimited) => return Step::RateLimited,
            Err(e) => {
                warn!(error = %e, query = %query, "UPC lookup failed");
                return Step::NotFound;
            }
        };

        let Some(item) = UpcItem::best_match(&items, &candidate.brand) else {
            debug!(query = %query, "No UPC database items");
            return Step::NotFound;
        };

        match (item.code(), item.price()) {
            (Some(code), Some(price)) if price > 0.0 => {
                info!(upc = code, price, title = %item.title, "Verified against UPC database");
                Step::Resolved(from_upc_item(candidate, item, code, price))
            }
            _ => {
                debug!(title = %item.title, "UPC database item lacks a code or price");
                Step::NotFound
            }
        }
    }

    async fn check_open_db(&self, candidate: &CandidateProduct) -> Step {
        let full_query = search_query(candidate);
        let mut hits = match self.open_db.search(&full_query).await {
            Ok(hits) => hits,
            Err(LookupError::RateLimited) => return Step::RateLimited,
            Err(e) => {
                warn!(error = %e, query = %full_query, "Open product lookup failed");
                Vec::new()
            }
        };

        if hits.is_empty() && candidate.brand != full_query {
            hits = match self.open_db.search(&candidate.brand).await {
                Ok(hits) => hits,
                Err(LookupError::RateLimited) => return Step::RateLimited,
                Err(e) => {
                    warn!(error = %e, brand = %candidate.brand, "Open product brand lookup failed");
                    Vec::new()
                }
            };
        }

        for hit in hits.iter().take(MAX_ADJUDICATED_HITS) {
            let verdict = self
                .adjudicator
                .adjudicate(MatchQuery {
                    detected_brand: &candidate.brand,
                    detected_name: &candidate.product_name,
                    found_brand: &hit.brands,
                    found_name: hit.name(),
                })
                .await;

            if verdict.is_match {
                info!(code = %hit.code, reason = %verdict.reason, "Verified against open product database");
                return Step::Resolved(from_open_hit(candidate, hit));
            }
            debug!(code = %hit.code, reason = %verdict.reason, "Open product hit rejected");
        }

        Step::NotFound
    }
}

fn search_query(candidate: &CandidateProduct) -> String {
    format!("{} {}", candidate.brand, candidate.product_name)
        .trim()
        .to_string()
}

fn or_detected(found: &str, detected: &str) -> String {
    let found = found.trim();
    if found.is_empty() {
        detected.to_string()
    } else {
        found.to_string()
    }
}

fn from_upc_item(candidate: &CandidateProduct, item: &UpcItem, code: &str, price: f64) -> ValidationResult {
    let categories = if item.category.trim().is_empty() {
        vec![candidate.category.to_string()]
    } else {
        vec![item.category.trim().to_string()]
    };

    ValidationResult {
        found: true,
        canonical_name: or_detected(&item.title, &candidate.full_name),
        canonical_brand: or_detected(&item.brand, &candidate.brand),
        categories,
        upc: Some(code.to_string()),
        description: Some(item.description.trim().to_string()).filter(|d| !d.is_empty()),
        price: Some(price),
        source: ValidationSource::UpcDb,
    }
}

fn from_open_hit(candidate: &CandidateProduct, hit: &OffProduct) -> ValidationResult {
    let mut categories = hit.category_list();
    if categories.is_empty() {
        categories.push(candidate.category.to_string());
    }

    ValidationResult {
        found: true,
        canonical_name: or_detected(hit.name(), &candidate.full_name),
        canonical_brand: or_detected(&hit.brands, &candidate.brand),
        categories,
        upc: Some(hit.code.trim().to_string()).filter(|c| !c.is_empty()),
        description: None,
        price: None,
        source: ValidationSource::OpenDb,
    }
}
