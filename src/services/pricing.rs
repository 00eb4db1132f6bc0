//! Price selection for draft products.

use crate::models::product::ValidationResult;

/// Price implied by a UPC database record.
///
/// Positive offers are averaged and rounded to cents. Without offers the midpoint of the
/// lowest and highest recorded prices is used when both are positive, otherwise whichever
/// one is.
pub fn offer_price(offers: &[f64], lowest: Option<f64>, highest: Option<f64>) -> Option<f64> {
    let positive: Vec<f64> = offers.iter().copied().filter(|p| *p > 0.0).collect();
    if !positive.is_empty() {
        let mean = positive.iter().sum::<f64>() / positive.len() as f64;
        return Some(round_cents(mean));
    }

    let low = lowest.filter(|p| *p > 0.0);
    let high = highest.filter(|p| *p > 0.0);
    match (low, high) {
        (Some(low), Some(high)) => Some(round_cents((low + high) / 2.0)),
        (Some(price), None) | (None, Some(price)) => Some(price),
        (None, None) => None,
    }
}

/// Final price for a draft: a confirmed database price wins over the model's estimate.
pub fn resolve_price(validation: &ValidationResult, estimate: Option<f64>) -> Option<f64> {
    validation
        .price
        .filter(|p| *p > 0.0)
        .or_else(|| estimate.filter(|p| *p > 0.0))
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
