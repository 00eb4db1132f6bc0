use sha2::{Digest, Sha256};

const MAX_SKU_LEN: usize = 50;
const FALLBACK_SKU: &str = "item";

/// Stock keeping unit derived from brand and product name.
///
/// Lower-cased, every run of characters outside `[a-z0-9]` collapsed to one hyphen,
/// hyphens trimmed, then cut to 50 characters.
pub fn derive_sku(brand: &str, name: &str) -> String {
    let source = format!("{}-{}", brand, name).to_lowercase();

    let mut sku = String::with_capacity(source.len());
    let mut pending_hyphen = false;
    for c in source.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !sku.is_empty() {
                sku.push('-');
            }
            pending_hyphen = false;
            sku.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    // Only ASCII remains, so byte truncation is safe.
    sku.truncate(MAX_SKU_LEN);
    let sku = sku.trim_end_matches('-');

    if sku.is_empty() {
        FALLBACK_SKU.to_string()
    } else {
        sku.to_string()
    }
}

/// Deterministic suffix that separates two products with the same derived SKU.
pub fn discriminator(source_hash: &str, detection_index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", source_hash, detection_index).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..6].to_string()
}

pub fn with_discriminator(sku: &str, source_hash: &str, detection_index: usize) -> String {
    format!("{}-{}", sku, discriminator(source_hash, detection_index))
}

/// SHA-256 of raw bytes as lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Key of the interim crop written before identification finishes.
pub fn interim_crop_key(source_hash: &str, detection_index: usize, temp_sku: &str, ext: &str) -> String {
    let short = &source_hash[..source_hash.len().min(12)];
    format!("crops/{}/{}-{}.{}", short, detection_index, temp_sku, ext)
}

pub fn product_image_key(sku: &str, ext: &str) -> String {
    format!("products/{}.{}", sku, ext)
}

pub fn source_image_key(content_hash: &str, ext: &str) -> String {
    format!("source/{}.{}", content_hash, ext)
}
