use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Store taxonomy the identification model must choose from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, AsRefStr, PartialEq, Eq)]
pub enum Category {
    #[serde(rename = "Snacks & Chips")]
    #[strum(serialize = "Snacks & Chips")]
    SnacksChips,
    #[serde(rename = "Beverages")]
    #[strum(serialize = "Beverages")]
    Beverages,
    #[serde(rename = "Dairy & Eggs")]
    #[strum(serialize = "Dairy & Eggs")]
    DairyEggs,
    #[serde(rename = "Meat & Seafood")]
    #[strum(serialize = "Meat & Seafood")]
    MeatSeafood,
    #[serde(rename = "Bakery & Bread")]
    #[strum(serialize = "Bakery & Bread")]
    BakeryBread,
    #[serde(rename = "Pantry & Canned Goods")]
    #[strum(serialize = "Pantry & Canned Goods")]
    PantryCanned,
    #[serde(rename = "Condiments & Sauces")]
    #[strum(serialize = "Condiments & Sauces")]
    CondimentsSauces,
    #[serde(rename = "Frozen Foods")]
    #[strum(serialize = "Frozen Foods")]
    FrozenFoods,
    #[serde(rename = "Fresh Produce")]
    #[strum(serialize = "Fresh Produce")]
    FreshProduce,
    #[serde(rename = "Breakfast & Cereal")]
    #[strum(serialize = "Breakfast & Cereal")]
    BreakfastCereal,
    #[serde(rename = "International Foods")]
    #[strum(serialize = "International Foods")]
    InternationalFoods,
    #[serde(rename = "Candy & Sweets")]
    #[strum(serialize = "Candy & Sweets")]
    CandySweets,
    #[serde(rename = "Health & Personal Care")]
    #[strum(serialize = "Health & Personal Care")]
    HealthPersonalCare,
    /// Anything the model invents outside the taxonomy.
    #[serde(other)]
    #[strum(serialize = "Uncategorized")]
    Other,
}

impl Category {
    pub const ALL: [Category; 13] = [
        Category::SnacksChips,
        Category::Beverages,
        Category::DairyEggs,
        Category::MeatSeafood,
        Category::BakeryBread,
        Category::PantryCanned,
        Category::CondimentsSauces,
        Category::FrozenFoods,
        Category::FreshProduce,
        Category::BreakfastCereal,
        Category::InternationalFoods,
        Category::CandySweets,
        Category::HealthPersonalCare,
    ];
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProductType {
    Packaged,
    Produce,
    Meat,
    Bakery,
    Dairy,
    #[serde(other)]
    Other,
}

/// What the identification model read off one cropped product.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CandidateProduct {
    #[serde(default)]
    #[garde(length(min = 1, max = 200))]
    pub brand: String,

    #[serde(default)]
    #[garde(length(min = 1, max = 200))]
    pub product_name: String,

    #[serde(default)]
    #[garde(skip)]
    pub full_name: String,

    #[serde(default)]
    #[garde(skip)]
    pub size: String,

    #[serde(default = "default_category")]
    #[garde(skip)]
    pub category: Category,

    #[serde(default, rename = "estimated_price_usd", alias = "estimated_price")]
    #[garde(skip)]
    pub estimated_price: Option<f64>,

    #[serde(default = "default_product_type")]
    #[garde(skip)]
    pub product_type: ProductType,

    #[garde(skip)]
    pub is_product: bool,
}

fn default_category() -> Category {
    Category::Other
}

fn default_product_type() -> ProductType {
    ProductType::Other
}

impl CandidateProduct {
    /// Placeholder for an unreadable crop.
    pub fn not_a_product() -> Self {
        Self {
            brand: String::new(),
            product_name: String::new(),
            full_name: String::new(),
            size: String::new(),
            category: Category::Other,
            estimated_price: None,
            product_type: ProductType::Other,
            is_product: false,
        }
    }

    /// Trim free-text fields in place and fill `full_name` when the model left it empty.
    pub fn normalize(&mut self) {
        self.brand = self.brand.trim().to_string();
        self.product_name = self.product_name.trim().to_string();
        self.full_name = self.full_name.trim().to_string();
        self.size = self.size.trim().to_string();
        if self.full_name.is_empty() && !self.brand.is_empty() {
            self.full_name = format!("{} {}", self.brand, self.product_name).trim().to_string();
        }
    }

    /// A candidate may proceed to validation only if it is a product with a readable identity.
    pub fn is_usable(&self) -> bool {
        self.is_product && self.validate().is_ok()
    }
}

/// Which external source confirmed a product.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, AsRefStr, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValidationSource {
    UpcDb,
    OpenDb,
    None,
}

/// Outcome of cross-validating a candidate against the lookup services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub found: bool,
    pub canonical_name: String,
    pub canonical_brand: String,
    pub categories: Vec<String>,
    pub upc: Option<String>,
    pub description: Option<String>,
    /// Only the UPC database carries prices.
    pub price: Option<f64>,
    pub source: ValidationSource,
}

impl ValidationResult {
    /// Fallback used when no source confirmed the product.
    pub fn unresolved(candidate: &CandidateProduct) -> Self {
        Self {
            found: false,
            canonical_name: candidate.full_name.clone(),
            canonical_brand: candidate.brand.clone(),
            categories: vec![candidate.category.to_string()],
            upc: None,
            description: None,
            price: None,
            source: ValidationSource::None,
        }
    }

    pub fn status(&self) -> ProductStatus {
        if self.found {
            ProductStatus::Verified
        } else {
            ProductStatus::NeedsReview
        }
    }
}

/// Review status recorded on every draft product.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, AsRefStr, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProductStatus {
    Verified,
    NeedsReview,
}

/// Insert payload for the catalog store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewCatalogProduct {
    pub sku: String,
    pub name: String,
    pub brand: String,
    pub price: Option<f64>,
    pub status: ProductStatus,
    pub upc: Option<String>,
    pub categories: Vec<String>,
    pub size: String,
    pub description: Option<String>,
    pub image_key: String,
    pub source_hash: String,
    pub source_image: String,
    pub detection_index: i32,
}

/// Draft product row as stored in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    pub brand: String,
    pub price: Option<f64>,
    pub status: ProductStatus,
    pub upc: Option<String>,
    pub categories: Vec<String>,
    pub size: String,
    pub description: Option<String>,
    pub image_key: String,
    pub source_hash: String,
    pub source_image: String,
    pub detection_index: i32,
    pub created_at: DateTime<Utc>,
}

impl CatalogProduct {
    pub fn from_new(id: Uuid, product: NewCatalogProduct, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            sku: product.sku,
            name: product.name,
            brand: product.brand,
            price: product.price,
            status: product.status,
            upc: product.upc,
            categories: product.categories,
            size: product.size,
            description: product.description,
            image_key: product.image_key,
            source_hash: product.source_hash,
            source_image: product.source_image,
            detection_index: product.detection_index,
            created_at,
        }
    }
}
