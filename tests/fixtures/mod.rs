//! Generated shelf photos and the canned model answers that go with them

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// Solid product colors painted onto generated shelves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shade {
    Red,
    Blue,
    Green,
}

impl Shade {
    pub const ALL: [Shade; 3] = [Shade::Red, Shade::Blue, Shade::Green];

    pub fn rgb(self) -> [u8; 3] {
        match self {
            Shade::Red => [210, 30, 30],
            Shade::Blue => [30, 40, 200],
            Shade::Green => [40, 170, 50],
        }
    }

    /// Closest shade to a sampled pixel.
    pub fn nearest(pixel: [u8; 3]) -> Shade {
        let distance = |shade: Shade| {
            shade
                .rgb()
                .iter()
                .zip(pixel.iter())
                .map(|(a, b)| (*a as i32 - *b as i32).pow(2))
                .sum::<i32>()
        };
        Shade::ALL
            .into_iter()
            .min_by_key(|s| distance(*s))
            .unwrap_or(Shade::Green)
    }
}

/// One product on a generated shelf: pixel box, color, detector confidence and label.
#[derive(Debug, Clone, Copy)]
pub struct ShelfItem {
    pub bbox: [f64; 4],
    pub shade: Shade,
    pub confidence: f64,
    pub label: &'static str,
}

pub const LEFT_SLOT: [f64; 4] = [20.0, 20.0, 120.0, 180.0];
pub const RIGHT_SLOT: [f64; 4] = [200.0, 20.0, 300.0, 180.0];

pub fn item(bbox: [f64; 4], shade: Shade, confidence: f64, label: &'static str) -> ShelfItem {
    ShelfItem {
        bbox,
        shade,
        confidence,
        label,
    }
}

/// Paint a 400x240 shelf with the given items and encode it as PNG.
///
/// `background` changes the bytes without changing what is on the shelf.
pub fn shelf_photo(items: &[ShelfItem], background: u8) -> Vec<u8> {
    let mut canvas = RgbImage::from_pixel(400, 240, Rgb([background, background, background]));
    for item in items {
        let [x1, y1, x2, y2] = item.bbox;
        for y in y1 as u32..y2 as u32 {
            for x in x1 as u32..x2 as u32 {
                canvas.put_pixel(x, y, Rgb(item.shade.rgb()));
            }
        }
    }
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("encode shelf photo");
    buf
}

/// Detector output for the items, as the grounding model returns it.
pub fn detector_output(items: &[ShelfItem]) -> serde_json::Value {
    let detections: Vec<_> = items
        .iter()
        .map(|i| {
            serde_json::json!({
                "bbox": i.bbox,
                "confidence": i.confidence,
                "label": i.label,
            })
        })
        .collect();
    serde_json::json!({ "detections": detections })
}

pub const GOYA_UPC: &str = "0012345678905";
pub const GOYA_PRICE: f64 = 2.49;
pub const JALAPENO_ESTIMATE: f64 = 2.79;

/// What the identification model says about a crop of each shade.
pub fn identification_answer(shade: Shade) -> String {
    let record = match shade {
        Shade::Red => serde_json::json!({
            "brand": "Goya",
            "product_name": "Black Beans",
            "full_name": "Goya Black Beans",
            "is_product": true,
            "product_type": "packaged",
            "category": "Pantry & Canned Goods",
            "size": "15.5 oz",
            "estimated_price_usd": 1.99
        }),
        Shade::Blue => serde_json::json!({
            "brand": "La Costeña",
            "product_name": "Pickled Jalapeños",
            "full_name": "La Costeña Pickled Jalapeños",
            "is_product": true,
            "product_type": "packaged",
            "category": "International Foods",
            "size": "12 oz",
            "estimated_price_usd": JALAPENO_ESTIMATE
        }),
        Shade::Green => serde_json::json!({
            "brand": "",
            "product_name": "",
            "full_name": "",
            "is_product": false,
            "product_type": "other",
            "category": "Fresh Produce",
            "size": "",
            "estimated_price_usd": null
        }),
    };
    format!("```json\n{}\n```", record)
}
