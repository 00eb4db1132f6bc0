use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

use crate::models::detection::BoundingBox;

const JPEG_QUALITY: u8 = 95;

/// Decoded source image plus the format it arrived in.
pub struct SourcePicture {
    pub image: DynamicImage,
    pub format: ImageFormat,
}

impl SourcePicture {
    pub fn decode(bytes: &[u8]) -> Result<Self, CropError> {
        let format = image::guess_format(bytes).map_err(CropError::Decode)?;
        if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP) {
            return Err(CropError::UnsupportedFormat(format));
        }
        let image = image::load_from_memory_with_format(bytes, format).map_err(CropError::Decode)?;
        Ok(Self { image, format })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Pixel rectangle after padding and clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Encoded crop ready for storage.
#[derive(Debug, Clone)]
pub struct CroppedImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub region: CropRegion,
}

impl CroppedImage {
    pub fn extension(&self) -> &'static str {
        extension_for(self.format)
    }

    pub fn content_type(&self) -> &'static str {
        content_type_for(self.format)
    }
}

/// Pad `bbox`, clamp it to the image, and reject regions smaller than `min_size` on either side.
pub fn crop_region(
    bbox: &BoundingBox,
    image_width: u32,
    image_height: u32,
    padding: u32,
    min_size: u32,
) -> Option<CropRegion> {
    let pad = i64::from(padding);
    // Coordinates are truncated toward zero before padding.
    let x1 = (bbox.x1 as i64 - pad).max(0);
    let y1 = (bbox.y1 as i64 - pad).max(0);
    let x2 = (bbox.x2 as i64 + pad).min(i64::from(image_width));
    let y2 = (bbox.y2 as i64 + pad).min(i64::from(image_height));

    let width = x2 - x1;
    let height = y2 - y1;
    if width < i64::from(min_size) || height < i64::from(min_size) {
        return None;
    }

    Some(CropRegion {
        x: x1 as u32,
        y: y1 as u32,
        width: width as u32,
        height: height as u32,
    })
}

/// Cut one detection out of the source picture as a new encoded image.
///
/// Returns `Ok(None)` when the padded box is too small to identify.
pub fn crop_detection(
    source: &SourcePicture,
    bbox: &BoundingBox,
    padding: u32,
    min_size: u32,
) -> Result<Option<CroppedImage>, CropError> {
    let Some(region) = crop_region(bbox, source.width(), source.height(), padding, min_size) else {
        return Ok(None);
    };

    let cropped = source
        .image
        .crop_imm(region.x, region.y, region.width, region.height);

    let keeps_alpha = matches!(source.format, ImageFormat::Png | ImageFormat::WebP)
        && cropped.color().has_alpha();

    let (bytes, format) = if keeps_alpha {
        let mut buf = Vec::new();
        cropped
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(CropError::Encode)?;
        (buf, ImageFormat::Png)
    } else {
        let mut buf = Vec::new();
        let rgb = DynamicImage::ImageRgb8(cropped.to_rgb8());
        rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY))
            .map_err(CropError::Encode)?;
        (buf, ImageFormat::Jpeg)
    };

    Ok(Some(CroppedImage {
        bytes,
        format,
        region,
    }))
}

pub fn extension_for(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::WebP => "webp",
        _ => "jpg",
    }
}

pub fn content_type_for(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "image/png",
        ImageFormat::WebP => "image/webp",
        _ => "image/jpeg",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CropError {
    #[error("Failed to decode source image: {0}")]
    Decode(image::ImageError),

    #[error("Unsupported source image format: {0:?}")]
    UnsupportedFormat(ImageFormat),

    #[error("Failed to encode crop: {0}")]
    Encode(image::ImageError),
}
