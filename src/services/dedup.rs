//! Non-maximum suppression over detections merged from several prompts.

use std::cmp::Ordering;

use crate::models::detection::{BoundingBox, Detection};

/// Default IoU above which two boxes are considered the same object.
pub const DEFAULT_IOU_THRESHOLD: f64 = 0.5;

/// Intersection-over-Union of two axis-aligned boxes.
///
/// A non-positive union (degenerate boxes) yields 0.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f64 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Keep the highest-confidence box of every overlapping cluster.
///
/// Detections are stably sorted by descending confidence (NaN last), then a detection is
/// kept unless it overlaps an already-kept one by more than `threshold`.
pub fn suppress_overlaps(mut detections: Vec<Detection>, threshold: f64) -> Vec<Detection> {
    detections.sort_by(|a, b| compare_confidence_desc(a.confidence, b.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for detection in detections {
        let duplicate = kept
            .iter()
            .any(|k| iou(&detection.bbox, &k.bbox) > threshold);
        if !duplicate {
            kept.push(detection);
        }
    }
    kept
}

fn compare_confidence_desc(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}
