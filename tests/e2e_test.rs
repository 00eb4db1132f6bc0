//! End-to-end tests against a deployed stack
//!
//! These tests require:
//! 1. PostgreSQL and Redis running
//! 2. API server and worker running
//! 3. Prediction service and R2 credentials configured
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override default (http://localhost:3000)

mod fixtures;
mod helpers;

use fixtures::*;
use helpers::*;

/// Get base URL from env or default to localhost
fn get_base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

#[tokio::test]
#[ignore] // Requires running API server and infrastructure
async fn test_e2e_health_check() {
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", get_base_url()))
        .send()
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );

    let body: serde_json::Value = response.json().await.expect("Health body");
    assert_eq!(body["checks"]["database"]["status"], "ok");
    assert_eq!(body["checks"]["redis"]["status"], "ok");
}

#[tokio::test]
#[ignore] // Requires running API server
async fn test_e2e_rejects_bad_uploads() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let not_an_image = post_photos(&client, &base_url, &[("notes.txt", b"hello".to_vec(), "text/plain")])
        .await
        .expect("Request failed");
    assert_eq!(not_an_image.status(), reqwest::StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let photo = shelf_photo(&[], 250);
    let eleven: Vec<_> = (0..11)
        .map(|_| ("shelf.png", photo.clone(), "image/png"))
        .collect();
    let too_many = post_photos(&client, &base_url, &eleven)
        .await
        .expect("Request failed");
    assert_eq!(too_many.status(), reqwest::StatusCode::BAD_REQUEST);

    let unknown = client
        .get(format!("{}/api/v1/imports/{}", base_url, uuid::Uuid::new_v4()))
        .send()
        .await
        .expect("Request failed");
    assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
#[ignore] // Requires running API server, worker, and all infrastructure
async fn test_e2e_batch_runs_to_completion() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    // Unique background so the photo has never been processed before.
    let background = (chrono::Utc::now().timestamp_subsec_millis() % 200) as u8 + 40;
    let items = [
        item(LEFT_SLOT, Shade::Red, 0.9, "can"),
        item(RIGHT_SLOT, Shade::Blue, 0.8, "jar"),
    ];
    let photo = shelf_photo(&items, background);

    let upload = upload_shelf_photos(
        &client,
        &base_url,
        &[("shelf.png", photo.clone()), ("shelf-copy.png", photo)],
    )
    .await
    .expect("Failed to upload photos");

    assert_eq!(upload.status, "queued");
    assert_eq!(upload.total_images, 1);
    assert_eq!(upload.duplicates, 1);
    println!("  ✓ Batch queued: {} ({})", upload.batch_id, upload.message);

    let progress = poll_batch_status(&client, &base_url, upload.batch_id, 900)
        .await
        .expect("Batch did not complete");

    assert_eq!(progress.batch_id, upload.batch_id);
    assert_eq!(progress.processed_images + progress.failed_images, 1);
    assert!(progress.verified_products + progress.review_products <= progress.total_products);

    println!(
        "  ✓ Completed: {} products ({} verified, {} for review)",
        progress.total_products, progress.verified_products, progress.review_products
    );

    let queue: serde_json::Value = client
        .get(format!("{}/api/v1/queue", base_url))
        .send()
        .await
        .expect("Queue status failed")
        .json()
        .await
        .expect("Queue body");
    assert!(queue.get("pending").is_some());
}
