//! HTTP helpers for end-to-end tests against a running server

use reqwest::multipart;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Response from POST /api/v1/imports
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub batch_id: Uuid,
    pub status: String,
    pub total_images: usize,
    pub duplicates: usize,
    pub message: String,
}

/// Response from GET /api/v1/imports/{batch_id}
#[derive(Debug, Deserialize)]
pub struct BatchStatusResponse {
    pub batch_id: Uuid,
    pub status: String,
    pub total_images: i64,
    pub processed_images: i64,
    pub failed_images: i64,
    pub total_products: i64,
    pub verified_products: i64,
    pub review_products: i64,
    pub current_image: String,
}

/// Raw response of an upload, for asserting on rejections.
pub async fn post_photos(
    client: &reqwest::Client,
    base_url: &str,
    photos: &[(&str, Vec<u8>, &str)],
) -> Result<reqwest::Response, Box<dyn std::error::Error>> {
    let mut form = multipart::Form::new();
    for (filename, bytes, mime) in photos {
        form = form.part(
            "images",
            multipart::Part::bytes(bytes.clone())
                .file_name(filename.to_string())
                .mime_str(mime)?,
        );
    }

    let response = client
        .post(format!("{}/api/v1/imports", base_url))
        .multipart(form)
        .send()
        .await?;
    Ok(response)
}

/// Upload PNG shelf photos and expect the batch to be accepted
pub async fn upload_shelf_photos(
    client: &reqwest::Client,
    base_url: &str,
    photos: &[(&str, Vec<u8>)],
) -> Result<UploadResponse, Box<dyn std::error::Error>> {
    let parts: Vec<_> = photos
        .iter()
        .map(|(name, bytes)| (*name, bytes.clone(), "image/png"))
        .collect();
    let response = post_photos(client, base_url, &parts).await?;

    let status = response.status();
    if status != reqwest::StatusCode::ACCEPTED {
        let error_text = response.text().await?;
        return Err(format!("Upload failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<UploadResponse>().await?)
}

/// Poll batch progress until completed (with timeout)
pub async fn poll_batch_status(
    client: &reqwest::Client,
    base_url: &str,
    batch_id: Uuid,
    timeout_secs: u64,
) -> Result<BatchStatusResponse, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs; // Poll every second

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/api/v1/imports/{}", base_url, batch_id))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let progress = response.json::<BatchStatusResponse>().await?;
        if progress.status == "completed" {
            return Ok(progress);
        }

        if attempt % 15 == 0 && attempt > 0 {
            println!(
                "  ... {} ({}/{} images, {} products)",
                progress.status,
                progress.processed_images + progress.failed_images,
                progress.total_images,
                progress.total_products
            );
        }
        sleep(Duration::from_secs(1)).await;
    }

    Err(format!("Batch did not complete within {} seconds", timeout_secs).into())
}
