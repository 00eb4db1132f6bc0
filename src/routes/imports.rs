use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::batch::BatchStatus;
use crate::models::job::QueueStatus;
use crate::models::upload::{BatchStatusResponse, UploadResponse};
use crate::routes::error::ApiError;
use crate::services::intake::UploadedImage;
use crate::services::queue::JobQueue;

/// POST /api/v1/imports: upload shelf photos for import.
pub async fn submit_import(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        if !matches!(field.name(), Some("images") | Some("images[]")) {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("image-{}", files.len() + 1));
        let bytes = field.bytes().await?;
        files.push(UploadedImage {
            filename,
            bytes: bytes.to_vec(),
        });
    }

    let receipt = state.intake.submit(files).await?;

    let message = if receipt.duplicates > 0 {
        format!(
            "Queued {} image(s); {} duplicate(s) skipped",
            receipt.total_images, receipt.duplicates
        )
    } else {
        format!("Queued {} image(s) for import", receipt.total_images)
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            batch_id: receipt.batch_id,
            status: BatchStatus::Queued,
            total_images: receipt.total_images,
            duplicates: receipt.duplicates,
            message,
        }),
    ))
}

/// GET /api/v1/imports/{batch_id}: poll batch progress.
pub async fn get_import_status(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<BatchStatusResponse>, ApiError> {
    let progress = state.progress.snapshot(batch_id).await.map_err(|e| {
        tracing::error!(batch_id = %batch_id, error = %e, "Failed to read batch progress");
        ApiError::unavailable("Progress store unavailable")
    })?;

    match progress {
        Some(p) => Ok(Json(p.into())),
        None => Err(ApiError::not_found(format!("Batch {} not found", batch_id))),
    }
}

/// GET /api/v1/queue: job counts per group.
pub async fn get_queue_status(
    State(state): State<AppState>,
) -> Result<Json<QueueStatus>, ApiError> {
    let status = state.queue.status().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to read queue status");
        ApiError::unavailable("Job queue unavailable")
    })?;
    Ok(Json(status))
}
