use std::{path::Path, sync::Arc};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    error::{ApiError, ApiResult, MessageResponse},
    results::{TierMap, CSV_FILE_NAME, GEOJSON_FILE_NAME},
    service::{OakWiltService, UploadedImage},
    utils::{allowed_file, secure_filename},
};

pub type AppState = Arc<OakWiltService>;

pub fn create_router(service: AppState, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/", get(greetings))
        .route("/health", get(health_check))
        .route("/upload-images", post(upload_images))
        .route("/submit-feedback", post(submit_feedback))
        .route("/images/:filename", get(serve_image))
        .route("/results.csv", get(download_results_csv))
        .route("/results.geojson", get(download_results_geojson))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(service)
}

async fn greetings() -> &'static str {
    "Hello, world!"
}

async fn health_check(State(service): State<AppState>) -> Json<serde_json::Value> {
    let stats = service.retrain_stats();
    Json(json!({
        "status": "OK",
        "feedback_queued": service.feedback_queued(),
        "retraining": stats,
    }))
}

#[derive(Serialize)]
struct UploadResponse {
    message: &'static str,
    results: TierMap,
    csv_file_path: String,
    geojson_file_path: String,
}

async fn upload_images(
    State(service): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let mut saw_file = false;
    let mut uploads = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        saw_file = true;

        let original = field.file_name().unwrap_or_default().to_string();
        let filename = secure_filename(&original);
        if filename.is_empty() || !allowed_file(&filename) {
            warn!(filename = %original, "skipping upload with disallowed name");
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(err.to_string()))?;
        uploads.push(UploadedImage {
            filename,
            bytes: bytes.to_vec(),
        });
    }

    if !saw_file {
        return Err(ApiError::NoFiles);
    }
    // Keep the previous batch's result files when nothing here is usable.
    if uploads.is_empty() {
        return Err(ApiError::bad_request("No allowed image files in upload"));
    }
    info!(count = uploads.len(), "classifying uploads");

    let results = service.process_uploads(uploads).await?;

    Ok(Json(UploadResponse {
        message: "The results files are ready to download",
        results,
        csv_file_path: format!("/{CSV_FILE_NAME}"),
        geojson_file_path: format!("/{GEOJSON_FILE_NAME}"),
    }))
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    filename: String,
    #[serde(rename = "isCorrect")]
    is_correct: bool,
}

async fn submit_feedback(
    State(service): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<MessageResponse>> {
    let feedback: FeedbackRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::InvalidFeedback)?;

    service
        .submit_feedback(&feedback.filename, feedback.is_correct)
        .await?;

    Ok(Json(MessageResponse::new("Feedback received")))
}

async fn serve_image(
    State(service): State<AppState>,
    UrlPath(filename): UrlPath<String>,
) -> ApiResult<Response> {
    let path = service.image_path(&filename);
    serve_file(&path, None).await
}

async fn download_results_csv(State(service): State<AppState>) -> ApiResult<Response> {
    serve_file(&service.results_dir().join(CSV_FILE_NAME), Some(CSV_FILE_NAME)).await
}

async fn download_results_geojson(State(service): State<AppState>) -> ApiResult<Response> {
    serve_file(
        &service.results_dir().join(GEOJSON_FILE_NAME),
        Some(GEOJSON_FILE_NAME),
    )
    .await
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("csv") => "text/csv",
        Some("geojson") => "application/geo+json",
        _ => "application/octet-stream",
    }
}

/// Streams a stored file back, optionally as a named attachment.
async fn serve_file(path: &Path, attachment: Option<&str>) -> ApiResult<Response> {
    let not_found = || {
        ApiError::not_found(
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        )
    };
    if !path.is_file() {
        return Err(not_found());
    }
    let bytes = tokio::fs::read(path).await.map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => not_found(),
        _ => ApiError::Internal(err.to_string()),
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type(path)));
    if let Some(name) = attachment {
        let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{name}\""))
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }

    Ok((StatusCode::OK, headers, bytes).into_response())
}
