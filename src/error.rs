//! HTTP error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::service::ServiceError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No files to upload")]
    NoFiles,

    #[error("Invalid feedback data")]
    InvalidFeedback,

    #[error("{0}")]
    BadRequest(String),

    #[error("Error loading image for feedback")]
    FeedbackImageUnavailable,

    #[error("Model is busy retraining, try again later")]
    ModelBusy,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NoFiles | ApiError::InvalidFeedback | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ModelBusy => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::FeedbackImageUnavailable | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::UnreadableImage { filename, .. } => {
                ApiError::bad_request(format!("Could not read image {filename}"))
            }
            ServiceError::FeedbackImage { .. } => ApiError::FeedbackImageUnavailable,
            ServiceError::ModelBusy(_) => ApiError::ModelBusy,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(MessageResponse::new(self.to_string()))).into_response()
    }
}
