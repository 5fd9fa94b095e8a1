//! Error types for the Chunkdrop server

use axum::{
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::upload::UploadError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Startup and wiring errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upload service error: {0}")]
    Upload(#[from] UploadError),
}

/// Error response body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    code: &'static str,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    actual: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing: Option<Vec<u32>>,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = ErrorResponse {
            error: self.to_string(),
            code: self.code(),
            retryable: self.is_retryable(),
            limit: None,
            actual: None,
            mime: None,
            missing: None,
        };

        match &self {
            UploadError::QuotaExceeded { used, limit, .. } => {
                body.error = "Quota exceeded".to_string();
                body.limit = Some(*limit);
                body.actual = Some(used.to_string());
            }
            UploadError::ArtifactTooLarge { limit, actual } => {
                body.limit = Some(*limit);
                body.actual = Some(actual.to_string());
            }
            UploadError::IntegrityMismatch { actual, .. } => {
                body.actual = Some(actual.clone());
            }
            UploadError::TypeBlocked { mime } => {
                body.mime = Some(mime.clone());
            }
            UploadError::IncompleteUpload { missing, .. } => {
                body.missing = Some(missing.clone());
            }
            // Internal details stay in the log
            UploadError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                body.error = "Storage error".to_string();
            }
            UploadError::Database(e) => {
                tracing::error!("Database error: {}", e);
                body.error = "Database error".to_string();
            }
            UploadError::CorruptChunk { blob_name } => {
                tracing::error!("Corrupt chunk: {}", blob_name);
                body.error = "Stored chunk failed authentication".to_string();
            }
            _ => {}
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = self.retry_after() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
