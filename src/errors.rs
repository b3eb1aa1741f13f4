use crate::services::chunked_upload::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

/// Client errors keep a fixed short message; server errors are logged in
/// full and answered with a generic one so no paths or internals leak.
impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        use UploadError::*;
        match &err {
            MissingMetadata => Self::bad_request("Chunk upload is missing required metadata."),
            SizeMismatch { .. } => Self::bad_request("Upload metadata is invalid: size changed."),
            NameMismatch { .. } => Self::bad_request("Chunk upload file metadata is invalid."),
            OffsetMismatch { .. } => {
                Self::bad_request("Chunked upload offset does not match the stored offset.")
            }
            UnsupportedPayload(_) => Self::bad_request("Upload data type not recognised."),
            ChunkExceedsTotal { .. } => {
                Self::bad_request("Chunk extends past the declared upload length.")
            }
            UploadAlreadyComplete(_) => Self::new(
                StatusCode::CONFLICT,
                "Upload has already received all of its data.",
            ),
            ReassemblyNotReady(_) => Self::new(
                StatusCode::CONFLICT,
                "Upload has not received all of its data.",
            ),
            UnknownUpload(_) => Self::not_found("Invalid upload ID specified."),
            StorageUnavailable(_) => {
                tracing::error!("{}", err);
                Self::internal("Unable to prepare storage for upload data.")
            }
            StorageInconsistent { .. } => {
                tracing::error!("{}", err);
                Self::internal("Invalid upload location, can't continue upload.")
            }
            ChunkMissing { .. } | SizeVerificationFailed { .. } => {
                tracing::error!("{}", err);
                Self::internal("Error storing uploaded file.")
            }
            IncompleteUpload(_) | ChunkStore(_) | Database(_) | Io(_) => {
                tracing::error!("{}", err);
                Self::internal("Data storage error occurred.")
            }
        }
    }
}
