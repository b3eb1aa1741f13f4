//! Defines routes for the chunked upload protocol.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `POST  /uploads` - start a chunked upload (`Upload-Length` header)
//!   - `PATCH /uploads/{upload_id}` - append a chunk (`Upload-Offset`,
//!     `Upload-Length`, `Upload-Name` headers, raw body)
//!   - `HEAD  /uploads/{upload_id}` - resume offset in `Upload-Offset`
//!
//! - **Administrative endpoints**
//!   - `POST /uploads/{upload_id}/reassemble` - retry a failed reassembly
//!   - `GET  /uploads/{upload_id}/stored` - metadata of the stored upload

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{
            append_chunk, initiate_upload, reassemble_upload, resume_offset, stored_upload,
        },
    },
    services::chunked_upload::ChunkedUploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
};

/// Build and return the router for all upload routes.
///
/// `max_chunk_bytes` bounds the body of a single append request.
pub fn routes(max_chunk_bytes: usize) -> Router<ChunkedUploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/uploads", post(initiate_upload))
        .route(
            "/uploads/{upload_id}",
            patch(append_chunk)
                .head(resume_offset)
                .layer(DefaultBodyLimit::max(max_chunk_bytes)),
        )
        .route("/uploads/{upload_id}/reassemble", post(reassemble_upload))
        .route("/uploads/{upload_id}/stored", get(stored_upload))
}
