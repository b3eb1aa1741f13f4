//! HTTP handlers for the chunked upload protocol.
//! Translates headers and bodies into protocol calls and delegates all
//! upload state to `ChunkedUploadService`.

use crate::{
    errors::AppError,
    services::chunked_upload::{AppendChunk, ChunkPayload, ChunkedUploadService, UploadError},
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

/// Declared total length of the upload.
pub const UPLOAD_LENGTH: &str = "upload-length";
/// Offset the chunk starts at; also returned by the resume query.
pub const UPLOAD_OFFSET: &str = "upload-offset";
/// Filename of the upload, repeated on every chunk.
pub const UPLOAD_NAME: &str = "upload-name";
/// Identity of the uploader, as resolved by whatever sits in front of us.
pub const UPLOAD_OWNER: &str = "x-upload-owner";

/// `POST /uploads`: start a chunked upload.
pub async fn initiate_upload(
    State(service): State<ChunkedUploadService>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let total_size = header_i64(&headers, UPLOAD_LENGTH);
    let owner = header_str(&headers, UPLOAD_OWNER).map(str::to_string);

    let upload_id = service.initiate(total_size, owner).await?;
    Ok(plain_text(upload_id))
}

/// `PATCH /uploads/{upload_id}`: append the next chunk.
pub async fn append_chunk(
    State(service): State<ChunkedUploadService>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let chunk = AppendChunk {
        offset: header_i64(&headers, UPLOAD_OFFSET),
        total_size: header_i64(&headers, UPLOAD_LENGTH),
        upload_name: header_str(&headers, UPLOAD_NAME).map(str::to_string),
        payload: classify_payload(&headers, body),
    };

    let upload_id = service
        .append_chunk(&upload_id, chunk)
        .await
        .map_err(|err| match err {
            // An append names its upload in the request itself; an unknown id
            // is bad request data, not a missing resource.
            UploadError::UnknownUpload(_) => {
                AppError::bad_request("Invalid chunk upload request data.")
            }
            other => AppError::from(other),
        })?;
    Ok(plain_text(upload_id))
}

/// `HEAD /uploads/{upload_id}`: report where to resume.
pub async fn resume_offset(
    State(service): State<ChunkedUploadService>,
    Path(upload_id): Path<String>,
) -> Result<Response, AppError> {
    let offset = service.query_resume_offset(&upload_id).await?;

    let mut response = plain_text(upload_id);
    if let Ok(value) = HeaderValue::from_str(&offset.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(UPLOAD_OFFSET), value);
    }
    Ok(response)
}

/// `POST /uploads/{upload_id}/reassemble`: retry storing an upload whose
/// data is complete but whose reassembly failed.
pub async fn reassemble_upload(
    State(service): State<ChunkedUploadService>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let stored = service.retry_reassembly(&upload_id).await?;
    Ok((StatusCode::OK, Json(stored)))
}

/// `GET /uploads/{upload_id}/stored`: metadata of a completed upload.
pub async fn stored_upload(
    State(service): State<ChunkedUploadService>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    match service.artifacts.fetch(&upload_id).await? {
        Some(stored) => Ok(Json(stored)),
        None => Err(AppError::not_found("No stored upload with this ID.")),
    }
}

/// Decide once how the body is to be read.
///
/// Structured bodies (JSON, forms) are not chunk data. Text must decode as
/// UTF-8; anything else is taken as raw bytes.
fn classify_payload(headers: &HeaderMap, body: Bytes) -> ChunkPayload {
    let content_type = header_str(headers, header::CONTENT_TYPE.as_str())
        .map(|value| value.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .unwrap_or_default();

    match content_type.as_str() {
        "application/json" | "application/x-www-form-urlencoded" | "multipart/form-data" => {
            ChunkPayload::Unsupported(content_type.clone())
        }
        kind if kind.starts_with("text/") => match String::from_utf8(body.to_vec()) {
            Ok(text) => ChunkPayload::Text(text),
            Err(_) => ChunkPayload::Unsupported(format!("{} with invalid UTF-8", content_type)),
        },
        _ => ChunkPayload::Binary(body),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Integer header value; absent, malformed and negative values all read as
/// missing.
fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    header_str(headers, name)
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v >= 0)
}

fn plain_text(body: String) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn integer_headers() {
        let map = headers(&[
            (UPLOAD_OFFSET, "42"),
            (UPLOAD_LENGTH, "-1"),
            ("x-junk", "abc"),
        ]);
        assert_eq!(header_i64(&map, UPLOAD_OFFSET), Some(42));
        assert_eq!(header_i64(&map, UPLOAD_LENGTH), None);
        assert_eq!(header_i64(&map, "x-junk"), None);
        assert_eq!(header_i64(&map, "x-absent"), None);
    }

    #[test]
    fn payload_classification() {
        let body = Bytes::from_static(b"{}");
        let json = headers(&[("content-type", "application/json; charset=utf-8")]);
        assert!(matches!(
            classify_payload(&json, body.clone()),
            ChunkPayload::Unsupported(_)
        ));

        let text = headers(&[("content-type", "text/plain")]);
        assert!(matches!(classify_payload(&text, body.clone()), ChunkPayload::Text(t) if t == "{}"));
        assert!(matches!(
            classify_payload(&text, Bytes::from_static(&[0xff, 0xfe])),
            ChunkPayload::Unsupported(_)
        ));

        let binary = headers(&[("content-type", "application/offset+octet-stream")]);
        assert!(matches!(classify_payload(&binary, body.clone()), ChunkPayload::Binary(_)));
        assert!(matches!(
            classify_payload(&HeaderMap::new(), body),
            ChunkPayload::Binary(_)
        ));
    }
}
