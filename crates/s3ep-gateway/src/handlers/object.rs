//! Object operation handlers

use super::multipart::body_stream;
use super::{create_request, header_str, transport_hints};
use crate::{ApiError, AppState, S3ErrorCode};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{response::Builder, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use s3ep_core::ObjectView;
use std::sync::Arc;

/// PUT /{bucket}/{key} - Encrypt and store an object
pub async fn put_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let hints = transport_hints(&headers, state.config.decode_http_chunked);
    let etag = state
        .engine
        .put_object(&bucket, &key, body_stream(body), hints, create_request(&headers))
        .await?;

    Ok((StatusCode::OK, [("ETag", format!("\"{}\"", etag))], "").into_response())
}

/// GET /{bucket}/{key} - Get and decrypt an object, with Range support
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let object = state.engine.get_object(&bucket, &key).await?;
    let etag = format!("\"{}\"", object.view.etag);

    if let Some(if_none_match) = header_str(&headers, "If-None-Match") {
        if if_none_match == etag || if_none_match == "*" {
            return finish(
                object_headers(StatusCode::NOT_MODIFIED, &object.view).header("ETag", &etag),
                Body::empty(),
            );
        }
    }

    let data = object.data;
    let total_size = data.len();
    let (status, body, content_range) = match header_str(&headers, "Range") {
        Some(range) => {
            let (start, end) = parse_range_header(range, total_size)
                .ok_or_else(|| ApiError::s3(S3ErrorCode::InvalidRange, "Requested range not satisfiable"))?;
            (
                StatusCode::PARTIAL_CONTENT,
                data.slice(start..=end),
                Some(format!("bytes {}-{}/{}", start, end, total_size)),
            )
        }
        None => (StatusCode::OK, data, None),
    };

    let mut response = object_headers(status, &object.view)
        .header("ETag", &etag)
        .header("Content-Length", body.len().to_string())
        .header("Accept-Ranges", "bytes");
    if let Some(range) = content_range {
        response = response.header("Content-Range", range);
    }
    finish(response, Body::from(body))
}

/// HEAD /{bucket}/{key} - Plaintext size and metadata of an object
pub async fn head_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let view = state.engine.head_object(&bucket, &key).await?;
    let response = object_headers(StatusCode::OK, &view)
        .header("ETag", format!("\"{}\"", view.etag))
        .header("Content-Length", view.size.to_string());
    finish(response, Body::empty())
}

/// DELETE /{bucket}/{key} - Delete object
pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    state.engine.delete_object(&bucket, &key).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

fn object_headers(status: StatusCode, view: &ObjectView) -> Builder {
    let mut response = Response::builder().status(status).header(
        "Last-Modified",
        view.last_modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
    );
    if let Some(ref ct) = view.content_type {
        response = response.header("Content-Type", ct);
    }
    for (k, v) in &view.metadata {
        response = response.header(format!("x-amz-meta-{}", k), v);
    }
    response
}

fn finish(response: Builder, body: Body) -> Result<Response, ApiError> {
    response
        .body(body)
        .map_err(|e| ApiError::Internal(format!("invalid response header: {}", e)))
}

/// Parse Range header (e.g., "bytes=0-1023" or "bytes=500-" or "bytes=-500")
fn parse_range_header(range: &str, total_size: usize) -> Option<(usize, usize)> {
    let range = range.strip_prefix("bytes=")?;
    let (start_str, end_str) = range.split_once('-')?;
    if total_size == 0 {
        return None;
    }

    if start_str.is_empty() {
        // Suffix range: bytes=-500 means last 500 bytes
        let suffix_len: usize = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        Some((total_size.saturating_sub(suffix_len), total_size - 1))
    } else {
        let start: usize = start_str.parse().ok()?;
        if start >= total_size {
            return None;
        }
        if end_str.is_empty() {
            return Some((start, total_size - 1));
        }
        let end: usize = end_str.parse().ok()?;
        if start > end {
            return None;
        }
        Some((start, end.min(total_size - 1)))
    }
}
