//! Multipart upload handlers

use super::{create_request, transport_hints};
use crate::{xml, ApiError, AppState, S3ErrorCode};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use s3ep_core::UNDECORATED_HEADER;
use serde::Deserialize;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

/// Query params for multipart operations
#[derive(Debug, Default, Deserialize)]
pub struct MultipartParams {
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    #[serde(rename = "partNumber")]
    pub part_number: Option<u32>,
    pub uploads: Option<String>,
}

impl MultipartParams {
    fn require_upload_id(&self) -> Result<&str, ApiError> {
        self.upload_id
            .as_deref()
            .ok_or_else(|| ApiError::s3(S3ErrorCode::InvalidArgument, "Missing uploadId"))
    }
}

/// Boxed request body as a stream of byte chunks
pub(crate) type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

pub(crate) fn body_stream(body: Body) -> BodyStream {
    Box::pin(body.into_data_stream().map_err(io::Error::other))
}

pub(crate) fn xml_response(document: Result<String, quick_xml::SeError>) -> Result<Response, ApiError> {
    let xml = document.map_err(|e| ApiError::Internal(format!("failed to render XML: {}", e)))?;
    Ok((StatusCode::OK, [("Content-Type", "application/xml")], xml).into_response())
}

/// POST /{bucket}/{key}?uploads - Initiate multipart upload
pub async fn create_multipart_upload(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let upload_id = state
        .engine
        .create_multipart_upload(&bucket, &key, create_request(&headers))
        .await?;

    xml_response(xml::initiate_multipart_upload_result(&bucket, &key, &upload_id))
}

/// PUT /{bucket}/{key}?partNumber=N&uploadId=X - Upload part
pub async fn upload_part(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<MultipartParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let upload_id = params.require_upload_id()?;
    let part_number = params
        .part_number
        .ok_or_else(|| ApiError::s3(S3ErrorCode::InvalidArgument, "Missing partNumber"))?;

    let hints = transport_hints(&headers, state.config.decode_http_chunked);
    let outcome = state
        .engine
        .upload_part(&bucket, &key, upload_id, part_number, body_stream(body), hints)
        .await?;

    Ok((StatusCode::OK, [("ETag", format!("\"{}\"", outcome.etag))], "").into_response())
}

/// POST /{bucket}/{key}?uploadId=X - Complete multipart upload
pub async fn complete_multipart_upload(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<MultipartParams>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let upload_id = params.require_upload_id()?;
    let requested = xml::parse_complete_multipart_upload(&body)
        .map_err(|e| ApiError::s3(S3ErrorCode::MalformedXML, format!("Invalid CompleteMultipartUpload body: {}", e)))?;

    let outcome = state
        .engine
        .complete_multipart_upload(&bucket, &key, upload_id, requested.as_deref())
        .await?;

    let location = format!("/{}/{}", bucket, key);
    let mut response = xml_response(xml::complete_multipart_upload_result(
        &location,
        &bucket,
        &key,
        &outcome.etag,
    ))?;
    if outcome.undecorated() {
        response
            .headers_mut()
            .insert(UNDECORATED_HEADER, axum::http::HeaderValue::from_static("true"));
    }
    Ok(response)
}

/// DELETE /{bucket}/{key}?uploadId=X - Abort multipart upload
pub async fn abort_multipart_upload(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<MultipartParams>,
) -> Result<Response, ApiError> {
    let upload_id = params.require_upload_id()?;
    state.engine.abort_multipart_upload(&bucket, &key, upload_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// GET /{bucket}/{key}?uploadId=X - List parts
pub async fn list_parts(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<MultipartParams>,
) -> Result<Response, ApiError> {
    let upload_id = params.require_upload_id()?;
    let parts = state.engine.list_parts(&bucket, &key, upload_id)?;
    xml_response(xml::list_parts_result(&bucket, &key, upload_id, &parts))
}

/// GET /{bucket}?uploads - List in-progress multipart uploads
pub async fn list_multipart_uploads(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Result<Response, ApiError> {
    let uploads = state.engine.list_multipart_uploads(&bucket);
    xml_response(xml::list_multipart_uploads_result(&bucket, &uploads))
}
