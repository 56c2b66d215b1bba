//! S3 API request handlers

pub mod multipart;
pub mod object;
pub mod service;

pub use multipart::*;
pub use object::*;
pub use service::*;

use axum::http::HeaderMap;
use s3ep_backend::Metadata;
use s3ep_core::{CreateUpload, TransportHints};

/// Header selecting the KEK provider for a new object
pub const PROVIDER_HEADER: &str = "x-s3ep-kek-alias";

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `x-amz-meta-*` headers, keyed without the prefix
pub(crate) fn user_metadata(headers: &HeaderMap) -> Metadata {
    let mut metadata = Metadata::new();
    for (name, value) in headers.iter() {
        if let Some(key) = name.as_str().strip_prefix("x-amz-meta-") {
            if let Ok(v) = value.to_str() {
                metadata.insert(key.to_string(), v.to_string());
            }
        }
    }
    metadata
}

/// Content type, user metadata and provider choice from request headers
pub(crate) fn create_request(headers: &HeaderMap) -> CreateUpload {
    CreateUpload {
        content_type: header_str(headers, "Content-Type").map(str::to_string),
        user_metadata: user_metadata(headers),
        provider_alias: header_str(headers, PROVIDER_HEADER).map(str::to_string),
    }
}

/// Framing hints for the body decoder
pub(crate) fn transport_hints(headers: &HeaderMap, decode_http_chunked: bool) -> TransportHints {
    let mut hints = TransportHints::new().decode_http_chunked(decode_http_chunked);
    if let Some(v) = header_str(headers, "x-amz-content-sha256") {
        hints = hints.with_content_sha256(v);
    }
    if let Some(v) = header_str(headers, "Content-Encoding") {
        hints = hints.with_content_encoding(v);
    }
    if let Some(v) = header_str(headers, "Transfer-Encoding") {
        hints = hints.with_transfer_encoding(v);
    }
    hints
}
