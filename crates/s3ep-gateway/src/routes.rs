//! HTTP route definitions

use crate::{handlers, middleware, ApiError, AppState, S3ErrorCode};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::HeaderMap,
    middleware as axum_middleware,
    response::Response,
    routing::{get, head},
    Router,
};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

/// Query keys that do not select an S3 sub-resource
const PASSTHROUGH_QUERY_KEYS: &[&str] = &[
    "uploadId",
    "partNumber",
    "uploads",
    "x-id",
    "max-parts",
    "part-number-marker",
    "max-uploads",
    "key-marker",
    "upload-id-marker",
    "prefix",
    "delimiter",
    "encoding-type",
];

type QueryMap = BTreeMap<String, String>;

/// Create the main router
pub fn create_router(state: Arc<AppState>) -> Router {
    let rate_limiter = middleware::create_rate_limiter(state.config.rate_limit_rps);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        // Service endpoints
        .route("/", head(handlers::health_check))
        .route("/health", get(handlers::health_status))
        // Bucket endpoints
        .route("/{bucket}", get(bucket_get_handler))
        // Object endpoints
        .route(
            "/{bucket}/{*key}",
            get(object_get_handler)
                .head(object_head_handler)
                .put(object_put_handler)
                .post(object_post_handler)
                .delete(object_delete_handler),
        )
        .fallback(middleware::not_implemented)
        .method_not_allowed_fallback(middleware::not_implemented)
        // Apply middleware
        .layer(axum_middleware::from_fn_with_state(
            rate_limiter,
            middleware::rate_limit_middleware,
        ))
        .layer(axum_middleware::from_fn(middleware::logging_middleware))
        .layer(axum_middleware::from_fn(middleware::request_id_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(state.config.max_body_size))
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .with_state(state)
}

/// Reject requests that name an unsupported sub-resource (`?acl`, `?tagging`, ...)
fn check_subresources(query: &QueryMap) -> Result<(), ApiError> {
    let unsupported = query.keys().find(|k| {
        !PASSTHROUGH_QUERY_KEYS.contains(&k.as_str())
            && !k.to_ascii_lowercase().starts_with("x-amz-")
            && !k.starts_with("response-")
    });
    match unsupported {
        Some(name) => Err(ApiError::s3(
            S3ErrorCode::NotImplemented,
            format!("The {} sub-resource is not supported by the proxy", name),
        )),
        None => Ok(()),
    }
}

fn multipart_params(query: &QueryMap) -> Result<handlers::MultipartParams, ApiError> {
    check_subresources(query)?;
    let part_number = query
        .get("partNumber")
        .map(|v| {
            v.parse::<u32>()
                .map_err(|_| ApiError::s3(S3ErrorCode::InvalidArgument, format!("Invalid partNumber: {}", v)))
        })
        .transpose()?;
    Ok(handlers::MultipartParams {
        upload_id: query.get("uploadId").cloned(),
        part_number,
        uploads: query.get("uploads").cloned(),
    })
}

/// GET on a bucket: only `?uploads` is served
async fn bucket_get_handler(
    state: State<Arc<AppState>>,
    path: Path<String>,
    Query(query): Query<QueryMap>,
) -> Result<Response, ApiError> {
    let params = multipart_params(&query)?;
    if params.uploads.is_some() {
        handlers::list_multipart_uploads(state, path).await
    } else {
        Err(ApiError::s3(
            S3ErrorCode::NotImplemented,
            "Bucket listing is not supported by the proxy",
        ))
    }
}

/// PUT routes to upload_part or put_object
async fn object_put_handler(
    state: State<Arc<AppState>>,
    path: Path<(String, String)>,
    Query(query): Query<QueryMap>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let params = multipart_params(&query)?;
    if headers.contains_key("x-amz-copy-source") {
        return Err(ApiError::s3(
            S3ErrorCode::NotImplemented,
            "CopyObject and UploadPartCopy are not supported by the proxy",
        ));
    }
    if params.upload_id.is_some() || params.part_number.is_some() {
        handlers::upload_part(state, path, Query(params), headers, body).await
    } else {
        handlers::put_object(state, path, headers, body).await
    }
}

/// GET with optional uploadId parameter
async fn object_get_handler(
    state: State<Arc<AppState>>,
    path: Path<(String, String)>,
    Query(query): Query<QueryMap>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let params = multipart_params(&query)?;
    if params.upload_id.is_some() {
        handlers::list_parts(state, path, Query(params)).await
    } else {
        handlers::get_object(state, path, headers).await
    }
}

async fn object_head_handler(
    state: State<Arc<AppState>>,
    path: Path<(String, String)>,
    Query(query): Query<QueryMap>,
) -> Result<Response, ApiError> {
    check_subresources(&query)?;
    handlers::head_object(state, path).await
}

/// DELETE with optional uploadId parameter
async fn object_delete_handler(
    state: State<Arc<AppState>>,
    path: Path<(String, String)>,
    Query(query): Query<QueryMap>,
) -> Result<Response, ApiError> {
    let params = multipart_params(&query)?;
    if params.upload_id.is_some() {
        handlers::abort_multipart_upload(state, path, Query(params)).await
    } else {
        handlers::delete_object(state, path).await
    }
}

/// POST (multipart operations)
async fn object_post_handler(
    state: State<Arc<AppState>>,
    path: Path<(String, String)>,
    Query(query): Query<QueryMap>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let params = multipart_params(&query)?;
    if params.uploads.is_some() {
        handlers::create_multipart_upload(state, path, headers).await
    } else if params.upload_id.is_some() {
        handlers::complete_multipart_upload(state, path, Query(params), body).await
    } else {
        Err(ApiError::s3(
            S3ErrorCode::NotImplemented,
            "This POST operation is not supported by the proxy",
        ))
    }
}
