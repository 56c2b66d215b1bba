//! HTTP middleware for request ids, logging and rate limiting

use crate::error::{RequestContext, REQUEST_CONTEXT};
use crate::{ApiError, S3ErrorCode};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type
pub type KeyedRateLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, governor::clock::DefaultClock>;

/// Create a rate limiter; zero is raised to one request per second
pub fn create_rate_limiter(requests_per_second: u32) -> Arc<KeyedRateLimiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::keyed(quota))
}

/// Access key id from a SigV4 `Authorization` header
///
/// `AWS4-HMAC-SHA256 Credential=AKID/20240101/us-east-1/s3/aws4_request, ...`
pub fn access_key_id(authorization: &str) -> Option<&str> {
    let credential = authorization.split("Credential=").nth(1)?;
    let akid = credential.split('/').next()?.trim();
    (!akid.is_empty()).then_some(akid)
}

/// Rate limiting middleware, keyed by the client's access key
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<KeyedRateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let client = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(access_key_id)
        .unwrap_or("anonymous")
        .to_string();

    if limiter.check_key(&client).is_err() {
        return Err(ApiError::s3(S3ErrorCode::SlowDown, "Please reduce your request rate"));
    }

    Ok(next.run(request).await)
}

/// Request ID middleware - adds x-amz-request-id header
///
/// The id and URL are also scoped into [`REQUEST_CONTEXT`] so error
/// documents produced further down can echo them.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let url = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let context = RequestContext {
        request_id: request_id.clone(),
        url,
    };
    let mut response = REQUEST_CONTEXT.scope(context, next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-amz-request-id", value);
    }
    response
}

/// Request ID extension
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Logging middleware
pub async fn logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = request.extensions().get::<RequestId>().map(|r| r.0.clone()).unwrap_or_default();
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    tracing::info!(
        method = %method,
        uri = %uri,
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        request_id = %request_id,
        "Request completed"
    );

    response
}

/// Fallback for sub-resources the proxy does not implement
pub async fn not_implemented() -> Response {
    ApiError::s3(S3ErrorCode::NotImplemented, "This operation is not supported by the proxy").into_response()
}
