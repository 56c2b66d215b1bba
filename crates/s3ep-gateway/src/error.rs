//! Error types and S3 error codes

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use s3ep_backend::BackendError;
use s3ep_core::CoreError;
use thiserror::Error;

/// Per-request values echoed in error documents
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub request_id: String,
    /// Path and query of the request
    pub url: String,
}

tokio::task_local! {
    /// Set by the request-id middleware for the lifetime of one request
    pub static REQUEST_CONTEXT: RequestContext;
}

/// S3 error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3ErrorCode {
    EncryptionKeyMissing,
    EntityTooLarge,
    EntityTooSmall,
    IncompleteBody,
    InternalError,
    InvalidArgument,
    InvalidPart,
    InvalidPartOrder,
    InvalidRange,
    InvalidRequest,
    KmsUnavailable,
    MalformedXML,
    NoSuchBucket,
    NoSuchKey,
    NoSuchUpload,
    NotImplemented,
    ServiceUnavailable,
    SlowDown,
}

impl S3ErrorCode {
    /// Get the error code string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EncryptionKeyMissing => "EncryptionKeyMissing",
            Self::EntityTooLarge => "EntityTooLarge",
            Self::EntityTooSmall => "EntityTooSmall",
            Self::IncompleteBody => "IncompleteBody",
            Self::InternalError => "InternalError",
            Self::InvalidArgument => "InvalidArgument",
            Self::InvalidPart => "InvalidPart",
            Self::InvalidPartOrder => "InvalidPartOrder",
            Self::InvalidRange => "InvalidRange",
            Self::InvalidRequest => "InvalidRequest",
            Self::KmsUnavailable => "KMS.KMSInternalException",
            Self::MalformedXML => "MalformedXML",
            Self::NoSuchBucket => "NoSuchBucket",
            Self::NoSuchKey => "NoSuchKey",
            Self::NoSuchUpload => "NoSuchUpload",
            Self::NotImplemented => "NotImplemented",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::SlowDown => "SlowDown",
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EncryptionKeyMissing => StatusCode::UNPROCESSABLE_ENTITY,
            Self::EntityTooLarge
            | Self::EntityTooSmall
            | Self::IncompleteBody
            | Self::InvalidArgument
            | Self::InvalidPart
            | Self::InvalidPartOrder
            | Self::InvalidRequest
            | Self::MalformedXML => StatusCode::BAD_REQUEST,
            Self::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::InternalError | Self::KmsUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NoSuchBucket | Self::NoSuchKey | Self::NoSuchUpload => StatusCode::NOT_FOUND,
            Self::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::SlowDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// API error type
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{message}")]
    S3Error {
        code: S3ErrorCode,
        message: String,
        resource: Option<String>,
    },

    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        Self::Core(CoreError::Backend(err))
    }
}

impl ApiError {
    /// Create a new S3 error
    pub fn s3(code: S3ErrorCode, message: impl Into<String>) -> Self {
        Self::S3Error {
            code,
            message: message.into(),
            resource: None,
        }
    }

    /// Create with resource
    pub fn s3_with_resource(code: S3ErrorCode, message: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::S3Error {
            code,
            message: message.into(),
            resource: Some(resource.into()),
        }
    }

    /// Get the error code
    pub fn error_code(&self) -> S3ErrorCode {
        match self {
            Self::S3Error { code, .. } => *code,
            Self::Internal(_) => S3ErrorCode::InternalError,
            Self::Core(e) => core_error_code(e),
        }
    }

    fn resource(&self) -> Option<&str> {
        match self {
            Self::S3Error { resource, .. } => resource.as_deref(),
            _ => None,
        }
    }
}

fn core_error_code(err: &CoreError) -> S3ErrorCode {
    match err {
        CoreError::Decode(_) => S3ErrorCode::InvalidRequest,
        CoreError::TruncatedChunk { .. } | CoreError::Io(_) => S3ErrorCode::IncompleteBody,
        CoreError::ProviderUnavailable(_) | CoreError::WrapFailed { .. } => S3ErrorCode::KmsUnavailable,
        CoreError::KeyMissing(_) => S3ErrorCode::EncryptionKeyMissing,
        CoreError::SessionNotFound(_) => S3ErrorCode::NoSuchUpload,
        CoreError::CounterOverflow(_)
        | CoreError::InvalidByteCount(_)
        | CoreError::PartNumberOutOfRange { .. } => S3ErrorCode::InvalidArgument,
        CoreError::PartTooLarge { .. } => S3ErrorCode::EntityTooLarge,
        CoreError::InvalidPart(_) => S3ErrorCode::InvalidPart,
        CoreError::InvalidPartOrder => S3ErrorCode::InvalidPartOrder,
        CoreError::BackendUploadFailed { source, .. } => backend_error_code(source),
        CoreError::Backend(e) => backend_error_code(e),
        CoreError::SessionExists(_)
        | CoreError::MetadataAttachmentFailed { .. }
        | CoreError::InvalidMetadata(_)
        | CoreError::Configuration(_)
        | CoreError::Crypto(_) => S3ErrorCode::InternalError,
    }
}

fn backend_error_code(err: &BackendError) -> S3ErrorCode {
    match err {
        BackendError::NoSuchKey { .. } => S3ErrorCode::NoSuchKey,
        BackendError::NoSuchBucket(_) => S3ErrorCode::NoSuchBucket,
        BackendError::NoSuchUpload(_) => S3ErrorCode::NoSuchUpload,
        BackendError::InvalidPart(_) => S3ErrorCode::InvalidPart,
        BackendError::InvalidPartOrder => S3ErrorCode::InvalidPartOrder,
        BackendError::EntityTooSmall { .. } => S3ErrorCode::EntityTooSmall,
        e if e.is_retryable() => S3ErrorCode::ServiceUnavailable,
        _ => S3ErrorCode::InternalError,
    }
}

fn escape(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.error_code();
        let status = code.status_code();
        let context = REQUEST_CONTEXT.try_with(|c| c.clone()).unwrap_or_else(|_| RequestContext {
            request_id: uuid::Uuid::new_v4().to_string(),
            url: String::new(),
        });

        if status.is_server_error() {
            tracing::error!(code = code.as_str(), request_id = %context.request_id, error = %self, "Request failed");
        } else {
            tracing::debug!(code = code.as_str(), request_id = %context.request_id, error = %self, "Request rejected");
        }

        let resource = self.resource().unwrap_or(&context.url);
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
    <Code>{}</Code>
    <Message>{}</Message>
    <Resource>{}</Resource>
    <RequestURL>{}</RequestURL>
    <RequestId>{}</RequestId>
</Error>"#,
            code.as_str(),
            escape(&self.to_string()),
            escape(resource),
            escape(&context.url),
            context.request_id
        );

        // x-amz-error-code matters for HEAD requests, which have no body
        (
            status,
            [
                ("Content-Type", "application/xml"),
                ("x-amz-request-id", context.request_id.as_str()),
                ("x-amz-error-code", code.as_str()),
            ],
            xml,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(CoreError::Decode("bad hex".into()), S3ErrorCode::InvalidRequest, 400)]
    #[case(CoreError::TruncatedChunk { declared: 5, received: 2 }, S3ErrorCode::IncompleteBody, 400)]
    #[case(CoreError::KeyMissing("old".into()), S3ErrorCode::EncryptionKeyMissing, 422)]
    #[case(CoreError::ProviderUnavailable("vault".into()), S3ErrorCode::KmsUnavailable, 500)]
    #[case(CoreError::SessionNotFound("u1".into()), S3ErrorCode::NoSuchUpload, 404)]
    #[case(CoreError::PartTooLarge { part_number: 1, limit: 64 }, S3ErrorCode::EntityTooLarge, 400)]
    #[case(CoreError::InvalidPartOrder, S3ErrorCode::InvalidPartOrder, 400)]
    #[case(
        CoreError::BackendUploadFailed { part_number: 2, source: BackendError::Timeout { seconds: 3 } },
        S3ErrorCode::ServiceUnavailable,
        503
    )]
    #[case(
        CoreError::Backend(BackendError::NoSuchKey { bucket: "b".into(), key: "k".into() }),
        S3ErrorCode::NoSuchKey,
        404
    )]
    fn test_core_error_mapping(#[case] err: CoreError, #[case] code: S3ErrorCode, #[case] status: u16) {
        let err = ApiError::from(err);
        assert_eq!(err.error_code(), code);
        assert_eq!(err.error_code().status_code().as_u16(), status);
    }

    #[tokio::test]
    async fn test_error_document_carries_request_context() {
        let context = RequestContext {
            request_id: "req-1".into(),
            url: "/bucket/key?uploadId=x".into(),
        };
        let response = REQUEST_CONTEXT
            .scope(context, async {
                ApiError::from(CoreError::SessionNotFound("x".into())).into_response()
            })
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-amz-request-id"], "req-1");
        assert_eq!(response.headers()["x-amz-error-code"], "NoSuchUpload");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("<RequestURL>/bucket/key?uploadId=x</RequestURL>"));
        assert!(body.contains("<RequestId>req-1</RequestId>"));
    }
}
