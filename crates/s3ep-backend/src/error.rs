//! Error types for the s3ep-backend crate

use thiserror::Error;

/// Result type alias using `BackendError`
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur while talking to the object store
#[derive(Error, Debug)]
pub enum BackendError {
    /// Object not found
    #[error("object not found: {bucket}/{key}")]
    NoSuchKey { bucket: String, key: String },

    /// Bucket not found
    #[error("bucket not found: {0}")]
    NoSuchBucket(String),

    /// Multipart upload not found
    #[error("multipart upload not found: {0}")]
    NoSuchUpload(String),

    /// A referenced part is missing or its ETag does not match
    #[error("invalid part: {0}")]
    InvalidPart(String),

    /// Part list was not in ascending order
    #[error("part list is not in ascending order")]
    InvalidPartOrder,

    /// A non-final part is below the minimum size
    #[error("part {part_number} is {size} bytes, below the minimum of {min} bytes")]
    EntityTooSmall { part_number: u32, size: u64, min: u64 },

    /// Error document returned by an S3-compatible service
    #[error("S3 error ({status} {code}): {message}")]
    S3 {
        status: u16,
        code: String,
        message: String,
    },

    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// HTTP error
    #[error("http error: {0}")]
    Http(String),

    /// Response could not be interpreted
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BackendError {
    /// Whether repeating the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout { .. } | Self::Http(_) => true,
            Self::S3 { status, code, .. } => {
                *status >= 500
                    || matches!(
                        code.as_str(),
                        "SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable"
                    )
            }
            _ => false,
        }
    }

    /// Whether the error reports a missing object, bucket or upload
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NoSuchKey { .. } | Self::NoSuchBucket(_) | Self::NoSuchUpload(_)
        )
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout { seconds: 30 }
        } else if err.is_connect() {
            BackendError::Connection(err.to_string())
        } else {
            BackendError::Http(err.to_string())
        }
    }
}

impl From<quick_xml::DeError> for BackendError {
    fn from(err: quick_xml::DeError) -> Self {
        BackendError::InvalidResponse(err.to_string())
    }
}
