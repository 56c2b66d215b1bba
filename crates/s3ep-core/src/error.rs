//! Error types for the s3ep-core crate

use s3ep_backend::BackendError;
use s3ep_crypto::CryptoError;
use thiserror::Error;

/// Result type alias using `CoreError`
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur in the encryption engine
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed transport chunk framing
    #[error("malformed chunk framing: {0}")]
    Decode(String),

    /// The body ended inside a chunk
    #[error("truncated chunk: declared {declared} bytes, received {received}")]
    TruncatedChunk { declared: u64, received: u64 },

    /// Reading the request body failed
    #[error("body read error: {0}")]
    Io(#[from] std::io::Error),

    /// No KEK provider is registered under the alias
    #[error("KEK provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider rejected the DEK
    #[error("failed to wrap DEK with provider {alias}: {reason}")]
    WrapFailed { alias: String, reason: String },

    /// The key needed to decrypt an object is not in the local keystore
    #[error("encryption key missing for provider {0}; object cannot be decrypted")]
    KeyMissing(String),

    /// Unknown, completed or aborted upload
    #[error("upload session not found: {0}")]
    SessionNotFound(String),

    /// An upload session with this id already exists
    #[error("upload session already exists: {0}")]
    SessionExists(String),

    /// Counter or offset arithmetic left the representable range
    #[error("counter overflow: {0}")]
    CounterOverflow(String),

    /// Byte bookkeeping would become negative or overflow
    #[error("invalid byte count: {0}")]
    InvalidByteCount(String),

    /// Part number outside the usable range
    #[error("part number {part_number} is outside 1..={max}")]
    PartNumberOutOfRange { part_number: u32, max: u32 },

    /// A logical part is larger than its counter window
    #[error("part {part_number} exceeds the maximum part size of {limit} bytes")]
    PartTooLarge { part_number: u32, limit: u64 },

    /// Uploading a physical segment to the backend failed
    #[error("upload of physical part {part_number} failed: {source}")]
    BackendUploadFailed {
        part_number: u32,
        #[source]
        source: BackendError,
    },

    /// Encryption metadata could not be attached to a completed object
    #[error("failed to attach encryption metadata to {bucket}/{key}: {reason}")]
    MetadataAttachmentFailed {
        bucket: String,
        key: String,
        reason: String,
    },

    /// A completion request named a part that does not exist or mismatches
    #[error("invalid part: {0}")]
    InvalidPart(String),

    /// Completion request parts were not in ascending order
    #[error("the list of parts was not in ascending order")]
    InvalidPartOrder,

    /// Stored encryption metadata is missing or malformed
    #[error("invalid encryption metadata: {0}")]
    InvalidMetadata(String),

    /// Engine configuration is invalid
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Other crypto error
    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    /// Backend error
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl From<CryptoError> for CoreError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::ProviderUnavailable(alias) => Self::ProviderUnavailable(alias),
            CryptoError::WrapFailed { alias, reason } => Self::WrapFailed { alias, reason },
            CryptoError::KeyMissing(alias) => Self::KeyMissing(alias),
            CryptoError::CounterOverflow { offset, len } => {
                Self::CounterOverflow(format!("offset {} + {} bytes", offset, len))
            }
            other => Self::Crypto(other),
        }
    }
}

impl CoreError {
    /// Whether repeating the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::BackendUploadFailed { source, .. } => source.is_retryable(),
            Self::Backend(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether the error was caused by the client's request
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Decode(_)
                | Self::TruncatedChunk { .. }
                | Self::SessionNotFound(_)
                | Self::PartNumberOutOfRange { .. }
                | Self::PartTooLarge { .. }
                | Self::InvalidPart(_)
                | Self::InvalidPartOrder
        )
    }
}
