//! Error types for the s3ep-crypto crate

use thiserror::Error;

/// Result type alias using `CryptoError`
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Encryption failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Invalid key format or length
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid IV format or length
    #[error("invalid iv: {0}")]
    InvalidIv(String),

    /// The keystream position would leave the counter space
    #[error("counter overflow: offset {offset} + {len} bytes exceeds the keystream range")]
    CounterOverflow { offset: u64, len: usize },

    /// No KEK provider is registered under the alias
    #[error("KEK provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider rejected the key during wrapping
    #[error("failed to wrap DEK with provider {alias}: {reason}")]
    WrapFailed { alias: String, reason: String },

    /// The provider could not unwrap the key
    #[error("failed to unwrap DEK with provider {alias}: {reason}")]
    UnwrapFailed { alias: String, reason: String },

    /// The key needed to unwrap a DEK is not present in the local keystore
    #[error("key for provider {0} is missing from the local keystore")]
    KeyMissing(String),

    /// Provider configuration is invalid
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Base64 decode error
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    /// Hex decode error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

impl CryptoError {
    /// Whether this error belongs to the key-management family
    pub fn is_key_management(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_)
                | Self::WrapFailed { .. }
                | Self::UnwrapFailed { .. }
                | Self::KeyMissing(_)
        )
    }
}
