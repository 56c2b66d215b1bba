//! Key material for envelope encryption
//!
//! - DEK: random symmetric key that encrypts one object or multipart upload
//! - IV: random counter seed paired with the DEK; persisted next to the
//!   wrapped DEK so readers can rebuild the keystream

use crate::{CryptoError, Result};
use base64::Engine;
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a symmetric key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the CTR IV / initial counter block in bytes (128 bits)
pub const IV_SIZE: usize = 16;

/// A Data Encryption Key (DEK) for the stream cipher
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DekKey {
    key: [u8; KEY_SIZE],
}

impl DekKey {
    /// Generate a new random DEK
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut key);
        Self { key }
    }

    /// Create a DEK from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "DEK must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for DekKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DekKey(<redacted>)")
    }
}

/// Counter seed for AES-256-CTR
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Iv {
    bytes: [u8; IV_SIZE],
}

impl Iv {
    /// Generate a random IV
    pub fn generate() -> Self {
        let mut bytes = [0u8; IV_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut bytes);
        Self { bytes }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != IV_SIZE {
            return Err(CryptoError::InvalidIv(format!(
                "iv must be {} bytes, got {}",
                IV_SIZE,
                bytes.len()
            )));
        }
        let mut arr = [0u8; IV_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Get the IV bytes
    pub fn as_bytes(&self) -> &[u8; IV_SIZE] {
        &self.bytes
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.bytes)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(s)?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for Iv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Iv({})", self.to_base64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dek_generation_is_random() {
        let a = DekKey::generate();
        let b = DekKey::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_dek_rejects_wrong_length() {
        assert!(DekKey::from_bytes(&[0u8; 16]).is_err());
        assert!(DekKey::from_bytes(&[0u8; KEY_SIZE]).is_ok());
    }

    #[test]
    fn test_dek_debug_is_redacted() {
        let key = DekKey::from_bytes(&[0xAB; KEY_SIZE]).unwrap();
        let printed = format!("{:?}", key);
        assert!(!printed.contains("ab"));
        assert!(!printed.contains("171"));
    }

    #[test]
    fn test_iv_base64_roundtrip() {
        let iv = Iv::generate();
        let decoded = Iv::from_base64(&iv.to_base64()).unwrap();
        assert_eq!(iv, decoded);
    }

    #[test]
    fn test_iv_rejects_wrong_length() {
        assert!(matches!(
            Iv::from_bytes(&[0u8; 12]),
            Err(CryptoError::InvalidIv(_))
        ));
    }
}
