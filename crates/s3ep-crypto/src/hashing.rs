//! Hashing utilities
//!
//! MD5 produces S3-compatible ETags; SHA-256 backs request signing and key
//! fingerprints.

use md5::{Digest, Md5};
use sha2::Sha256;

/// Calculate an MD5 hash (for S3 ETag compatibility)
pub fn md5_hash(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Calculate an MD5 hash incrementally
#[derive(Clone, Default)]
pub struct Md5Hasher {
    inner: Md5,
}

impl Md5Hasher {
    /// Create a new hasher
    pub fn new() -> Self {
        Self::default()
    }

    /// Update with more data
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize and get the hex-encoded hash
    pub fn finalize_hex(self) -> String {
        format!("{:x}", self.inner.finalize())
    }

    /// Finalize and get the raw digest
    pub fn finalize_bytes(self) -> [u8; 16] {
        self.inner.finalize().into()
    }
}

/// Calculate a hex-encoded SHA-256 hash
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_hash() {
        assert_eq!(md5_hash(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hash(b"hello").len(), 32);
    }

    #[test]
    fn test_incremental_md5_matches_oneshot() {
        let mut hasher = Md5Hasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize_hex(), md5_hash(b"hello world"));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
