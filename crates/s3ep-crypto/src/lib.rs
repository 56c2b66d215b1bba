//! # s3ep Crypto
//!
//! Cryptographic primitives for the s3ep encrypting object-storage proxy.
//!
//! This crate provides:
//! - **Stream cipher**: AES-256-CTR with random-access keystream positioning,
//!   so any byte of an object can be encrypted from its byte offset alone
//! - **Key material**: Data Encryption Keys and IV seeds that zeroize on drop
//! - **KEK providers**: a capability trait for wrapping/unwrapping DEKs, a
//!   local AES-256-GCM implementation and an alias-keyed registry
//! - **Hashing**: MD5 (S3 ETags) and SHA-256 helpers
//!
//! ## Envelope model
//!
//! ```text
//!   plaintext ──AES-256-CTR(DEK, IV, offset)──▶ ciphertext   (stored in backend)
//!   DEK ──KEK provider wrap──▶ encrypted DEK                 (stored as metadata)
//! ```
//!
//! The unwrapped DEK only ever lives in process memory.

pub mod cipher;
pub mod error;
pub mod hashing;
pub mod kek;
pub mod keys;

pub use cipher::{CtrCipher, StreamAlgorithm};
pub use error::{CryptoError, Result};
pub use hashing::{md5_hash, sha256_hex, Md5Hasher};
pub use kek::{KekProvider, LocalAesKek, ProviderRegistry};
pub use keys::{DekKey, Iv, IV_SIZE, KEY_SIZE};
