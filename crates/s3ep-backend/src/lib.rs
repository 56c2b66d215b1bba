//! # s3ep Backend
//!
//! Storage backends sitting behind the s3ep encrypting proxy.
//!
//! This crate provides:
//! - **ObjectBackend trait**: the subset of the S3 API the proxy needs
//!   (multipart lifecycle, metadata-replacing self-copy, put/get/head/delete)
//! - **S3Backend**: an HTTP client for any S3-compatible service, signing
//!   requests with AWS Signature Version 4
//! - **MemoryBackend**: an in-process store for development and tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        s3ep-core (encryption engine)    │
//! ├─────────────────────────────────────────┤
//! │           ObjectBackend Trait           │
//! ├────────────────────┬────────────────────┤
//! │     S3Backend      │   MemoryBackend    │
//! ├────────────────────┴────────────────────┤
//! │   S3-compatible service  │  DashMap     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The backend only ever receives ciphertext.

pub mod error;
pub mod memory;
pub mod s3;
pub mod signing;

pub use error::{BackendError, Result};
pub use memory::MemoryBackend;
pub use s3::{S3Backend, S3Config};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Lowest valid multipart part number
pub const MIN_PART_NUMBER: u32 = 1;

/// Highest valid multipart part number
pub const MAX_PART_NUMBER: u32 = 10_000;

/// User metadata (keys without the `x-amz-meta-` prefix)
pub type Metadata = BTreeMap<String, String>;

/// A part reference submitted when finalizing a multipart upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    /// Part number (1-10000)
    pub part_number: u32,
    /// ETag returned by the backend for this part
    pub etag: String,
}

impl CompletedPart {
    /// Create a new completed part reference
    pub fn new(part_number: u32, etag: impl Into<String>) -> Self {
        Self {
            part_number,
            etag: etag.into(),
        }
    }
}

/// Object attributes as reported by the backend
#[derive(Clone, Debug)]
pub struct ObjectInfo {
    /// Stored (ciphertext) size in bytes
    pub size: u64,
    /// Backend ETag, unquoted
    pub etag: String,
    /// Content type
    pub content_type: Option<String>,
    /// Last modification time
    pub last_modified: DateTime<Utc>,
    /// User metadata
    pub metadata: Metadata,
}

/// An object body together with its attributes
#[derive(Clone, Debug)]
pub struct StoredObject {
    /// Object attributes
    pub info: ObjectInfo,
    /// Object body
    pub data: Bytes,
}

/// Trait for the object store the proxy writes ciphertext into
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Start a multipart upload and return the backend upload id
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        metadata: &Metadata,
    ) -> Result<String>;

    /// Upload one physical part and return its ETag
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String>;

    /// Finalize a multipart upload; `parts` must be in ascending order
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String>;

    /// Abort a multipart upload, discarding its parts
    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;

    /// Copy an object onto itself, replacing its metadata
    async fn replace_metadata(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        metadata: &Metadata,
    ) -> Result<()>;

    /// Store a whole object and return its ETag
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
        metadata: &Metadata,
    ) -> Result<String>;

    /// Retrieve an object
    async fn get_object(&self, bucket: &str, key: &str) -> Result<StoredObject>;

    /// Retrieve object attributes only
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo>;

    /// Delete an object
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Whether data survives a process restart
    fn is_persistent(&self) -> bool {
        true
    }
}

/// Check that a part number is within the S3 range
pub fn is_valid_part_number(part_number: u32) -> bool {
    (MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&part_number)
}

/// Strip surrounding quotes from an ETag
pub fn normalize_etag(etag: &str) -> String {
    etag.trim().trim_matches('"').to_string()
}
