//! In-memory object backend for testing and development

use crate::{
    BackendError, CompletedPart, Metadata, ObjectBackend, ObjectInfo, Result, StoredObject,
    normalize_etag,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use dashmap::DashMap;
use s3ep_crypto::hashing::{Md5Hasher, md5_hash};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    content_type: Option<String>,
    metadata: Metadata,
    parts: BTreeMap<u32, (String, Bytes)>,
}

/// An in-memory S3-like store
#[derive(Clone, Default)]
pub struct MemoryBackend {
    objects: Arc<DashMap<(String, String), StoredObject>>,
    uploads: Arc<DashMap<String, PendingUpload>>,
    next_upload: Arc<AtomicU64>,
    min_part_size: u64,
}

impl MemoryBackend {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Enforce a minimum size for every part except the last, like S3 does
    pub fn with_min_part_size(mut self, min_part_size: u64) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    /// Number of stored objects
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Number of multipart uploads in progress
    pub fn pending_upload_count(&self) -> usize {
        self.uploads.len()
    }

    /// Part numbers uploaded so far for a pending upload
    pub fn uploaded_part_numbers(&self, upload_id: &str) -> Vec<u32> {
        self.uploads
            .get(upload_id)
            .map(|u| u.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Raw stored bytes, bypassing the trait (for tests asserting on ciphertext)
    pub fn raw_object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    fn object_key(bucket: &str, key: &str) -> (String, String) {
        (bucket.to_string(), key.to_string())
    }

    fn not_found(bucket: &str, key: &str) -> BackendError {
        BackendError::NoSuchKey {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        metadata: &Metadata,
    ) -> Result<String> {
        let seq = self.next_upload.fetch_add(1, Ordering::Relaxed);
        let upload_id = format!("mem-{}-{}", seq, uuid::Uuid::new_v4().simple());
        self.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_type: content_type.map(str::to_string),
                metadata: metadata.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let mut upload = self
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| BackendError::NoSuchUpload(upload_id.to_string()))?;
        if upload.bucket != bucket || upload.key != key {
            return Err(BackendError::NoSuchUpload(upload_id.to_string()));
        }
        let etag = md5_hash(&data);
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String> {
        let (object, etag) = {
            let upload = self
                .uploads
                .get(upload_id)
                .ok_or_else(|| BackendError::NoSuchUpload(upload_id.to_string()))?;
            if upload.bucket != bucket || upload.key != key {
                return Err(BackendError::NoSuchUpload(upload_id.to_string()));
            }
            if parts.is_empty() {
                return Err(BackendError::InvalidPart("no parts specified".to_string()));
            }
            if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
                return Err(BackendError::InvalidPartOrder);
            }

            let mut body = BytesMut::new();
            let mut etag_hasher = Md5Hasher::new();
            for (i, part) in parts.iter().enumerate() {
                let (stored_etag, data) = upload.parts.get(&part.part_number).ok_or_else(|| {
                    BackendError::InvalidPart(format!("part {} was not uploaded", part.part_number))
                })?;
                if *stored_etag != normalize_etag(&part.etag) {
                    return Err(BackendError::InvalidPart(format!(
                        "ETag mismatch for part {}",
                        part.part_number
                    )));
                }
                let is_last = i + 1 == parts.len();
                if !is_last && (data.len() as u64) < self.min_part_size {
                    return Err(BackendError::EntityTooSmall {
                        part_number: part.part_number,
                        size: data.len() as u64,
                        min: self.min_part_size,
                    });
                }
                etag_hasher.update(&hex::decode(stored_etag).unwrap_or_default());
                body.extend_from_slice(data);
            }

            let etag = format!("{}-{}", etag_hasher.finalize_hex(), parts.len());
            let object = StoredObject {
                info: ObjectInfo {
                    size: body.len() as u64,
                    etag: etag.clone(),
                    content_type: upload.content_type.clone(),
                    last_modified: Utc::now(),
                    metadata: upload.metadata.clone(),
                },
                data: body.freeze(),
            };
            (object, etag)
        };

        self.uploads.remove(upload_id);
        self.objects.insert(Self::object_key(bucket, key), object);
        Ok(etag)
    }

    async fn abort_multipart_upload(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<()> {
        self.uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NoSuchUpload(upload_id.to_string()))
    }

    async fn replace_metadata(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
        metadata: &Metadata,
    ) -> Result<()> {
        let mut object = self
            .objects
            .get_mut(&Self::object_key(bucket, key))
            .ok_or_else(|| Self::not_found(bucket, key))?;
        object.info.metadata = metadata.clone();
        object.info.content_type = content_type.map(str::to_string);
        object.info.last_modified = Utc::now();
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
        metadata: &Metadata,
    ) -> Result<String> {
        let etag = md5_hash(&data);
        self.objects.insert(
            Self::object_key(bucket, key),
            StoredObject {
                info: ObjectInfo {
                    size: data.len() as u64,
                    etag: etag.clone(),
                    content_type: content_type.map(str::to_string),
                    last_modified: Utc::now(),
                    metadata: metadata.clone(),
                },
                data,
            },
        );
        Ok(etag)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        self.objects
            .get(&Self::object_key(bucket, key))
            .map(|o| o.value().clone())
            .ok_or_else(|| Self::not_found(bucket, key))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo> {
        self.objects
            .get(&Self::object_key(bucket, key))
            .map(|o| o.info.clone())
            .ok_or_else(|| Self::not_found(bucket, key))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects.remove(&Self::object_key(bucket, key));
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_object() {
        let store = MemoryBackend::new();
        let mut meta = Metadata::new();
        meta.insert("color".into(), "blue".into());

        let etag = store
            .put_object("b", "k", Bytes::from_static(b"hello"), Some("text/plain"), &meta)
            .await
            .unwrap();
        let obj = store.get_object("b", "k").await.unwrap();

        assert_eq!(obj.data.as_ref(), b"hello");
        assert_eq!(obj.info.etag, etag);
        assert_eq!(obj.info.metadata.get("color").map(String::as_str), Some("blue"));
        assert!(!store.is_persistent());
    }

    #[tokio::test]
    async fn test_missing_object() {
        let store = MemoryBackend::new();
        let err = store.get_object("b", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_multipart_lifecycle() {
        let store = MemoryBackend::new();
        let id = store.create_multipart_upload("b", "k", None, &Metadata::new()).await.unwrap();

        let e2 = store.upload_part("b", "k", &id, 2, Bytes::from_static(b"world")).await.unwrap();
        let e1 = store.upload_part("b", "k", &id, 1, Bytes::from_static(b"hello ")).await.unwrap();

        let etag = store
            .complete_multipart_upload("b", "k", &id, &[CompletedPart::new(1, e1), CompletedPart::new(2, e2)])
            .await
            .unwrap();
        assert!(etag.ends_with("-2"));
        assert_eq!(store.pending_upload_count(), 0);
        assert_eq!(store.raw_object("b", "k").unwrap().as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn test_complete_rejects_unsorted_parts() {
        let store = MemoryBackend::new();
        let id = store.create_multipart_upload("b", "k", None, &Metadata::new()).await.unwrap();
        let e1 = store.upload_part("b", "k", &id, 1, Bytes::from_static(b"a")).await.unwrap();
        let e2 = store.upload_part("b", "k", &id, 2, Bytes::from_static(b"b")).await.unwrap();

        let err = store
            .complete_multipart_upload("b", "k", &id, &[CompletedPart::new(2, e2), CompletedPart::new(1, e1)])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidPartOrder));
    }

    #[tokio::test]
    async fn test_min_part_size_applies_to_non_final_parts() {
        let store = MemoryBackend::new().with_min_part_size(4);
        let id = store.create_multipart_upload("b", "k", None, &Metadata::new()).await.unwrap();
        let e1 = store.upload_part("b", "k", &id, 1, Bytes::from_static(b"ab")).await.unwrap();
        let e2 = store.upload_part("b", "k", &id, 2, Bytes::from_static(b"c")).await.unwrap();

        let err = store
            .complete_multipart_upload("b", "k", &id, &[CompletedPart::new(1, e1), CompletedPart::new(2, e2)])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::EntityTooSmall { part_number: 1, .. }));
    }

    #[tokio::test]
    async fn test_replace_metadata() {
        let store = MemoryBackend::new();
        store.put_object("b", "k", Bytes::from_static(b"x"), None, &Metadata::new()).await.unwrap();

        let mut meta = Metadata::new();
        meta.insert("s3ep-multipart".into(), "true".into());
        store.replace_metadata("b", "k", Some("text/plain"), &meta).await.unwrap();

        let info = store.head_object("b", "k").await.unwrap();
        assert_eq!(info.metadata, meta);
        assert_eq!(info.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_abort_unknown_upload() {
        let store = MemoryBackend::new();
        assert!(store.abort_multipart_upload("b", "k", "nope").await.is_err());
    }
}
