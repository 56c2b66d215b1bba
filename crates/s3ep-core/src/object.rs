//! Single-object writes and decrypting reads
//!
//! Single objects are encrypted from counter 0. Multipart objects are
//! decrypted part by part, each at the counter window recorded in its
//! layout entry. Objects without encryption metadata pass through untouched.

use crate::{
    CoreError, EngineConfig, Result,
    envelope::EnvelopeKeyManager,
    layout::counter_window,
    metadata::{user_metadata, EncryptionMetadata},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use s3ep_backend::{Metadata, ObjectBackend, ObjectInfo};
use s3ep_crypto::{md5_hash, CtrCipher};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Plaintext view of a stored object
#[derive(Clone, Debug)]
pub struct ObjectView {
    /// Plaintext length
    pub size: u64,
    /// ETag as the client saw it at upload time
    pub etag: String,
    pub content_type: Option<String>,
    pub last_modified: DateTime<Utc>,
    /// User metadata without the engine's own entries
    pub metadata: Metadata,
    pub encrypted: bool,
}

/// A decrypted object body with its attributes
#[derive(Clone, Debug)]
pub struct DecryptedObject {
    pub view: ObjectView,
    pub data: Bytes,
}

/// Whole-object operations
pub struct ObjectService {
    keys: Arc<EnvelopeKeyManager>,
    backend: Arc<dyn ObjectBackend>,
    config: EngineConfig,
}

impl ObjectService {
    pub fn new(keys: Arc<EnvelopeKeyManager>, backend: Arc<dyn ObjectBackend>, config: EngineConfig) -> Self {
        Self { keys, backend, config }
    }

    /// Encrypt and store a whole object, returning the plaintext MD5 ETag
    #[instrument(skip(self, plaintext, user_meta), fields(bytes = plaintext.len()))]
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        plaintext: Bytes,
        content_type: Option<&str>,
        user_meta: &Metadata,
        provider_alias: Option<&str>,
    ) -> Result<String> {
        let envelope = self.keys.create_envelope(provider_alias).await?;
        let ciphertext = envelope.cipher().encrypt_at(0, &plaintext)?;
        let etag = md5_hash(&plaintext);

        let encryption = EncryptionMetadata {
            provider_alias: envelope.provider_alias.clone(),
            kek_fingerprint: Some(envelope.kek_fingerprint.clone()),
            encrypted_dek: envelope.encrypted_dek.clone(),
            algorithm: envelope.algorithm,
            iv: envelope.iv,
            multipart: false,
            part_size: None,
            layout: None,
            plaintext_length: plaintext.len() as u64,
            plaintext_etag: Some(etag.clone()),
        };
        let mut metadata = user_metadata(&self.config.metadata_prefix, user_meta);
        metadata.extend(encryption.to_metadata(&self.config.metadata_prefix));

        self.backend
            .put_object(bucket, key, Bytes::from(ciphertext), content_type, &metadata)
            .await?;
        debug!(bucket, key, alias = %envelope.provider_alias, "Stored encrypted object");
        Ok(etag)
    }

    /// Fetch and decrypt an object
    #[instrument(skip(self))]
    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<DecryptedObject> {
        let stored = self.backend.get_object(bucket, key).await?;
        let encryption = EncryptionMetadata::from_metadata(&self.config.metadata_prefix, &stored.info.metadata)?;
        let view = self.view(&stored.info, encryption.as_ref());

        let Some(encryption) = encryption else {
            return Ok(DecryptedObject {
                view,
                data: stored.data,
            });
        };
        let data = self.decrypt(&encryption, &stored.data).await?;
        Ok(DecryptedObject {
            view,
            data: Bytes::from(data),
        })
    }

    /// Object attributes as a client sees them
    #[instrument(skip(self))]
    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectView> {
        let info = self.backend.head_object(bucket, key).await?;
        let encryption = EncryptionMetadata::from_metadata(&self.config.metadata_prefix, &info.metadata)?;
        Ok(self.view(&info, encryption.as_ref()))
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        Ok(self.backend.delete_object(bucket, key).await?)
    }

    /// Decrypt a stored body using its encryption metadata
    pub async fn decrypt(&self, encryption: &EncryptionMetadata, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let dek = self
            .keys
            .unwrap_for_read(
                &encryption.encrypted_dek,
                &encryption.provider_alias,
                encryption.kek_fingerprint.as_deref(),
            )
            .await?;
        let cipher = CtrCipher::new(&dek, &encryption.iv);

        let (Some(layout), Some(part_size)) = (&encryption.layout, encryption.part_size) else {
            if encryption.multipart {
                return Err(CoreError::InvalidMetadata("multipart object without layout".to_string()));
            }
            return Ok(cipher.decrypt_at(0, ciphertext)?);
        };

        if layout.total_size() != ciphertext.len() as u64 {
            return Err(CoreError::InvalidMetadata(format!(
                "layout describes {} bytes but the object holds {}",
                layout.total_size(),
                ciphertext.len()
            )));
        }
        let mut plaintext = Vec::with_capacity(ciphertext.len());
        let mut pos = 0usize;
        for entry in layout.entries() {
            let len = usize::try_from(entry.size)
                .map_err(|_| CoreError::InvalidMetadata(format!("part {} too large", entry.part_number)))?;
            let base = counter_window(part_size, entry.part_number, entry.generation)?;
            plaintext.extend_from_slice(&cipher.decrypt_at(base, &ciphertext[pos..pos + len])?);
            pos += len;
        }
        Ok(plaintext)
    }

    fn view(&self, info: &ObjectInfo, encryption: Option<&EncryptionMetadata>) -> ObjectView {
        let (size, etag) = match encryption {
            Some(e) => (
                e.plaintext_length,
                e.plaintext_etag.clone().unwrap_or_else(|| info.etag.clone()),
            ),
            None => (info.size, info.etag.clone()),
        };
        ObjectView {
            size,
            etag,
            content_type: info.content_type.clone(),
            last_modified: info.last_modified,
            metadata: user_metadata(&self.config.metadata_prefix, &info.metadata),
            encrypted: encryption.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s3ep_backend::MemoryBackend;
    use s3ep_crypto::{LocalAesKek, ProviderRegistry};

    fn service() -> (ObjectService, MemoryBackend) {
        let backend = MemoryBackend::new();
        let keys = EnvelopeKeyManager::new(
            ProviderRegistry::new().with_provider(Arc::new(LocalAesKek::generate("default"))),
        );
        let service = ObjectService::new(Arc::new(keys), Arc::new(backend.clone()), EngineConfig::default());
        (service, backend)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (service, backend) = service();
        let mut meta = Metadata::new();
        meta.insert("owner".into(), "alice".into());

        let etag = service
            .put_object("b", "k", Bytes::from_static(b"secret text"), Some("text/plain"), &meta, None)
            .await
            .unwrap();
        assert_eq!(etag, md5_hash(b"secret text"));
        assert_ne!(backend.raw_object("b", "k").unwrap().as_ref(), b"secret text");

        let object = service.get_object("b", "k").await.unwrap();
        assert_eq!(object.data.as_ref(), b"secret text");
        assert!(object.view.encrypted);
        assert_eq!(object.view.etag, etag);
        assert_eq!(object.view.size, 11);
        assert_eq!(object.view.metadata, meta);
        assert_eq!(object.view.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_plain_object_passes_through() {
        let (service, backend) = service();
        backend
            .put_object("b", "plain", Bytes::from_static(b"as is"), None, &Metadata::new())
            .await
            .unwrap();

        let object = service.get_object("b", "plain").await.unwrap();
        assert_eq!(object.data.as_ref(), b"as is");
        assert!(!object.view.encrypted);
    }

    #[tokio::test]
    async fn test_head_reports_plaintext_size() {
        let (service, _) = service();
        service
            .put_object("b", "k", Bytes::from_static(b"0123456789"), None, &Metadata::new(), None)
            .await
            .unwrap();
        let view = service.head_object("b", "k").await.unwrap();
        assert_eq!(view.size, 10);
        assert!(view.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_material_is_reported() {
        let (service, backend) = service();
        service
            .put_object("b", "k", Bytes::from_static(b"data"), None, &Metadata::new(), None)
            .await
            .unwrap();

        let other = ObjectService::new(
            Arc::new(EnvelopeKeyManager::new(
                ProviderRegistry::new().with_provider(Arc::new(LocalAesKek::generate("other"))),
            )),
            Arc::new(backend),
            EngineConfig::default(),
        );
        let err = other.get_object("b", "k").await.unwrap_err();
        assert!(matches!(err, CoreError::KeyMissing(ref a) if a == "default"));
    }

    #[tokio::test]
    async fn test_rotated_kek_under_same_alias_is_key_missing() {
        let (service, backend) = service();
        service
            .put_object("b", "k", Bytes::from_static(b"data"), None, &Metadata::new(), None)
            .await
            .unwrap();

        let rotated = ObjectService::new(
            Arc::new(EnvelopeKeyManager::new(
                ProviderRegistry::new().with_provider(Arc::new(LocalAesKek::generate("default"))),
            )),
            Arc::new(backend),
            EngineConfig::default(),
        );
        let err = rotated.get_object("b", "k").await.unwrap_err();
        assert!(matches!(err, CoreError::KeyMissing(ref a) if a == "default"));
    }

    #[tokio::test]
    async fn test_missing_object() {
        let (service, _) = service();
        let err = service.get_object("b", "nope").await.unwrap_err();
        assert!(matches!(err, CoreError::Backend(ref e) if e.is_not_found()));
    }
}
