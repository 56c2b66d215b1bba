//! Encryption metadata stored alongside each object
//!
//! All keys share a configurable prefix (default `s3ep-`) and end up as
//! `x-amz-meta-<prefix><name>` headers on the backend object.

use crate::{CoreError, Result, layout::PartLayout};
use base64::Engine;
use s3ep_backend::Metadata;
use s3ep_crypto::{Iv, StreamAlgorithm};

pub const ENCRYPTED_DEK: &str = "encrypted-dek";
pub const DEK_ALGORITHM: &str = "dek-algorithm";
pub const AES_IV: &str = "aes-iv";
pub const PROVIDER_ALIAS: &str = "provider-alias";
pub const KEK_FINGERPRINT: &str = "kek-fingerprint";
pub const MULTIPART: &str = "multipart";
pub const PART_SIZE: &str = "part-size";
pub const PART_LAYOUT: &str = "part-layout";
pub const PLAINTEXT_LENGTH: &str = "plaintext-length";
pub const PLAINTEXT_ETAG: &str = "etag";

/// Response header set when the encryption metadata could not be attached
pub const UNDECORATED_HEADER: &str = "x-amz-meta-s3ep-undecorated";

/// Everything a reader needs to decrypt an object
#[derive(Clone, Debug, PartialEq)]
pub struct EncryptionMetadata {
    pub provider_alias: String,
    pub kek_fingerprint: Option<String>,
    pub encrypted_dek: Vec<u8>,
    pub algorithm: StreamAlgorithm,
    pub iv: Iv,
    pub multipart: bool,
    /// Counter window per logical part (multipart only)
    pub part_size: Option<u64>,
    pub layout: Option<PartLayout>,
    pub plaintext_length: u64,
    /// ETag reported to clients
    pub plaintext_etag: Option<String>,
}

impl EncryptionMetadata {
    /// Render as prefixed metadata entries
    pub fn to_metadata(&self, prefix: &str) -> Metadata {
        let key = |name: &str| format!("{}{}", prefix, name);
        let mut meta = Metadata::new();

        meta.insert(
            key(ENCRYPTED_DEK),
            base64::engine::general_purpose::STANDARD.encode(&self.encrypted_dek),
        );
        meta.insert(key(DEK_ALGORITHM), self.algorithm.algorithm_id().to_string());
        meta.insert(key(AES_IV), self.iv.to_base64());
        meta.insert(key(PROVIDER_ALIAS), self.provider_alias.clone());
        if let Some(fp) = &self.kek_fingerprint {
            meta.insert(key(KEK_FINGERPRINT), fp.clone());
        }
        meta.insert(key(MULTIPART), self.multipart.to_string());
        if let Some(part_size) = self.part_size {
            meta.insert(key(PART_SIZE), part_size.to_string());
        }
        if let Some(layout) = &self.layout {
            meta.insert(key(PART_LAYOUT), layout.to_string());
        }
        meta.insert(key(PLAINTEXT_LENGTH), self.plaintext_length.to_string());
        if let Some(etag) = &self.plaintext_etag {
            meta.insert(key(PLAINTEXT_ETAG), etag.clone());
        }
        meta
    }

    /// Parse from object metadata; `None` when the object is not encrypted
    pub fn from_metadata(prefix: &str, meta: &Metadata) -> Result<Option<Self>> {
        let get = |name: &str| meta.get(&format!("{}{}", prefix, name)).map(String::as_str);
        let require = |name: &str| {
            get(name).ok_or_else(|| CoreError::InvalidMetadata(format!("missing {}{}", prefix, name)))
        };
        let invalid = |name: &str, e: &dyn std::fmt::Display| {
            CoreError::InvalidMetadata(format!("{}{}: {}", prefix, name, e))
        };

        let Some(encrypted_dek) = get(ENCRYPTED_DEK) else {
            return Ok(None);
        };
        let encrypted_dek = base64::engine::general_purpose::STANDARD
            .decode(encrypted_dek)
            .map_err(|e| invalid(ENCRYPTED_DEK, &e))?;
        let algorithm = StreamAlgorithm::from_id(require(DEK_ALGORITHM)?)
            .map_err(|e| invalid(DEK_ALGORITHM, &e))?;
        let iv = Iv::from_base64(require(AES_IV)?).map_err(|e| invalid(AES_IV, &e))?;
        let multipart = match get(MULTIPART) {
            Some(v) => v.parse().map_err(|e| invalid(MULTIPART, &e))?,
            None => false,
        };
        let part_size = get(PART_SIZE)
            .map(|v| v.parse::<u64>().map_err(|e| invalid(PART_SIZE, &e)))
            .transpose()?;
        let layout = get(PART_LAYOUT).map(str::parse::<PartLayout>).transpose()?;
        let plaintext_length = get(PLAINTEXT_LENGTH)
            .map(|v| v.parse::<u64>().map_err(|e| invalid(PLAINTEXT_LENGTH, &e)))
            .transpose()?
            .or_else(|| layout.as_ref().map(PartLayout::total_size))
            .unwrap_or_default();

        if multipart && (part_size.is_none() || layout.is_none()) {
            return Err(CoreError::InvalidMetadata(
                "multipart object without part size or layout".to_string(),
            ));
        }

        Ok(Some(Self {
            provider_alias: require(PROVIDER_ALIAS)?.to_string(),
            kek_fingerprint: get(KEK_FINGERPRINT).map(str::to_string),
            encrypted_dek,
            algorithm,
            iv,
            multipart,
            part_size,
            layout,
            plaintext_length,
            plaintext_etag: get(PLAINTEXT_ETAG).map(str::to_string),
        }))
    }
}

/// Metadata without the engine's own entries, as shown to clients
pub fn user_metadata(prefix: &str, meta: &Metadata) -> Metadata {
    meta.iter()
        .filter(|(k, _)| !k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutEntry;

    fn sample(multipart: bool) -> EncryptionMetadata {
        EncryptionMetadata {
            provider_alias: "default".into(),
            kek_fingerprint: Some("abcd".into()),
            encrypted_dek: vec![1, 2, 3, 4],
            algorithm: StreamAlgorithm::Aes256Ctr,
            iv: Iv::generate(),
            multipart,
            part_size: multipart.then_some(1024),
            layout: multipart.then(|| {
                PartLayout::new(vec![LayoutEntry {
                    part_number: 1,
                    generation: 0,
                    size: 10,
                }])
                .unwrap()
            }),
            plaintext_length: 10,
            plaintext_etag: Some("etag-1".into()),
        }
    }

    #[test]
    fn test_metadata_keys_use_prefix() {
        let meta = sample(true).to_metadata("s3ep-");
        assert_eq!(meta.get("s3ep-dek-algorithm").map(String::as_str), Some("AES-256-CTR"));
        assert_eq!(meta.get("s3ep-multipart").map(String::as_str), Some("true"));
        assert_eq!(meta.get("s3ep-part-layout").map(String::as_str), Some("1:10"));
        assert_eq!(meta.get("s3ep-encrypted-dek").map(String::as_str), Some("AQIDBA=="));
    }

    #[test]
    fn test_parse_back() {
        for multipart in [false, true] {
            let original = sample(multipart);
            let parsed = EncryptionMetadata::from_metadata("s3ep-", &original.to_metadata("s3ep-"))
                .unwrap()
                .unwrap();
            assert_eq!(parsed, original);
        }
    }

    #[test]
    fn test_plain_object_has_no_encryption_metadata() {
        let mut meta = Metadata::new();
        meta.insert("color".into(), "blue".into());
        assert!(EncryptionMetadata::from_metadata("s3ep-", &meta).unwrap().is_none());
    }

    #[test]
    fn test_multipart_without_layout_is_rejected() {
        let mut meta = sample(true).to_metadata("s3ep-");
        meta.remove("s3ep-part-layout");
        assert!(matches!(
            EncryptionMetadata::from_metadata("s3ep-", &meta),
            Err(CoreError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_user_metadata_strips_internal_entries() {
        let mut meta = sample(false).to_metadata("s3ep-");
        meta.insert("owner".into(), "alice".into());
        let user = user_metadata("s3ep-", &meta);
        assert_eq!(user.len(), 1);
        assert!(user.contains_key("owner"));
    }
}
