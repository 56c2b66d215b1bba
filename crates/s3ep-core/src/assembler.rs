//! Multipart completion
//!
//! Turns the client's logical part list into the physical part list the
//! backend expects, finalizes the upload and then attaches the encryption
//! metadata with a self-copy. S3 cannot set metadata at completion time, so
//! an object whose copy keeps failing is left in place and reported as
//! undecorated.

use crate::{
    CoreError, EngineConfig, Result,
    layout::{LayoutEntry, PartLayout},
    metadata::EncryptionMetadata,
    registry::{LogicalPart, MultipartRegistry, UploadSession},
};
use s3ep_backend::{normalize_etag, CompletedPart, Metadata, ObjectBackend};
use s3ep_crypto::Md5Hasher;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Result of a completed multipart upload
#[derive(Clone, Debug)]
pub struct CompletionOutcome {
    pub bucket: String,
    pub key: String,
    /// Multipart ETag over the plaintext part hashes (`<md5>-<n>`)
    pub etag: String,
    /// Plaintext length
    pub size: u64,
    /// Logical parts in the object
    pub parts: usize,
    /// Physical parts handed to the backend
    pub physical_parts: usize,
    /// False when the encryption metadata could not be attached
    pub metadata_attached: bool,
}

impl CompletionOutcome {
    /// The object exists but carries no key material
    pub fn undecorated(&self) -> bool {
        !self.metadata_attached
    }
}

/// Finalizes multipart uploads
pub struct CompletionAssembler {
    registry: Arc<MultipartRegistry>,
    backend: Arc<dyn ObjectBackend>,
    config: EngineConfig,
}

impl CompletionAssembler {
    pub fn new(registry: Arc<MultipartRegistry>, backend: Arc<dyn ObjectBackend>, config: EngineConfig) -> Self {
        Self {
            registry,
            backend,
            config,
        }
    }

    /// Complete an upload
    ///
    /// `requested` is the client's part list; `None` completes every
    /// recorded logical part. Validation failures leave the session open so
    /// the client can retry; once the backend has been asked to finalize the
    /// session is released whatever the result.
    #[instrument(skip(self, requested), fields(upload_id = %upload_id))]
    pub async fn complete(&self, upload_id: &str, requested: Option<&[CompletedPart]>) -> Result<CompletionOutcome> {
        let session = self.registry.complete(upload_id)?;
        let selected = select_parts(&session, requested)?;
        let physical = self.physical_parts(&session, &selected)?;

        if let Err(e) = self
            .backend
            .complete_multipart_upload(&session.bucket, &session.key, upload_id, &physical)
            .await
        {
            error!(bucket = %session.bucket, key = %session.key, error = %e, "Backend rejected multipart completion");
            self.registry.abort(upload_id);
            if let Err(abort_err) = self
                .backend
                .abort_multipart_upload(&session.bucket, &session.key, upload_id)
                .await
            {
                warn!(error = %abort_err, "Failed to abort backend upload after failed completion");
            }
            return Err(e.into());
        }

        let result = self.decorate(&session, &selected).await;
        self.registry.abort(upload_id);
        let (etag, size, metadata_attached) = result?;

        info!(
            bucket = %session.bucket,
            key = %session.key,
            parts = selected.len(),
            physical_parts = physical.len(),
            bytes = size,
            "Multipart upload completed"
        );
        Ok(CompletionOutcome {
            bucket: session.bucket,
            key: session.key,
            etag,
            size,
            parts: selected.len(),
            physical_parts: physical.len(),
            metadata_attached,
        })
    }

    /// Physical parts of the selected logical parts, ascending
    fn physical_parts(&self, session: &UploadSession, selected: &[LogicalPart]) -> Result<Vec<CompletedPart>> {
        let geometry = self.registry.geometry();
        let mut physical = Vec::new();
        for part in selected {
            let segments = session.part_etags_in(geometry.physical_block(part.part_number)?);
            if segments.is_empty() {
                return Err(CoreError::InvalidPart(format!(
                    "part {} has no uploaded data",
                    part.part_number
                )));
            }
            physical.extend(segments);
        }
        physical.sort_by_key(|p| p.part_number);
        Ok(physical)
    }

    /// Build and attach the encryption metadata; returns (etag, size, attached)
    async fn decorate(&self, session: &UploadSession, selected: &[LogicalPart]) -> Result<(String, u64, bool)> {
        let etag = multipart_etag(selected)?;
        let layout = PartLayout::new(
            selected
                .iter()
                .map(|p| LayoutEntry {
                    part_number: p.part_number,
                    generation: p.generation,
                    size: p.size,
                })
                .collect(),
        )?;
        let size = layout.total_size();
        let envelope = session.envelope();

        let encryption = EncryptionMetadata {
            provider_alias: envelope.provider_alias.clone(),
            kek_fingerprint: Some(envelope.kek_fingerprint.clone()),
            encrypted_dek: envelope.encrypted_dek.clone(),
            algorithm: envelope.algorithm,
            iv: envelope.iv,
            multipart: true,
            part_size: Some(self.registry.geometry().standard_part_size),
            layout: Some(layout),
            plaintext_length: size,
            plaintext_etag: Some(etag.clone()),
        };
        let mut metadata: Metadata = session.user_metadata.clone();
        metadata.extend(encryption.to_metadata(&self.config.metadata_prefix));

        let attached = match self.attach_metadata(session, &metadata).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    bucket = %session.bucket,
                    key = %session.key,
                    upload_id = %session.upload_id,
                    undecryptable = true,
                    error = %e,
                    "Completed object has no encryption metadata"
                );
                false
            }
        };
        Ok((etag, size, attached))
    }

    async fn attach_metadata(&self, session: &UploadSession, metadata: &Metadata) -> Result<()> {
        let mut attempt = 0;
        loop {
            let result = self
                .backend
                .replace_metadata(&session.bucket, &session.key, session.content_type.as_deref(), metadata)
                .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.attach_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "Retrying metadata attachment");
                    tokio::time::sleep(Duration::from_millis(self.config.retry_backoff_ms * u64::from(attempt))).await;
                }
                Err(e) => {
                    return Err(CoreError::MetadataAttachmentFailed {
                        bucket: session.bucket.clone(),
                        key: session.key.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    }
}

/// Resolve the client's part list against the recorded logical parts
fn select_parts(session: &UploadSession, requested: Option<&[CompletedPart]>) -> Result<Vec<LogicalPart>> {
    let recorded = session.logical_parts();
    let Some(requested) = requested else {
        if recorded.is_empty() {
            return Err(CoreError::InvalidPart("no parts have been uploaded".to_string()));
        }
        return Ok(recorded.values().cloned().collect());
    };

    if requested.is_empty() {
        return Err(CoreError::InvalidPart("no parts specified".to_string()));
    }
    if requested.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
        return Err(CoreError::InvalidPartOrder);
    }
    requested
        .iter()
        .map(|req| {
            let part = recorded.get(&req.part_number).ok_or_else(|| {
                CoreError::InvalidPart(format!("part {} was not uploaded", req.part_number))
            })?;
            if !req.etag.is_empty() && normalize_etag(&req.etag) != part.etag {
                return Err(CoreError::InvalidPart(format!(
                    "ETag mismatch for part {}",
                    req.part_number
                )));
            }
            Ok(part.clone())
        })
        .collect()
}

/// S3-style multipart ETag: MD5 over the concatenated part digests
pub fn multipart_etag(parts: &[LogicalPart]) -> Result<String> {
    let mut hasher = Md5Hasher::new();
    for part in parts {
        let digest = hex::decode(&part.etag)
            .map_err(|e| CoreError::InvalidPart(format!("part {} ETag: {}", part.part_number, e)))?;
        hasher.update(&digest);
    }
    Ok(format!("{}-{}", hasher.finalize_hex(), parts.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn part(part_number: u32, data: &[u8]) -> LogicalPart {
        LogicalPart {
            part_number,
            generation: 0,
            size: data.len() as u64,
            etag: s3ep_crypto::md5_hash(data),
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn test_multipart_etag_format() {
        let parts = vec![part(1, b"hello"), part(2, b"world")];
        let etag = multipart_etag(&parts).unwrap();
        assert!(etag.ends_with("-2"));
        assert_eq!(etag.len(), 32 + 2);

        let digest = |data: &[u8]| {
            let mut hasher = Md5Hasher::new();
            hasher.update(data);
            hasher.finalize_bytes()
        };
        let mut digests = digest(b"hello").to_vec();
        digests.extend_from_slice(&digest(b"world"));
        assert_eq!(etag, format!("{}-2", s3ep_crypto::md5_hash(&digests)));
    }

    #[test]
    fn test_multipart_etag_rejects_non_hex() {
        let mut bad = part(1, b"x");
        bad.etag = "not-hex".into();
        assert!(matches!(multipart_etag(&[bad]), Err(CoreError::InvalidPart(_))));
    }

    #[test]
    fn test_undecorated_flag() {
        let outcome = CompletionOutcome {
            bucket: "b".into(),
            key: "k".into(),
            etag: "e-1".into(),
            size: 1,
            parts: 1,
            physical_parts: 1,
            metadata_attached: false,
        };
        assert!(outcome.undecorated());
    }
}
