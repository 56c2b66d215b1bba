//! Segmenting re-encryption of logical parts
//!
//! One client part is read in `read_size` increments, each encrypted at the
//! counter `window + bytes_consumed`, and the ciphertext is re-cut into
//! `segment_size` physical parts. A segment is only cut once
//! `segment_size + min_segment_size` bytes are buffered, so the tail left for
//! the final flush never drops below the backend's minimum part size.

use crate::{
    CoreError, EngineConfig, Result,
    registry::{MultipartRegistry, PartReservation},
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use s3ep_backend::{CompletedPart, ObjectBackend};
use s3ep_crypto::Md5Hasher;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Result of uploading one logical part
#[derive(Clone, Debug)]
pub struct PartOutcome {
    pub part_number: u32,
    pub generation: u32,
    /// MD5 of the plaintext, returned to the client as the part ETag
    pub etag: String,
    /// Plaintext bytes consumed
    pub size: u64,
    /// Physical parts written, ascending
    pub segments: Vec<CompletedPart>,
}

/// Turns a decoded part body into encrypted physical parts
pub struct StreamSegmenter {
    registry: Arc<MultipartRegistry>,
    backend: Arc<dyn ObjectBackend>,
    config: EngineConfig,
}

struct PartWriter<'a> {
    reservation: &'a PartReservation,
    ciphertext: BytesMut,
    offset: u64,
    md5: Md5Hasher,
    segments: Vec<CompletedPart>,
}

impl StreamSegmenter {
    pub fn new(registry: Arc<MultipartRegistry>, backend: Arc<dyn ObjectBackend>, config: EngineConfig) -> Self {
        Self {
            registry,
            backend,
            config,
        }
    }

    /// Encrypt and upload one logical part
    ///
    /// On error the segments already uploaded stay recorded; the upload as a
    /// whole is discarded when the client aborts it. A re-upload that fails
    /// before its first segment lands leaves the earlier attempt in place.
    #[instrument(skip(self, body), fields(upload_id = %upload_id))]
    pub async fn process_part<S>(&self, upload_id: &str, part_number: u32, body: S) -> Result<PartOutcome>
    where
        S: Stream<Item = Result<Bytes>>,
    {
        let reservation = self.registry.reserve_part(upload_id, part_number)?;
        let read_size = self.config.read_size;
        futures::pin_mut!(body);

        let mut writer = PartWriter {
            reservation: &reservation,
            ciphertext: BytesMut::with_capacity(self.config.segment_size),
            offset: 0,
            md5: Md5Hasher::new(),
            segments: Vec::new(),
        };
        let mut pending = BytesMut::new();

        while let Some(chunk) = body.next().await {
            pending.extend_from_slice(&chunk?);
            while pending.len() >= read_size {
                let plaintext = pending.split_to(read_size);
                self.encrypt_increment(&mut writer, &plaintext)?;
                self.cut_full_segments(&mut writer).await?;
            }
        }
        if !pending.is_empty() {
            self.encrypt_increment(&mut writer, &pending)?;
            self.cut_full_segments(&mut writer).await?;
        }
        if !writer.ciphertext.is_empty() || writer.segments.is_empty() {
            let tail = writer.ciphertext.split().freeze();
            self.upload_segment(&mut writer, tail).await?;
        }

        let size = writer.offset;
        let etag = writer.md5.finalize_hex();
        let segments = writer.segments;
        self.registry.record_logical_part(&reservation, size, etag.clone())?;
        let delta = i64::try_from(size)
            .map_err(|_| CoreError::InvalidByteCount(format!("part size {} exceeds i64", size)))?;
        self.registry.update_total_bytes(upload_id, delta)?;

        info!(
            part_number,
            generation = reservation.generation,
            bytes = size,
            segments = segments.len(),
            "Encrypted part uploaded"
        );
        Ok(PartOutcome {
            part_number,
            generation: reservation.generation,
            etag,
            size,
            segments,
        })
    }

    fn encrypt_increment(&self, writer: &mut PartWriter<'_>, plaintext: &[u8]) -> Result<()> {
        let ciphertext = self
            .registry
            .encrypt_reserved(writer.reservation, writer.offset, plaintext)?;
        writer.md5.update(plaintext);
        writer.offset += plaintext.len() as u64;
        writer.ciphertext.extend_from_slice(&ciphertext);
        Ok(())
    }

    async fn cut_full_segments(&self, writer: &mut PartWriter<'_>) -> Result<()> {
        let threshold = self.config.segment_size + self.config.min_segment_size;
        while writer.ciphertext.len() >= threshold {
            let segment = writer.ciphertext.split_to(self.config.segment_size).freeze();
            self.upload_segment(writer, segment).await?;
        }
        Ok(())
    }

    /// Upload one segment, retrying transient failures with the same bytes
    async fn upload_segment(&self, writer: &mut PartWriter<'_>, data: Bytes) -> Result<()> {
        let reservation = writer.reservation;
        let index = u32::try_from(writer.segments.len()).unwrap_or(u32::MAX);
        let physical = reservation.physical_part(index)?;
        let len = data.len();

        let mut attempt = 0;
        let etag = loop {
            let result = self
                .backend
                .upload_part(
                    &reservation.bucket,
                    &reservation.key,
                    &reservation.upload_id,
                    physical,
                    data.clone(),
                )
                .await;
            match result {
                Ok(etag) => break etag,
                Err(e) if e.is_retryable() && attempt < self.config.upload_retries => {
                    attempt += 1;
                    warn!(physical_part = physical, attempt, error = %e, "Retrying segment upload");
                    tokio::time::sleep(Duration::from_millis(self.config.retry_backoff_ms * u64::from(attempt))).await;
                }
                Err(e) => {
                    return Err(CoreError::BackendUploadFailed {
                        part_number: physical,
                        source: e,
                    })
                }
            }
        };

        self.registry.record_segment(reservation, physical, etag.clone())?;
        debug!(physical_part = physical, bytes = len, "Segment uploaded");
        writer.segments.push(CompletedPart::new(physical, etag));
        Ok(())
    }
}
