//! The encryption engine
//!
//! [`Engine`] ties key management, the upload registry, the segmenter, the
//! completion assembler and the object path to one backend. The gateway only
//! talks to this type.

use crate::{
    CoreError, EngineConfig, Result,
    assembler::{CompletionAssembler, CompletionOutcome},
    decoder::{ChunkTransportDecoder, TransportHints},
    envelope::EnvelopeKeyManager,
    layout::PartGeometry,
    metadata::user_metadata,
    object::{DecryptedObject, ObjectService, ObjectView},
    registry::{LogicalPart, MultipartRegistry, UploadSession, UploadSummary},
    segmenter::{PartOutcome, StreamSegmenter},
};
use bytes::Bytes;
use futures::Stream;
use s3ep_backend::{CompletedPart, Metadata, ObjectBackend};
use s3ep_crypto::ProviderRegistry;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Parameters for starting a multipart upload
#[derive(Clone, Debug, Default)]
pub struct CreateUpload {
    pub content_type: Option<String>,
    pub user_metadata: Metadata,
    /// KEK provider alias; the default provider when unset
    pub provider_alias: Option<String>,
}

/// Encrypting front for one object backend
pub struct Engine {
    config: EngineConfig,
    keys: Arc<EnvelopeKeyManager>,
    registry: Arc<MultipartRegistry>,
    backend: Arc<dyn ObjectBackend>,
    segmenter: StreamSegmenter,
    assembler: CompletionAssembler,
    objects: ObjectService,
}

impl Engine {
    /// Build an engine; fails if the configuration is unusable
    pub fn new(config: EngineConfig, providers: ProviderRegistry, backend: Arc<dyn ObjectBackend>) -> Result<Self> {
        let geometry = PartGeometry::from_config(&config)?;
        if providers.is_empty() {
            return Err(CoreError::Configuration("at least one KEK provider is required".to_string()));
        }
        let keys = Arc::new(EnvelopeKeyManager::new(providers));
        let registry = Arc::new(MultipartRegistry::new(geometry));

        info!(
            standard_part_size = config.standard_part_size,
            segment_size = config.segment_size,
            segments_per_part = geometry.segments_per_part,
            max_part_number = geometry.max_logical_part(),
            persistent_backend = backend.is_persistent(),
            "Encryption engine ready"
        );
        Ok(Self {
            segmenter: StreamSegmenter::new(registry.clone(), backend.clone(), config.clone()),
            assembler: CompletionAssembler::new(registry.clone(), backend.clone(), config.clone()),
            objects: ObjectService::new(keys.clone(), backend.clone(), config.clone()),
            config,
            keys,
            registry,
            backend,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn keys(&self) -> &EnvelopeKeyManager {
        &self.keys
    }

    pub fn registry(&self) -> &MultipartRegistry {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    /// Start an encrypted multipart upload and return its id
    ///
    /// The backend upload id doubles as the session id. Client metadata under
    /// the engine's own prefix is dropped.
    #[instrument(skip(self, request))]
    pub async fn create_multipart_upload(&self, bucket: &str, key: &str, request: CreateUpload) -> Result<String> {
        let client_metadata = user_metadata(&self.config.metadata_prefix, &request.user_metadata);
        let upload_id = self
            .backend
            .create_multipart_upload(bucket, key, request.content_type.as_deref(), &client_metadata)
            .await?;

        let registered = match self
            .keys
            .create_session(&upload_id, key, bucket, request.provider_alias.as_deref())
            .await
        {
            Ok(session) => self.registry.create(
                session
                    .with_content_type(request.content_type)
                    .with_user_metadata(client_metadata),
            ),
            Err(e) => Err(e),
        };

        if let Err(e) = registered {
            warn!(upload_id = %upload_id, error = %e, "Could not register upload, aborting backend upload");
            self.registry.abort(&upload_id);
            if let Err(abort_err) = self.backend.abort_multipart_upload(bucket, key, &upload_id).await {
                warn!(upload_id = %upload_id, error = %abort_err, "Backend abort failed");
            }
            return Err(e);
        }

        info!(upload_id = %upload_id, "Multipart upload started");
        Ok(upload_id)
    }

    /// Decode, encrypt and store one client part
    pub async fn upload_part<S>(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: S,
        hints: TransportHints,
    ) -> Result<PartOutcome>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        self.session_for(bucket, key, upload_id)?;
        let decoded = ChunkTransportDecoder::new(body, hints).into_stream();
        self.segmenter.process_part(upload_id, part_number, decoded).await
    }

    /// Finalize an upload and attach its encryption metadata
    pub async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Option<&[CompletedPart]>,
    ) -> Result<CompletionOutcome> {
        self.session_for(bucket, key, upload_id)?;
        self.assembler.complete(upload_id, parts).await
    }

    /// Discard an upload: release the session and abort the backend upload
    #[instrument(skip(self))]
    pub async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.session_for(bucket, key, upload_id)?;
        self.registry.abort(upload_id);
        self.backend.abort_multipart_upload(bucket, key, upload_id).await?;
        info!("Multipart upload aborted");
        Ok(())
    }

    /// Completed parts of an upload, ascending
    pub fn list_parts(&self, bucket: &str, key: &str, upload_id: &str) -> Result<Vec<LogicalPart>> {
        self.session_for(bucket, key, upload_id)?;
        self.registry.list_parts(upload_id)
    }

    pub fn list_multipart_uploads(&self, bucket: &str) -> Vec<UploadSummary> {
        self.registry.list_uploads(Some(bucket))
    }

    /// Encrypt and store a whole object
    pub async fn put_object<S>(
        &self,
        bucket: &str,
        key: &str,
        body: S,
        hints: TransportHints,
        request: CreateUpload,
    ) -> Result<String>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let plaintext = ChunkTransportDecoder::new(body, hints).read_to_end().await?;
        self.objects
            .put_object(
                bucket,
                key,
                plaintext,
                request.content_type.as_deref(),
                &request.user_metadata,
                request.provider_alias.as_deref(),
            )
            .await
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<DecryptedObject> {
        self.objects.get_object(bucket, key).await
    }

    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectView> {
        self.objects.head_object(bucket, key).await
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects.delete_object(bucket, key).await
    }

    /// Abort uploads older than `max_age`; returns how many were removed
    pub async fn cleanup_expired(&self, max_age: Duration) -> usize {
        let expired = self.registry.cleanup_expired(max_age);
        for session in &expired {
            if let Err(e) = self
                .backend
                .abort_multipart_upload(&session.bucket, &session.key, &session.upload_id)
                .await
            {
                warn!(upload_id = %session.upload_id, error = %e, "Failed to abort expired backend upload");
            }
        }
        expired.len()
    }

    /// Session for an id, checked against the request's bucket and key
    fn session_for(&self, bucket: &str, key: &str, upload_id: &str) -> Result<UploadSession> {
        let session = self.registry.get_state(upload_id)?;
        if session.bucket != bucket || session.key != key {
            return Err(CoreError::SessionNotFound(upload_id.to_string()));
        }
        Ok(session)
    }
}
