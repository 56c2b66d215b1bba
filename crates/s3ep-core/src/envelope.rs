//! Envelope key management
//!
//! Creates a fresh DEK per object or upload, has it wrapped by the KEK
//! provider selected by alias, and unwraps stored DEKs on the read path.
//! Only the wrapped DEK, the IV seed and the algorithm id ever leave process
//! memory.

use crate::{CoreError, Result, registry::UploadSession};
use s3ep_crypto::{CtrCipher, DekKey, Iv, KekProvider, ProviderRegistry, StreamAlgorithm};
use std::sync::Arc;
use tracing::{debug, warn};

/// A freshly created DEK together with its wrapped form
#[derive(Clone)]
pub struct Envelope {
    pub dek: DekKey,
    pub iv: Iv,
    pub encrypted_dek: Vec<u8>,
    pub provider_alias: String,
    pub kek_fingerprint: String,
    pub algorithm: StreamAlgorithm,
}

impl Envelope {
    /// Cipher bound to this envelope's DEK and IV
    pub fn cipher(&self) -> CtrCipher {
        CtrCipher::new(&self.dek, &self.iv)
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("provider_alias", &self.provider_alias)
            .field("kek_fingerprint", &self.kek_fingerprint)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Creates, wraps and unwraps data encryption keys
pub struct EnvelopeKeyManager {
    providers: ProviderRegistry,
    algorithm: StreamAlgorithm,
}

impl EnvelopeKeyManager {
    pub fn new(providers: ProviderRegistry) -> Self {
        Self {
            providers,
            algorithm: StreamAlgorithm::default(),
        }
    }

    /// Alias used when a request does not name a provider
    pub fn default_alias(&self) -> Option<&str> {
        self.providers.default_alias()
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    fn provider(&self, alias: Option<&str>) -> Result<Arc<dyn KekProvider>> {
        let alias = alias
            .or_else(|| self.providers.default_alias())
            .ok_or_else(|| CoreError::ProviderUnavailable("no KEK provider configured".to_string()))?;
        self.providers
            .get(alias)
            .ok_or_else(|| CoreError::ProviderUnavailable(alias.to_string()))
    }

    /// Generate a DEK and IV and wrap the DEK with the selected provider
    pub async fn create_envelope(&self, alias: Option<&str>) -> Result<Envelope> {
        let provider = self.provider(alias)?;
        let dek = DekKey::generate();
        let encrypted_dek = provider.wrap(&dek).await.map_err(|e| match CoreError::from(e) {
            wrap @ CoreError::WrapFailed { .. } => wrap,
            other => CoreError::WrapFailed {
                alias: provider.alias().to_string(),
                reason: other.to_string(),
            },
        })?;

        debug!(alias = provider.alias(), kind = provider.kind(), "Created data encryption key");
        Ok(Envelope {
            dek,
            iv: Iv::generate(),
            encrypted_dek,
            provider_alias: provider.alias().to_string(),
            kek_fingerprint: provider.fingerprint(),
            algorithm: self.algorithm,
        })
    }

    /// Create an unregistered upload session with a freshly wrapped DEK
    pub async fn create_session(
        &self,
        upload_id: &str,
        key: &str,
        bucket: &str,
        alias: Option<&str>,
    ) -> Result<UploadSession> {
        let envelope = self.create_envelope(alias).await?;
        Ok(UploadSession::new(upload_id, bucket, key, envelope))
    }

    /// Recover a DEK from object metadata
    ///
    /// An alias with no registered provider, a provider whose KEK fingerprint
    /// differs from the one recorded at write time, or a provider that cannot
    /// authenticate the wrapped key all yield [`CoreError::KeyMissing`] so
    /// callers can report an undecryptable object instead of a generic
    /// failure.
    pub async fn unwrap_for_read(
        &self,
        encrypted_dek: &[u8],
        provider_alias: &str,
        kek_fingerprint: Option<&str>,
    ) -> Result<DekKey> {
        let provider = self.providers.get(provider_alias).ok_or_else(|| {
            warn!(alias = provider_alias, "No KEK provider for stored object");
            CoreError::KeyMissing(provider_alias.to_string())
        })?;

        if let Some(expected) = kek_fingerprint {
            let current = provider.fingerprint();
            if current != expected {
                warn!(
                    alias = provider_alias,
                    stored = expected,
                    current = %current,
                    "KEK for stored object has been replaced"
                );
                return Err(CoreError::KeyMissing(provider_alias.to_string()));
            }
        }

        Ok(provider.unwrap(encrypted_dek).await?)
    }
}
