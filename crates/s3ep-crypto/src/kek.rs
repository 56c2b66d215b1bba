//! Key Encryption Key (KEK) providers
//!
//! A KEK never touches object data; it only wraps and unwraps DEKs. Providers
//! are looked up by alias so that every stored object records which provider
//! can unwrap its DEK.

use crate::{CryptoError, Result, hashing::sha256_hex, keys::{DekKey, KEY_SIZE}};
use aes_gcm::{Aes256Gcm, KeyInit, aead::Aead};
use async_trait::async_trait;
use base64::Engine;
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use zeroize::Zeroize;

/// Size of the AES-GCM nonce prepended to locally wrapped keys
const WRAP_NONCE_SIZE: usize = 12;

/// Capability interface for DEK wrapping backends
#[async_trait]
pub trait KekProvider: Send + Sync {
    /// Alias this provider is registered under
    fn alias(&self) -> &str;

    /// Short provider kind, e.g. `local` or `vault`
    fn kind(&self) -> &'static str;

    /// Stable, non-secret identifier of the KEK in use
    fn fingerprint(&self) -> String;

    /// Wrap a plaintext DEK
    async fn wrap(&self, dek: &DekKey) -> Result<Vec<u8>>;

    /// Unwrap a previously wrapped DEK
    async fn unwrap(&self, wrapped: &[u8]) -> Result<DekKey>;
}

/// KEK held in process memory, wrapping with AES-256-GCM
pub struct LocalAesKek {
    alias: String,
    key: [u8; KEY_SIZE],
}

impl Drop for LocalAesKek {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl LocalAesKek {
    /// Create from raw key bytes
    pub fn new(alias: impl Into<String>, key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "KEK must be {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(key);
        Ok(Self {
            alias: alias.into(),
            key: arr,
        })
    }

    /// Create from a base64-encoded key
    pub fn from_base64(alias: impl Into<String>, encoded: &str) -> Result<Self> {
        let mut bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
        let kek = Self::new(alias, &bytes);
        bytes.zeroize();
        kek
    }

    /// Generate a random KEK (development and tests)
    pub fn generate(alias: impl Into<String>) -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut key);
        Self {
            alias: alias.into(),
            key,
        }
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }
}

#[async_trait]
impl KekProvider for LocalAesKek {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn kind(&self) -> &'static str {
        "local"
    }

    fn fingerprint(&self) -> String {
        sha256_hex(&self.key)[..32].to_string()
    }

    async fn wrap(&self, dek: &DekKey) -> Result<Vec<u8>> {
        let mut nonce = [0u8; WRAP_NONCE_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut nonce);

        let ciphertext = self
            .cipher()?
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), dek.as_bytes().as_slice())
            .map_err(|e| CryptoError::WrapFailed {
                alias: self.alias.clone(),
                reason: e.to_string(),
            })?;

        let mut wrapped = Vec::with_capacity(WRAP_NONCE_SIZE + ciphertext.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    async fn unwrap(&self, wrapped: &[u8]) -> Result<DekKey> {
        if wrapped.len() <= WRAP_NONCE_SIZE {
            return Err(CryptoError::UnwrapFailed {
                alias: self.alias.clone(),
                reason: format!("wrapped key too short ({} bytes)", wrapped.len()),
            });
        }
        let (nonce, ciphertext) = wrapped.split_at(WRAP_NONCE_SIZE);

        let mut plaintext = self
            .cipher()?
            .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                tracing::warn!(alias = %self.alias, "Wrapped DEK does not authenticate under the local KEK");
                CryptoError::KeyMissing(self.alias.clone())
            })?;

        let dek = DekKey::from_bytes(&plaintext);
        plaintext.zeroize();
        dek
    }
}

/// Alias-keyed set of KEK providers
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn KekProvider>>,
    default_alias: Option<String>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider; the first one registered becomes the default
    pub fn register(&mut self, provider: Arc<dyn KekProvider>) {
        let alias = provider.alias().to_string();
        tracing::debug!(alias = %alias, kind = provider.kind(), "Registering KEK provider");
        if self.default_alias.is_none() {
            self.default_alias = Some(alias.clone());
        }
        self.providers.insert(alias, provider);
    }

    /// Builder-style registration
    pub fn with_provider(mut self, provider: Arc<dyn KekProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Select the default provider alias
    pub fn set_default(&mut self, alias: &str) -> Result<()> {
        if !self.providers.contains_key(alias) {
            return Err(CryptoError::ProviderUnavailable(alias.to_string()));
        }
        self.default_alias = Some(alias.to_string());
        Ok(())
    }

    /// Alias used when the caller does not name one
    pub fn default_alias(&self) -> Option<&str> {
        self.default_alias.as_deref()
    }

    /// Look up a provider by alias
    pub fn get(&self, alias: &str) -> Option<Arc<dyn KekProvider>> {
        self.providers.get(alias).cloned()
    }

    /// Registered aliases in sorted order
    pub fn aliases(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Number of registered providers
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is registered
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
