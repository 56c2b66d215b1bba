//! KEK providers backed by external key services
//!
//! [`VaultTransitKek`] wraps DEKs with HashiCorp Vault's transit engine; the
//! stored wrapped key is Vault's `vault:vN:...` ciphertext string.

use crate::config::KeyConfig;
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use s3ep_crypto::{sha256_hex, CryptoError, DekKey, KekProvider, LocalAesKek, ProviderRegistry};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Serialize)]
struct EncryptRequest<'a> {
    plaintext: &'a str,
}

#[derive(Serialize)]
struct DecryptRequest<'a> {
    ciphertext: &'a str,
}

/// Failure talking to Vault
enum TransitError {
    /// Vault could not be reached or is overloaded
    Unavailable(String),
    /// Vault answered but refused the request
    Rejected(String),
}

#[derive(Deserialize)]
struct TransitResponse<T> {
    data: T,
}

#[derive(Deserialize)]
struct EncryptData {
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptData {
    plaintext: String,
}

/// DEK wrapping through Vault transit `encrypt`/`decrypt`
pub struct VaultTransitKek {
    alias: String,
    address: String,
    token: String,
    key_name: String,
    mount: String,
    client: Client,
}

impl VaultTransitKek {
    pub fn new(
        alias: impl Into<String>,
        address: impl Into<String>,
        token: impl Into<String>,
        key_name: impl Into<String>,
        mount: impl Into<String>,
    ) -> s3ep_crypto::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CryptoError::Configuration(e.to_string()))?;
        Ok(Self {
            alias: alias.into(),
            address: address.into().trim_end_matches('/').to_string(),
            token: token.into(),
            key_name: key_name.into(),
            mount: mount.into(),
            client,
        })
    }

    fn url(&self, operation: &str) -> String {
        format!("{}/v1/{}/{}/{}", self.address, self.mount, operation, self.key_name)
    }

    async fn call<B: Serialize, T: DeserializeOwned>(
        &self,
        operation: &str,
        body: &B,
    ) -> std::result::Result<T, TransitError> {
        let response = self
            .client
            .post(self.url(operation))
            .header("X-Vault-Token", &self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| TransitError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let reason = format!("vault returned {}: {}", status, text.trim());
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(TransitError::Unavailable(reason));
            }
            return Err(TransitError::Rejected(reason));
        }
        let parsed: TransitResponse<T> = response
            .json()
            .await
            .map_err(|e| TransitError::Rejected(e.to_string()))?;
        Ok(parsed.data)
    }
}

#[async_trait]
impl KekProvider for VaultTransitKek {
    fn alias(&self) -> &str {
        &self.alias
    }

    fn kind(&self) -> &'static str {
        "vault"
    }

    fn fingerprint(&self) -> String {
        sha256_hex(format!("{}/{}/{}", self.address, self.mount, self.key_name).as_bytes())[..32].to_string()
    }

    async fn wrap(&self, dek: &DekKey) -> s3ep_crypto::Result<Vec<u8>> {
        let plaintext = base64::engine::general_purpose::STANDARD.encode(dek.as_bytes());
        let data: EncryptData = self
            .call("encrypt", &EncryptRequest { plaintext: &plaintext })
            .await
            .map_err(|e| match e {
                TransitError::Unavailable(reason) => {
                    CryptoError::ProviderUnavailable(format!("{}: {}", self.alias, reason))
                }
                TransitError::Rejected(reason) => CryptoError::WrapFailed {
                    alias: self.alias.clone(),
                    reason,
                },
            })?;
        debug!(alias = %self.alias, "Wrapped DEK with Vault transit");
        Ok(data.ciphertext.into_bytes())
    }

    async fn unwrap(&self, wrapped: &[u8]) -> s3ep_crypto::Result<DekKey> {
        let unwrap_failed = |reason: String| CryptoError::UnwrapFailed {
            alias: self.alias.clone(),
            reason,
        };
        let ciphertext = std::str::from_utf8(wrapped)
            .map_err(|_| unwrap_failed("wrapped key is not a Vault ciphertext".to_string()))?;
        let data: DecryptData = self
            .call("decrypt", &DecryptRequest { ciphertext })
            .await
            .map_err(|e| match e {
                TransitError::Unavailable(reason) => {
                    CryptoError::ProviderUnavailable(format!("{}: {}", self.alias, reason))
                }
                TransitError::Rejected(reason) => unwrap_failed(reason),
            })?;
        let bytes = base64::engine::general_purpose::STANDARD.decode(data.plaintext)?;
        DekKey::from_bytes(&bytes)
    }
}

/// Build the provider registry from configuration
///
/// With no keys configured an ephemeral local key is generated, but only
/// when `allow_ephemeral` is set (in-memory development mode).
pub fn build_providers(
    keys: &[KeyConfig],
    default_provider: Option<&str>,
    allow_ephemeral: bool,
) -> anyhow::Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    for key in keys {
        let provider: Arc<dyn KekProvider> = match key {
            KeyConfig::Local { alias, key } => Arc::new(LocalAesKek::from_base64(alias.clone(), key)?),
            KeyConfig::Vault {
                alias,
                address,
                token,
                key_name,
                mount,
            } => Arc::new(VaultTransitKek::new(
                alias.clone(),
                address.clone(),
                token.clone(),
                key_name.clone(),
                mount.clone(),
            )?),
        };
        info!(alias = provider.alias(), kind = provider.kind(), "KEK provider configured");
        registry.register(provider);
    }

    if registry.is_empty() {
        if !allow_ephemeral {
            anyhow::bail!("no KEK providers configured");
        }
        tracing::warn!("No KEK configured, using an ephemeral key; objects are unreadable after restart");
        registry.register(Arc::new(LocalAesKek::generate("ephemeral")));
    }
    if let Some(alias) = default_provider {
        registry.set_default(alias)?;
    }
    Ok(registry)
}
