//! Gateway configuration
//!
//! Values are layered: built-in defaults, then an optional config file, then
//! `S3EP_*` environment variables (`__` separates nested keys, e.g.
//! `S3EP_BACKEND__ENDPOINT`), then command-line flags applied by the binary.

use s3ep_backend::S3Config;
use s3ep_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One KEK provider
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum KeyConfig {
    /// AES-256 key held by the proxy (base64, 32 bytes)
    Local { alias: String, key: String },
    /// HashiCorp Vault transit engine
    Vault {
        alias: String,
        address: String,
        token: String,
        key_name: String,
        #[serde(default = "default_transit_mount")]
        mount: String,
    },
}

fn default_transit_mount() -> String {
    "transit".to_string()
}

impl KeyConfig {
    pub fn alias(&self) -> &str {
        match self {
            Self::Local { alias, .. } | Self::Vault { alias, .. } => alias,
        }
    }
}

impl std::fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local { alias, .. } => f.debug_struct("Local").field("alias", alias).finish_non_exhaustive(),
            Self::Vault {
                alias,
                address,
                key_name,
                mount,
                ..
            } => f
                .debug_struct("Vault")
                .field("alias", alias)
                .field("address", address)
                .field("key_name", key_name)
                .field("mount", mount)
                .finish_non_exhaustive(),
        }
    }
}

/// Gateway server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Backend S3 service
    pub backend: S3Config,
    /// Encryption engine sizing and retries
    pub engine: EngineConfig,
    /// KEK providers; the first is the default unless `default_provider` is set
    pub keys: Vec<KeyConfig>,
    pub default_provider: Option<String>,
    /// Use the in-memory backend (for testing/development)
    pub use_memory_store: bool,
    /// Rate limit (requests per second per client)
    pub rate_limit_rps: u32,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Multipart upload expiry (seconds)
    pub multipart_expiry_secs: u64,
    /// How often expired uploads are swept (seconds)
    pub cleanup_interval_secs: u64,
    /// Decode `Transfer-Encoding: chunked` framing in the engine. The HTTP
    /// server already strips it, so this is only for listeners that don't.
    pub decode_http_chunked: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            backend: S3Config::default(),
            engine: EngineConfig::default(),
            keys: Vec::new(),
            default_provider: None,
            use_memory_store: false,
            rate_limit_rps: 100,
            max_body_size: 5 * 1024 * 1024 * 1024, // 5 GB
            multipart_expiry_secs: 24 * 60 * 60,   // 24 hours
            cleanup_interval_secs: 15 * 60,
            decode_http_chunked: false,
        }
    }
}

impl GatewayConfig {
    /// Load defaults, an optional file and `S3EP_*` environment variables
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&GatewayConfig::default())?);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: GatewayConfig = builder
            .add_source(
                config::Environment::with_prefix("S3EP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot start with
    pub fn validate(&self) -> anyhow::Result<()> {
        self.engine.validate()?;
        if self.rate_limit_rps == 0 {
            anyhow::bail!("rate_limit_rps must be at least 1");
        }
        if let Some(default) = &self.default_provider {
            if !self.keys.iter().any(|k| k.alias() == default) {
                anyhow::bail!("default_provider {:?} is not among the configured keys", default);
            }
        }
        Ok(())
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
