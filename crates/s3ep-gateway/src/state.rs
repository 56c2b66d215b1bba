//! Application state

use crate::config::GatewayConfig;
use crate::kms::build_providers;
use s3ep_backend::{MemoryBackend, ObjectBackend, S3Backend};
use s3ep_core::Engine;
use std::sync::Arc;
use tracing::{info, warn};

/// Application state shared across handlers
pub struct AppState {
    /// Gateway configuration
    pub config: GatewayConfig,
    /// Encryption engine in front of the backend
    pub engine: Arc<Engine>,
}

impl AppState {
    /// Create a new application state
    pub async fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let backend: Arc<dyn ObjectBackend> = if config.use_memory_store {
            warn!("Using in-memory backend (data will not persist)");
            Arc::new(MemoryBackend::new())
        } else {
            info!(endpoint = %config.backend.endpoint, region = %config.backend.region, "Using S3 backend");
            Arc::new(S3Backend::new(config.backend.clone())?)
        };

        Self::with_backend(config, backend)
    }

    /// Create state over an existing backend
    pub fn with_backend(config: GatewayConfig, backend: Arc<dyn ObjectBackend>) -> anyhow::Result<Self> {
        let providers = build_providers(&config.keys, config.default_provider.as_deref(), config.use_memory_store)?;
        let engine = Engine::new(config.engine.clone(), providers, backend)?;
        info!(
            default_provider = engine.keys().default_alias().unwrap_or("-"),
            segment_size = config.engine.segment_size,
            "Encryption engine ready"
        );
        Ok(Self {
            config,
            engine: Arc::new(engine),
        })
    }
}
