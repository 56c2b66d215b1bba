//! # s3ep Gateway
//!
//! S3-compatible HTTP front end of the encrypting proxy.
//!
//! This crate provides:
//! - **S3 API**: multipart upload operations plus Put/Get/Head/DeleteObject
//! - **Envelope encryption**: every object is encrypted before it reaches the backend
//! - **Rate Limiting**: per-access-key request throttling
//! - **KEK providers**: local keys and HashiCorp Vault transit
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   HTTP Clients                      │
//! │           (boto3, AWS SDK, curl, etc.)              │
//! └─────────────────────────┬───────────────────────────┘
//!                           │
//! ┌─────────────────────────▼───────────────────────────┐
//! │                   s3ep Gateway                      │
//! ├─────────────────────────────────────────────────────┤
//! │  Request ID │ Rate Limiter │ Sub-resource dispatch  │
//! ├─────────────────────────────────────────────────────┤
//! │               S3 API Handlers                       │
//! ├─────────────────────────────────────────────────────┤
//! │                    s3ep-core                        │
//! │   (decoder, sessions, segmenter, assembler)         │
//! ├─────────────────────────────────────────────────────┤
//! │                  s3ep-backend                       │
//! │             (S3 SigV4 client, memory)               │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod kms;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;
pub mod xml;

pub use config::{GatewayConfig, KeyConfig};
pub use error::{ApiError, S3ErrorCode};
pub use kms::{build_providers, VaultTransitKek};
pub use server::{run_server, run_server_with_shutdown, serve};
pub use state::AppState;
