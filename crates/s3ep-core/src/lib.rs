//! # s3ep Core
//!
//! Streaming envelope-encryption engine for the s3ep proxy.
//!
//! This crate provides:
//! - **Transport decoding**: strips AWS SigV4 streaming (and optionally HTTP
//!   chunked) framing from request bodies as they arrive
//! - **Envelope keys**: one DEK per object or upload, wrapped by a named KEK
//!   provider
//! - **Multipart registry**: per-upload sessions with counter windows and
//!   physical part blocks reserved per logical part
//! - **Segmenter**: re-encrypts each client part and re-cuts it into
//!   backend-sized physical parts
//! - **Assembler**: finalizes uploads and attaches encryption metadata
//!
//! ## Data flow
//!
//! ```text
//! ┌──────────────┐   ┌─────────────────┐   ┌──────────────┐   ┌─────────┐
//! │ client body  │──▶│ ChunkTransport  │──▶│ StreamSeg-   │──▶│ backend │
//! │ (aws-chunked)│   │ Decoder         │   │ menter (CTR) │   │ parts   │
//! └──────────────┘   └─────────────────┘   └──────────────┘   └─────────┘
//!                                                │
//!                                  MultipartRegistry (windows, ETags)
//!                                                │
//!                                     CompletionAssembler ──▶ metadata copy
//! ```
//!
//! Logical part `n` (generation `g`) encrypts its bytes at counters starting
//! at `((g * 10000) + n - 1) * standard_part_size` and writes physical parts
//! `(n-1)*S+1 ..= n*S`, where `S = ceil(standard_part_size / segment_size)`.
//! Parts may therefore arrive in any order and in parallel.

pub mod assembler;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod layout;
pub mod metadata;
pub mod object;
pub mod registry;
pub mod segmenter;

pub use assembler::{CompletionAssembler, CompletionOutcome};
pub use config::EngineConfig;
pub use decoder::{ChunkTransportDecoder, Framing, TransportHints};
pub use engine::{CreateUpload, Engine};
pub use envelope::{Envelope, EnvelopeKeyManager};
pub use error::{CoreError, Result};
pub use layout::{counter_window, LayoutEntry, PartGeometry, PartLayout};
pub use metadata::{EncryptionMetadata, UNDECORATED_HEADER};
pub use object::{DecryptedObject, ObjectService, ObjectView};
pub use registry::{LogicalPart, MultipartRegistry, PartReservation, UploadSession, UploadSummary};
pub use segmenter::{PartOutcome, StreamSegmenter};
