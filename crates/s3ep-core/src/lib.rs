//! Encryption orchestration layer for an S3-compatible object-storage
//! encryption proxy.
//!
//! This crate selects between AES-256-GCM and AES-256-CTR+HMAC depending on
//! object size and upload kind, manages per-object key envelopes through a
//! pluggable [`provider::KekProvider`] registry, streams arbitrarily large
//! objects with bounded memory, and manages stateful multipart-upload
//! sessions with out-of-order part arrival. The HTTP/S3 request handler,
//! configuration loading, and the concrete KEK/AEAD primitive
//! implementations are external collaborators this crate only consumes
//! through traits.
//!
//! [`orchestrator::Orchestrator`] is the facade most callers want;
//! everything else is exposed for callers that need finer-grained control
//! or want to compose the pieces differently.

pub mod config;
pub mod ctr_cipher;
pub mod dek;
pub mod error;
pub mod hmac_engine;
pub mod metadata;
pub mod multipart;
pub mod orchestrator;
pub mod provider;
pub mod providers;
pub mod single_part;
pub mod stream_io;
pub mod streaming;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
