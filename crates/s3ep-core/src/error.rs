//! Domain error taxonomy for the encryption orchestration layer.
//!
//! Every fallible operation in this crate returns [`Error`] rather than
//! `anyhow::Error` — callers (the HTTP request handler, in particular) match
//! on specific variants to decide status codes and retry semantics, so the
//! taxonomy is exhaustive and each variant carries the diagnostic payload
//! spec'd for it.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error(
        "no KEK provider registered for fingerprint {fingerprint:?} (algorithm {kek_algorithm:?}, object {object_key:?})"
    )]
    ProviderMissing {
        fingerprint: String,
        kek_algorithm: String,
        object_key: String,
    },

    #[error("unknown dek-algorithm {0:?}")]
    UnknownAlgorithm(String),

    #[error("required metadata field {0:?} is missing")]
    MetadataMissing(&'static str),

    #[error("metadata field {0:?} is not valid base64/utf-8")]
    MetadataCorrupt(&'static str),

    #[error("failed to derive HMAC key from DEK")]
    HMACKeyDerivation,

    #[error("expected HMAC is missing from metadata")]
    HMACMissing,

    #[error("HMAC verification failed")]
    HMACMismatch,

    #[error("multipart upload {0:?} already exists")]
    SessionExists(String),

    #[error("no multipart upload session {0:?}")]
    SessionNotFound(String),

    #[error("multipart upload {0:?} was aborted")]
    SessionAborted(String),

    #[error("multipart upload {0:?} expired after {1:?} of inactivity")]
    SessionExpired(String, Duration),

    #[error("multipart upload {0:?} was cleaned up after completion")]
    SessionCleaned(String),

    #[error("invalid part number {0} (must be 1..=10000)")]
    InvalidPartNumber(u32),

    #[error("ciphertext is empty")]
    EmptyCiphertext,

    #[error("object of {size} bytes exceeds the single-part buffering cap of {cap} bytes; use multipart upload")]
    ObjectTooLarge { size: u64, cap: u64 },

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
