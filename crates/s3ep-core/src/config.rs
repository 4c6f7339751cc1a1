//! Recognized configuration. Loading this from a file, environment, or
//! CLI flags is an external collaborator's job — this is the plain data
//! type the embedding HTTP layer constructs and hands to
//! [`crate::orchestrator::Orchestrator::new`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hmac_engine::Mode;
use crate::metadata::DEFAULT_PREFIX;

pub const DEFAULT_STREAMING_THRESHOLD: u64 = 12 * 1024 * 1024;
pub const MIN_STREAMING_THRESHOLD: u64 = 5 * 1024 * 1024;
pub const DEFAULT_STREAMING_SEGMENT_SIZE: usize = 12 * 1024 * 1024;
pub const MIN_STREAMING_SEGMENT_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_MULTIPART_SESSION_MAX_AGE_SECS: u64 = 24 * 3600;
pub const DEFAULT_MULTIPART_CLEANUP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_MULTIPART_SESSION_MAX_AGE: Duration = Duration::from_secs(DEFAULT_MULTIPART_SESSION_MAX_AGE_SECS);
pub const DEFAULT_MULTIPART_CLEANUP_INTERVAL: Duration = Duration::from_secs(DEFAULT_MULTIPART_CLEANUP_INTERVAL_SECS);

/// One entry of `providers[]`: an alias, a provider type tag, and an
/// opaque config blob the concrete provider implementation interprets.
/// Constructing the actual [`crate::provider::KekProvider`] from this is an
/// external collaborator's job; `Orchestrator::new` takes already-
/// constructed providers alongside this descriptive list for `stats()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub alias: String,
    pub provider_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub integrity_verification: String,
    pub metadata_key_prefix: String,
    pub streaming_segment_size: usize,
    pub streaming_threshold: u64,
    pub multipart_session_max_age: Duration,
    pub multipart_session_cleanup_interval: Duration,
    pub providers: Vec<ProviderConfig>,
    pub active_provider_alias: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            integrity_verification: String::new(),
            metadata_key_prefix: DEFAULT_PREFIX.to_string(),
            streaming_segment_size: DEFAULT_STREAMING_SEGMENT_SIZE,
            streaming_threshold: DEFAULT_STREAMING_THRESHOLD,
            multipart_session_max_age: DEFAULT_MULTIPART_SESSION_MAX_AGE,
            multipart_session_cleanup_interval: DEFAULT_MULTIPART_CLEANUP_INTERVAL,
            providers: Vec::new(),
            active_provider_alias: String::new(),
        }
    }
}

impl Config {
    pub fn hmac_mode(&self) -> Result<Mode> {
        self.integrity_verification.parse()
    }

    pub fn validate(&self) -> Result<()> {
        self.hmac_mode()?;
        if self.streaming_segment_size < MIN_STREAMING_SEGMENT_SIZE {
            return Err(Error::ConfigInvalid(format!(
                "streamingSegmentSize must be >= {MIN_STREAMING_SEGMENT_SIZE} bytes, got {}",
                self.streaming_segment_size
            )));
        }
        if self.streaming_threshold < MIN_STREAMING_THRESHOLD {
            return Err(Error::ConfigInvalid(format!(
                "streamingThreshold must be >= {MIN_STREAMING_THRESHOLD} bytes, got {}",
                self.streaming_threshold
            )));
        }
        if self.metadata_key_prefix.is_empty() {
            return Err(Error::ConfigInvalid("metadataKeyPrefix must not be empty".into()));
        }
        Ok(())
    }
}
