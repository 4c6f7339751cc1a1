//! The pass-through sentinel provider. Callers normally never reach its
//! `wrap`/`unwrap` methods — [`crate::provider::ProviderRegistry::is_none_provider`]
//! lets the single-part pipeline, multipart manager, and orchestrator all
//! fast-path around encryption entirely — but the methods are implemented
//! as identity transforms so the trait contract still holds if something
//! does call through.

use std::sync::Arc;

use async_trait::async_trait;

use crate::dek::Dek;
use crate::error::Result;
use crate::provider::{EnvelopeContentType, EnvelopeEncryptor, KekProvider, NONE_PROVIDER_FINGERPRINT};
use crate::providers::envelope::GcmEnvelope;

pub struct NoneProvider;

#[async_trait]
impl KekProvider for NoneProvider {
    fn fingerprint(&self) -> &str {
        NONE_PROVIDER_FINGERPRINT
    }

    fn algorithm(&self) -> &str {
        "none"
    }

    async fn wrap(&self, dek: &Dek, _object_key: &str) -> Result<Vec<u8>> {
        Ok(dek.expose().to_vec())
    }

    async fn unwrap(&self, wrapped: &[u8], _object_key: &str) -> Result<Dek> {
        let n = 32.min(wrapped.len());
        let mut bytes = [0u8; 32];
        bytes[..n].copy_from_slice(&wrapped[..n]);
        Ok(Dek::from_bytes(bytes))
    }

    fn create_envelope(self: Arc<Self>, _content_type: EnvelopeContentType, metadata_prefix: &str) -> Arc<dyn EnvelopeEncryptor> {
        // Never exercised in practice: the orchestrator special-cases
        // `is_none_provider()` before any envelope would be created.
        let provider: Arc<dyn KekProvider> = self;
        Arc::new(GcmEnvelope::new(provider, metadata_prefix.to_string()))
    }
}
