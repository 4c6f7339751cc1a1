//! Local AES-256-GCM key-wrap provider: `Aes256Gcm::new_from_slice(kek)`,
//! a random 96-bit nonce prepended to the ciphertext, `object_key` folded
//! in as AAD so a wrapped DEK can't be replayed against a different key.

use std::sync::Arc;

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use rand::RngCore;

use crate::dek::Dek;
use crate::error::{Error, Result};
use crate::provider::{EnvelopeContentType, EnvelopeEncryptor, KekProvider};
use crate::providers::envelope::GcmEnvelope;

const NONCE_LEN: usize = 12;

pub struct AesWrapProvider {
    kek: [u8; 32],
    fingerprint: String,
}

impl AesWrapProvider {
    pub fn new(kek: [u8; 32], fingerprint: impl Into<String>) -> Self {
        Self { kek, fingerprint: fingerprint.into() }
    }

    /// Derive a stable fingerprint for a KEK: first 8 bytes of a BLAKE3
    /// hash, hex-encoded.
    pub fn fingerprint_for_kek(kek: &[u8; 32]) -> String {
        let hash = blake3::hash(kek);
        hex::encode(&hash.as_bytes()[..8])
    }
}

#[async_trait]
impl KekProvider for AesWrapProvider {
    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn algorithm(&self) -> &str {
        "aes-wrap"
    }

    async fn wrap(&self, dek: &Dek, object_key: &str) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.kek).map_err(|_| Error::ConfigInvalid("invalid KEK length".into()))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ct = cipher
            .encrypt(nonce, Payload { msg: dek.expose(), aad: object_key.as_bytes() })
            .map_err(|_| Error::HMACKeyDerivation)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    async fn unwrap(&self, wrapped: &[u8], object_key: &str) -> Result<Dek> {
        if wrapped.len() <= NONCE_LEN {
            return Err(Error::MetadataCorrupt("encrypted-dek"));
        }
        let (nonce_bytes, ct) = wrapped.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&self.kek).map_err(|_| Error::ConfigInvalid("invalid KEK length".into()))?;
        let nonce = Nonce::from_slice(nonce_bytes);
        let pt = cipher
            .decrypt(nonce, Payload { msg: ct, aad: object_key.as_bytes() })
            .map_err(|_| Error::HMACMismatch)?;
        if pt.len() != 32 {
            return Err(Error::MetadataCorrupt("encrypted-dek"));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&pt);
        Ok(Dek::from_bytes(bytes))
    }

    fn create_envelope(self: Arc<Self>, _content_type: EnvelopeContentType, metadata_prefix: &str) -> Arc<dyn EnvelopeEncryptor> {
        let provider: Arc<dyn KekProvider> = self;
        Arc::new(GcmEnvelope::new(provider, metadata_prefix.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wrap_then_unwrap_recovers_the_dek() {
        let provider = AesWrapProvider::new([3u8; 32], "fp");
        let dek = Dek::generate();
        let wrapped = provider.wrap(&dek, "bucket/key").await.unwrap();
        let unwrapped = provider.unwrap(&wrapped, "bucket/key").await.unwrap();
        assert_eq!(dek.expose(), unwrapped.expose());
    }

    #[tokio::test]
    async fn unwrap_fails_when_object_key_aad_differs() {
        let provider = AesWrapProvider::new([3u8; 32], "fp");
        let dek = Dek::generate();
        let wrapped = provider.wrap(&dek, "bucket/key").await.unwrap();
        assert!(provider.unwrap(&wrapped, "bucket/other-key").await.is_err());
    }

    #[test]
    fn fingerprint_for_kek_is_deterministic() {
        let a = AesWrapProvider::fingerprint_for_kek(&[5u8; 32]);
        let b = AesWrapProvider::fingerprint_for_kek(&[5u8; 32]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16); // 8 bytes, hex-encoded
    }
}
