//! The one concrete [`EnvelopeEncryptor`] this workspace ships: whole-object
//! AES-256-GCM, generating and wrapping a fresh DEK per call.
//!
//! Single-part objects are bounded by `streaming_threshold`, so buffering
//! the whole plaintext here is an accepted, size-bounded tradeoff rather
//! than an unbounded one. GCM's own authentication tag is the integrity
//! guarantee for this path; no separate HMAC is attached.

use std::sync::Arc;

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use rand::RngCore;
use tokio::io::AsyncReadExt;

use crate::dek::Dek;
use crate::error::{Error, Result};
use crate::metadata::{Metadata, MetadataCodec};
use crate::provider::{EnvelopeEncryptor, KekProvider};
use crate::stream_io::{box_reader, BoxAsyncRead};

const NONCE_LEN: usize = 12;

pub struct GcmEnvelope {
    provider: Arc<dyn KekProvider>,
    codec: MetadataCodec,
}

impl GcmEnvelope {
    pub fn new(provider: Arc<dyn KekProvider>, metadata_prefix: String) -> Self {
        Self { provider, codec: MetadataCodec::new(metadata_prefix) }
    }
}

#[async_trait]
impl EnvelopeEncryptor for GcmEnvelope {
    async fn encrypt_data_stream(&self, mut reader: BoxAsyncRead, aad: &[u8]) -> Result<(BoxAsyncRead, Vec<u8>, Metadata)> {
        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext).await?;

        let dek = Dek::generate();
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(dek.expose()).expect("32-byte key");
        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: &plaintext, aad })
            .map_err(|_| Error::HMACKeyDerivation)?;

        let wrapped_dek = self.provider.wrap(&dek, std::str::from_utf8(aad).unwrap_or_default()).await?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);

        let metadata = self.codec.build(
            &wrapped_dek,
            &nonce_bytes,
            "aes-gcm",
            self.provider.fingerprint(),
            self.provider.algorithm(),
        );

        Ok((box_reader(std::io::Cursor::new(framed)), wrapped_dek, metadata))
    }

    async fn decrypt_data_stream(
        &self,
        mut reader: BoxAsyncRead,
        wrapped_dek: &[u8],
        _iv: Option<&[u8]>,
        aad: &[u8],
    ) -> Result<BoxAsyncRead> {
        let mut framed = Vec::new();
        reader.read_to_end(&mut framed).await?;
        if framed.is_empty() {
            return Err(Error::EmptyCiphertext);
        }
        if framed.len() < NONCE_LEN {
            return Err(Error::MetadataCorrupt("aes-iv"));
        }
        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);

        let dek = self
            .provider
            .unwrap(wrapped_dek, std::str::from_utf8(aad).unwrap_or_default())
            .await?;

        let cipher = Aes256Gcm::new_from_slice(dek.expose()).expect("32-byte key");
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| Error::HMACMismatch)?;

        Ok(box_reader(std::io::Cursor::new(plaintext)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::aes_wrap::AesWrapProvider;

    #[tokio::test]
    async fn encrypt_then_decrypt_round_trips() {
        let provider: Arc<dyn KekProvider> = Arc::new(AesWrapProvider::new([1u8; 32], "fp"));
        let envelope = GcmEnvelope::new(provider, "s3ep-".to_string());

        let plaintext = b"hello, encrypted world";
        let reader = box_reader(std::io::Cursor::new(plaintext.to_vec()));
        let (mut ct_reader, wrapped_dek, metadata) = envelope
            .encrypt_data_stream(reader, b"bucket/obj")
            .await
            .unwrap();

        assert_eq!(metadata.get("s3ep-dek-algorithm").unwrap(), "aes-gcm");

        let mut ct = Vec::new();
        ct_reader.read_to_end(&mut ct).await.unwrap();

        let mut recovered = Vec::new();
        envelope
            .decrypt_data_stream(box_reader(std::io::Cursor::new(ct)), &wrapped_dek, None, b"bucket/obj")
            .await
            .unwrap()
            .read_to_end(&mut recovered)
            .await
            .unwrap();

        assert_eq!(recovered, plaintext);
    }

    #[tokio::test]
    async fn tampered_ciphertext_fails_gcm_tag_check() {
        let provider: Arc<dyn KekProvider> = Arc::new(AesWrapProvider::new([1u8; 32], "fp"));
        let envelope = GcmEnvelope::new(provider, "s3ep-".to_string());

        let reader = box_reader(std::io::Cursor::new(b"some plaintext".to_vec()));
        let (mut ct_reader, wrapped_dek, _metadata) = envelope.encrypt_data_stream(reader, b"obj").await.unwrap();
        let mut ct = Vec::new();
        ct_reader.read_to_end(&mut ct).await.unwrap();
        *ct.last_mut().unwrap() ^= 0xFF;

        let result = envelope
            .decrypt_data_stream(box_reader(std::io::Cursor::new(ct)), &wrapped_dek, None, b"obj")
            .await;
        assert!(matches!(result, Err(Error::HMACMismatch)));
    }
}
