//! SinglePartPipeline: encrypt/decrypt a complete object in one pass,
//! selecting AES-256-GCM (small objects) vs AES-256-CTR+HMAC (large
//! objects).
//!
//! The size/content-type decision rule lives in
//! [`SinglePartPipeline::encrypt`]. Buffering plaintext fully on the CTR
//! path (to compute an HMAC over it before streaming ciphertext out) is a
//! size-bounded tradeoff rather than an unbounded one — here the "chunk"
//! is the whole object, capped by `streaming_threshold`.

use tokio::io::AsyncReadExt;
use tracing::instrument;

use crate::config::Config;
use crate::ctr_cipher::{Aes256CtrCipher, CtrCipher};
use crate::dek::{Dek, Iv};
use crate::error::{Error, Result};
use crate::hmac_engine::HMACEngine;
use crate::metadata::{Metadata, MetadataCodec};
use crate::provider::{EnvelopeContentType, ProviderRegistry};
use crate::stream_io::{box_reader, BoxAsyncRead};

/// A caller-supplied hint for the GCM/CTR decision when the object's exact
/// size isn't known up front (a chunked upload with no `Content-Length`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentTypeHint {
    Whole,
    Multipart,
}

/// Result of a single-part encrypt call: the ciphertext stream plus the
/// envelope metadata to attach to the backend `PUT`.
pub struct EncryptResult {
    pub ciphertext: BoxAsyncRead,
    pub metadata: Metadata,
    pub algorithm: &'static str,
    pub active_fingerprint: String,
}

pub struct SinglePartPipeline {
    registry: std::sync::Arc<ProviderRegistry>,
    hmac: HMACEngine,
    codec: MetadataCodec,
    streaming_threshold: u64,
    /// Single-part CTR-with-HMAC buffers the whole plaintext; this caps
    /// that buffer rather than leaving it unbounded.
    buffer_cap: u64,
}

impl SinglePartPipeline {
    pub fn new(registry: std::sync::Arc<ProviderRegistry>, hmac: HMACEngine, codec: MetadataCodec, config: &Config) -> Self {
        Self {
            registry,
            hmac,
            codec,
            streaming_threshold: config.streaming_threshold,
            buffer_cap: config.streaming_threshold.saturating_mul(2),
        }
    }

    /// Decide GCM vs CTR: GCM if `object_size` is known and below the
    /// threshold; otherwise CTR. When size is unknown, fall back
    /// to the caller's content-type hint (`Whole` ⇒ GCM, `Multipart` ⇒ CTR —
    /// multipart-sized content is assumed large).
    #[instrument(level = "debug", skip(self, reader), fields(object_key))]
    pub async fn encrypt(
        &self,
        reader: BoxAsyncRead,
        object_key: &str,
        object_size: Option<u64>,
        hint: Option<ContentTypeHint>,
    ) -> Result<EncryptResult> {
        let use_gcm = match (object_size, hint) {
            (Some(size), _) => size < self.streaming_threshold,
            (None, Some(ContentTypeHint::Whole)) => true,
            (None, Some(ContentTypeHint::Multipart)) => false,
            (None, None) => true,
        };
        if use_gcm {
            self.encrypt_gcm(reader, object_key).await
        } else {
            self.encrypt_ctr(reader, object_key, object_size).await
        }
    }

    async fn encrypt_gcm(&self, reader: BoxAsyncRead, object_key: &str) -> Result<EncryptResult> {
        if self.registry.is_none_provider() {
            return Ok(EncryptResult {
                ciphertext: reader,
                metadata: Metadata::new(),
                algorithm: "none",
                active_fingerprint: self.registry.active_fingerprint(),
            });
        }
        let envelope = self
            .registry
            .create_active_envelope(EnvelopeContentType::Whole, &self.codec_prefix())?;
        let (ciphertext, _wrapped_dek, metadata) = envelope.encrypt_data_stream(reader, object_key.as_bytes()).await?;
        // GCM's own tag is the integrity guarantee; no HMAC is attached here.
        Ok(EncryptResult {
            ciphertext,
            metadata,
            algorithm: "aes-gcm",
            active_fingerprint: self.registry.active_fingerprint(),
        })
    }

    async fn encrypt_ctr(&self, mut reader: BoxAsyncRead, object_key: &str, object_size: Option<u64>) -> Result<EncryptResult> {
        if self.registry.is_none_provider() {
            return Ok(EncryptResult {
                ciphertext: reader,
                metadata: Metadata::new(),
                algorithm: "none",
                active_fingerprint: self.registry.active_fingerprint(),
            });
        }
        if let Some(size) = object_size {
            if size > self.buffer_cap {
                return Err(Error::ObjectTooLarge { size, cap: self.buffer_cap });
            }
        }

        let dek = Dek::generate();
        let mut cipher = Aes256CtrCipher::new(&dek);
        let iv = cipher.get_iv();

        let mut metadata;
        let ciphertext_bytes;

        if self.hmac.enabled() {
            let mut plaintext = Vec::new();
            let read = reader.read_to_end(&mut plaintext).await? as u64;
            if read > self.buffer_cap {
                plaintext.zeroize_buffer();
                return Err(Error::ObjectTooLarge { size: read, cap: self.buffer_cap });
            }
            let mut calc = self.hmac.create_calculator(&dek)?;
            calc.add(&plaintext);
            ciphertext_bytes = cipher.encrypt_part(&plaintext);
            plaintext.zeroize_buffer();
            let tag = self.hmac.finalize(calc);

            let (wrapped_dek, kek_algo, fp) = self.registry.wrap_active(&dek, object_key).await?;
            metadata = self.codec.build(&wrapped_dek, iv.as_bytes(), "aes-ctr", &fp, &kek_algo);
            self.codec.set_hmac(&mut metadata, &tag);
        } else {
            let mut plaintext = Vec::new();
            reader.read_to_end(&mut plaintext).await?;
            ciphertext_bytes = cipher.encrypt_part(&plaintext);
            plaintext.zeroize_buffer();

            let (wrapped_dek, kek_algo, fp) = self.registry.wrap_active(&dek, object_key).await?;
            metadata = self.codec.build(&wrapped_dek, iv.as_bytes(), "aes-ctr", &fp, &kek_algo);
        }

        cipher.cleanup();
        let fingerprint = self.registry.active_fingerprint();
        Ok(EncryptResult {
            ciphertext: box_reader(std::io::Cursor::new(ciphertext_bytes)),
            metadata,
            algorithm: "aes-ctr",
            active_fingerprint: fingerprint,
        })
    }

    #[instrument(level = "debug", skip(self, reader, metadata), fields(object_key))]
    pub async fn decrypt(&self, reader: BoxAsyncRead, metadata: &Metadata, object_key: &str) -> Result<BoxAsyncRead> {
        if self.codec.has_no_envelope(metadata) {
            return Ok(reader);
        }
        let algorithm = self.codec.get_dek_algorithm(metadata)?;
        match algorithm.as_str() {
            "aes-gcm" => self.decrypt_gcm(reader, metadata, object_key).await,
            "aes-ctr" => self.decrypt_ctr(reader, metadata, object_key).await,
            other => Err(Error::UnknownAlgorithm(other.to_string())),
        }
    }

    async fn decrypt_gcm(&self, mut reader: BoxAsyncRead, metadata: &Metadata, object_key: &str) -> Result<BoxAsyncRead> {
        let mut framed = Vec::new();
        let mut limited = (&mut reader).take(self.buffer_cap + 1);
        let n = limited.read_to_end(&mut framed).await?;
        if n == 0 {
            return Err(Error::EmptyCiphertext);
        }
        if framed.len() as u64 > self.buffer_cap {
            return Err(Error::ObjectTooLarge { size: framed.len() as u64, cap: self.buffer_cap });
        }
        let fingerprint = self.codec.get_fingerprint(metadata)?;
        let kek_algorithm = self.codec.get_kek_algorithm(metadata)?;
        let wrapped_dek = self.codec.get_encrypted_dek(metadata)?;
        let envelope = self.registry.create_envelope_for(
            &fingerprint,
            &kek_algorithm,
            object_key,
            EnvelopeContentType::Whole,
            &self.codec_prefix(),
        )?;
        let plaintext_reader = envelope
            .decrypt_data_stream(box_reader(std::io::Cursor::new(framed)), &wrapped_dek, None, object_key.as_bytes())
            .await?;

        match self.codec.get_hmac(metadata)? {
            Some(expected) if self.hmac.enabled() => self.verify_buffered(plaintext_reader, &wrapped_dek, &fingerprint, &kek_algorithm, object_key, &expected).await,
            _ => Ok(plaintext_reader),
        }
    }

    async fn decrypt_ctr(&self, mut reader: BoxAsyncRead, metadata: &Metadata, object_key: &str) -> Result<BoxAsyncRead> {
        let mut ciphertext = Vec::new();
        let mut limited = (&mut reader).take(self.buffer_cap + 1);
        limited.read_to_end(&mut ciphertext).await?;
        if ciphertext.len() as u64 > self.buffer_cap {
            return Err(Error::ObjectTooLarge { size: ciphertext.len() as u64, cap: self.buffer_cap });
        }

        let fingerprint = self.codec.get_fingerprint(metadata)?;
        let kek_algorithm = self.codec.get_kek_algorithm(metadata)?;
        let wrapped_dek = self.codec.get_encrypted_dek(metadata)?;
        let iv_bytes = self.codec.get_iv(metadata)?;
        let mut iv_arr = [0u8; 16];
        if iv_bytes.len() != 16 {
            return Err(Error::MetadataCorrupt("aes-iv"));
        }
        iv_arr.copy_from_slice(&iv_bytes);
        let iv = Iv(iv_arr);

        let dek = self.registry.unwrap(&wrapped_dek, &fingerprint, &kek_algorithm, object_key).await?;
        let mut cipher = Aes256CtrCipher::new_with_iv(&dek, iv);
        let plaintext = cipher.decrypt_part(&ciphertext);
        cipher.cleanup();

        match self.codec.get_hmac(metadata)? {
            Some(expected) if self.hmac.enabled() => {
                let mut calc = self.hmac.create_calculator(&dek)?;
                calc.add(&plaintext);
                match self.hmac.verify(calc, Some(&expected))? {
                    crate::hmac_engine::VerifyOutcome::Passed | crate::hmac_engine::VerifyOutcome::PassedWithWarning => {
                        Ok(box_reader(std::io::Cursor::new(plaintext)))
                    }
                }
            }
            None if matches!(self.hmac.mode(), crate::hmac_engine::Mode::Strict) => Err(Error::HMACMissing),
            _ => Ok(box_reader(std::io::Cursor::new(plaintext))),
        }
    }

    /// Shared "buffer + recompute + verify" path used by GCM-with-HMAC
    /// decrypt: when HMAC is enabled and the metadata carries a tag, buffer
    /// the plaintext, recompute the HMAC, and verify before releasing it.
    #[allow(clippy::too_many_arguments)]
    async fn verify_buffered(
        &self,
        mut reader: BoxAsyncRead,
        wrapped_dek: &[u8],
        fingerprint: &str,
        kek_algorithm: &str,
        object_key: &str,
        expected: &[u8],
    ) -> Result<BoxAsyncRead> {
        let mut plaintext = Vec::new();
        let mut limited = (&mut reader).take(self.buffer_cap + 1);
        limited.read_to_end(&mut plaintext).await?;
        if plaintext.len() as u64 > self.buffer_cap {
            return Err(Error::ObjectTooLarge { size: plaintext.len() as u64, cap: self.buffer_cap });
        }
        let dek = self.registry.unwrap(wrapped_dek, fingerprint, kek_algorithm, object_key).await?;
        let mut calc = self.hmac.create_calculator(&dek)?;
        calc.add(&plaintext);
        self.hmac.verify(calc, Some(expected))?;
        Ok(box_reader(std::io::Cursor::new(plaintext)))
    }

    fn codec_prefix(&self) -> String {
        self.codec.prefix().to_string()
    }
}

trait ZeroizeBuffer {
    fn zeroize_buffer(&mut self);
}

impl ZeroizeBuffer for Vec<u8> {
    fn zeroize_buffer(&mut self) {
        use zeroize::Zeroize;
        self.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmac_engine::Mode;
    use crate::providers::aes_wrap::AesWrapProvider;
    use std::sync::Arc;

    fn registry_with_provider() -> Arc<ProviderRegistry> {
        let registry = Arc::new(ProviderRegistry::new());
        let provider = Arc::new(AesWrapProvider::new([4u8; 32], "fp-1"));
        registry.register(provider);
        registry.set_active("fp-1").unwrap();
        registry
    }

    fn pipeline(registry: Arc<ProviderRegistry>, mode: Mode, threshold: u64) -> SinglePartPipeline {
        let mut config = Config::default();
        config.streaming_threshold = threshold.max(crate::config::MIN_STREAMING_THRESHOLD);
        SinglePartPipeline::new(registry, HMACEngine::new(mode), MetadataCodec::default(), &config)
    }

    #[tokio::test]
    async fn small_object_round_trips_via_gcm_without_hmac() {
        let registry = registry_with_provider();
        let pipeline = pipeline(registry, Mode::Off, crate::config::DEFAULT_STREAMING_THRESHOLD);

        let reader = box_reader(std::io::Cursor::new(b"hello".to_vec()));
        let result = pipeline.encrypt(reader, "bucket/obj", Some(5), None).await.unwrap();
        assert_eq!(result.algorithm, "aes-gcm");
        assert!(pipeline.codec.get_hmac(&result.metadata).unwrap().is_none());

        let plaintext = read_all(pipeline.decrypt(result.ciphertext, &result.metadata, "bucket/obj").await.unwrap()).await;
        assert_eq!(plaintext, b"hello");
    }

    #[tokio::test]
    async fn large_object_uses_ctr_with_hmac_and_detects_tamper() {
        let registry = registry_with_provider();
        let pipeline = pipeline(registry, Mode::Strict, crate::config::MIN_STREAMING_THRESHOLD);

        let payload: Vec<u8> = (0..(6 * 1024 * 1024usize)).map(|i| (i % 256) as u8).collect();
        let reader = box_reader(std::io::Cursor::new(payload.clone()));
        let result = pipeline
            .encrypt(reader, "bucket/obj", Some(payload.len() as u64), None)
            .await
            .unwrap();
        assert_eq!(result.algorithm, "aes-ctr");
        assert!(pipeline.codec.get_hmac(&result.metadata).unwrap().is_some());

        let mut ct = read_all(result.ciphertext).await;
        let decrypted = pipeline
            .decrypt(box_reader(std::io::Cursor::new(ct.clone())), &result.metadata, "bucket/obj")
            .await
            .unwrap();
        assert_eq!(read_all(decrypted).await, payload);

        ct[500_000] ^= 0xFF;
        let err = pipeline
            .decrypt(box_reader(std::io::Cursor::new(ct)), &result.metadata, "bucket/obj")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HMACMismatch));
    }

    #[tokio::test]
    async fn none_provider_passes_through_untouched() {
        let registry = Arc::new(ProviderRegistry::new());
        let pipeline = pipeline(registry, Mode::Off, crate::config::DEFAULT_STREAMING_THRESHOLD);
        let reader = box_reader(std::io::Cursor::new(b"plain".to_vec()));
        let result = pipeline.encrypt(reader, "bucket/obj", Some(5), None).await.unwrap();
        assert!(result.metadata.is_empty());
        assert_eq!(read_all(result.ciphertext).await, b"plain");
    }

    #[tokio::test]
    async fn oversized_ctr_object_is_rejected() {
        let registry = registry_with_provider();
        let pipeline = pipeline(registry, Mode::Off, crate::config::MIN_STREAMING_THRESHOLD);
        let size = pipeline.buffer_cap + 1;
        let reader = box_reader(std::io::Cursor::new(vec![0u8; 1]));
        let err = pipeline.encrypt(reader, "bucket/obj", Some(size), None).await.unwrap_err();
        assert!(matches!(err, Error::ObjectTooLarge { .. }));
    }

    /// The buffer cap enforced on `encrypt_ctr` applies symmetrically on
    /// decrypt: an oversized CTR ciphertext is rejected before any key
    /// unwrap or cipher work, not silently buffered without bound.
    #[tokio::test]
    async fn oversized_ctr_ciphertext_is_rejected_on_decrypt() {
        let registry = registry_with_provider();
        let pipeline = pipeline(registry, Mode::Off, crate::config::MIN_STREAMING_THRESHOLD);

        let metadata = pipeline.codec.build(b"wrapped", &[0u8; 16], "aes-ctr", "fp-1", "aes-wrap");
        let oversized = vec![0u8; (pipeline.buffer_cap + 1) as usize];
        let err = pipeline
            .decrypt(box_reader(std::io::Cursor::new(oversized)), &metadata, "bucket/obj")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectTooLarge { .. }));
    }

    async fn read_all(mut reader: BoxAsyncRead) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }
}
