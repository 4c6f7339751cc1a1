//! Orchestrator: the public facade. Routes each request to the
//! single-part pipeline, the multipart session manager, or a streaming
//! reader; owns background session cleanup.
//!
//! This is the one type external callers (the HTTP request handler, out of
//! scope here) construct and hold. Everything else in this crate is
//! reachable through it or through the sub-component modules directly, for
//! callers that want finer control.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::hmac_engine::HMACEngine;
use crate::metadata::{Metadata, MetadataCodec};
use crate::multipart::{MultipartSessionManager, Session};
use crate::provider::{KekProvider, ProviderRegistry};
use crate::single_part::{ContentTypeHint, SinglePartPipeline};
use crate::stream_io::{box_reader, BoxAsyncRead};

/// Snapshot of orchestrator state for an embedding health/metrics endpoint
/// (the endpoint itself is out of scope; this struct is what it would
/// serialize).
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub active_sessions: usize,
    pub active_provider_fingerprint: String,
    pub hmac_mode: String,
    pub streaming_threshold: u64,
    pub streaming_segment_size: usize,
}

pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    hmac: HMACEngine,
    codec: MetadataCodec,
    single_part: SinglePartPipeline,
    multipart: Arc<MultipartSessionManager>,
    config: Config,
    sweeper: std::sync::Mutex<Option<(JoinHandle<()>, oneshot::Sender<()>)>>,
}

impl Orchestrator {
    /// Construct the orchestrator and spawn its background sweeper task,
    /// which calls `expire_sessions(multipart_session_max_age)` every
    /// `multipart_session_cleanup_interval`. Concrete KEK providers are
    /// constructed by the embedding HTTP layer and handed in already built;
    /// `config.providers` is used only for `stats()`/diagnostics, not to
    /// construct providers itself.
    pub fn new(config: Config, providers: Vec<Arc<dyn KekProvider>>, active_fingerprint: &str) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ProviderRegistry::new());
        for provider in providers {
            registry.register(provider);
        }
        registry.set_active(active_fingerprint)?;

        let hmac = HMACEngine::new(config.hmac_mode()?);
        let codec = MetadataCodec::new(config.metadata_key_prefix.clone());
        let single_part = SinglePartPipeline::new(registry.clone(), hmac.clone(), codec.clone(), &config);
        let multipart = Arc::new(MultipartSessionManager::new(registry.clone(), hmac.clone(), codec.clone()));

        let sweeper = {
            let multipart = multipart.clone();
            let max_age = config.multipart_session_max_age;
            let interval = config.multipart_session_cleanup_interval;
            let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let expired = multipart.expire_sessions(max_age).await;
                            if expired > 0 {
                                tracing::info!(expired, "swept expired multipart sessions");
                            }
                        }
                        _ = &mut shutdown_rx => break,
                    }
                }
            });
            (handle, shutdown_tx)
        };

        Ok(Self {
            registry,
            hmac,
            codec,
            single_part,
            multipart,
            config,
            sweeper: std::sync::Mutex::new(Some(sweeper)),
        })
    }

    /// Decide GCM vs CTR by known size, delegate.
    #[instrument(level = "debug", skip(self, reader))]
    pub async fn encrypt(&self, reader: BoxAsyncRead, object_key: &str, object_size: Option<u64>) -> Result<(BoxAsyncRead, Metadata)> {
        let result = self.single_part.encrypt(reader, object_key, object_size, None).await?;
        Ok((result.ciphertext, result.metadata))
    }

    /// Explicit routing when the caller knows whether this is a
    /// whole-object or multipart-destined upload but not the exact size.
    #[instrument(level = "debug", skip(self, reader))]
    pub async fn encrypt_with_content_type(
        &self,
        reader: BoxAsyncRead,
        object_key: &str,
        object_size: Option<u64>,
        hint: ContentTypeHint,
    ) -> Result<(BoxAsyncRead, Metadata)> {
        let result = self.single_part.encrypt(reader, object_key, object_size, Some(hint)).await?;
        Ok((result.ciphertext, result.metadata))
    }

    /// Dispatch by `dek-algorithm`; pass through objects with no envelope
    /// metadata (legacy/unencrypted).
    #[instrument(level = "debug", skip(self, reader))]
    pub async fn decrypt(&self, reader: BoxAsyncRead, metadata: &Metadata, object_key: &str) -> Result<BoxAsyncRead> {
        if self.codec.has_no_envelope(metadata) {
            tracing::debug!(object_key, "no encryption envelope present; passing object through");
            return Ok(reader);
        }
        self.single_part.decrypt(reader, metadata, object_key).await
    }

    /// Download path for objects that were originally uploaded as
    /// multipart: streams the decrypted plaintext with bounded memory
    /// instead of buffering the whole ciphertext, since a multipart
    /// object may be up to 10,000 parts of 5 GiB each.
    #[instrument(level = "debug", skip(self, reader))]
    pub async fn decrypt_multipart(
        &self,
        reader: BoxAsyncRead,
        metadata: &Metadata,
        object_key: &str,
        expected_size: Option<u64>,
    ) -> Result<BoxAsyncRead> {
        if self.codec.has_no_envelope(metadata) {
            tracing::debug!(object_key, "no encryption envelope present; passing object through");
            return Ok(reader);
        }
        self.multipart.decrypt_multipart(reader, metadata, object_key, expected_size).await
    }

    // -- Multipart facade -------------------------------------------------

    pub async fn initiate_upload(&self, upload_id: &str, object_key: &str, bucket_name: &str) -> Result<Arc<Session>> {
        self.multipart.initiate(upload_id, object_key, bucket_name).await
    }

    pub async fn upload_part(&self, upload_id: &str, part_number: u32, reader: BoxAsyncRead) -> Result<(BoxAsyncRead, Metadata, &'static str, String)> {
        self.multipart.process_part(upload_id, part_number, reader).await
    }

    pub fn store_etag(&self, upload_id: &str, part_number: u32, etag: String) -> Result<()> {
        self.multipart.store_etag(upload_id, part_number, etag)
    }

    /// Store every ETag then finalize.
    pub async fn complete_upload(&self, upload_id: &str, etags: Vec<(u32, String)>) -> Result<Option<Metadata>> {
        for (part_number, etag) in etags {
            self.multipart.store_etag(upload_id, part_number, etag)?;
        }
        self.multipart.finalize(upload_id).await
    }

    pub async fn abort_upload(&self, upload_id: &str) -> Result<()> {
        self.multipart.abort(upload_id).await
    }

    pub async fn cleanup_upload(&self, upload_id: &str) -> Result<()> {
        self.multipart.cleanup(upload_id).await
    }

    pub fn get_session(&self, upload_id: &str) -> Result<Arc<Session>> {
        self.multipart.get_session(upload_id)
    }

    // --------------------------------------------------------------------

    pub fn filter_metadata_for_client(&self, metadata: &Metadata) -> Metadata {
        self.codec.filter_client(metadata)
    }

    pub fn stats(&self) -> Stats {
        Stats {
            active_sessions: self.multipart.session_count(),
            active_provider_fingerprint: self.registry.active_fingerprint(),
            hmac_mode: format!("{:?}", self.hmac.mode()).to_ascii_lowercase(),
            streaming_threshold: self.config.streaming_threshold,
            streaming_segment_size: self.config.streaming_segment_size,
        }
    }

    /// Cancel the background sweeper and wait up to `timeout` for it to
    /// stop. Cooperates with in-flight sessions by letting them finish up
    /// to the caller-provided timeout; on timeout it warns but does not
    /// corrupt state — in-flight sessions themselves aren't touched here,
    /// only the periodic sweep is stopped.
    pub async fn shutdown(&self, timeout: Duration) {
        let sweeper = self.sweeper.lock().unwrap().take();
        let Some((handle, shutdown_tx)) = sweeper else { return };
        let _ = shutdown_tx.send(());
        if tokio::time::timeout(timeout, handle).await.is_err() {
            tracing::warn!("background session sweeper did not stop within shutdown timeout");
        }
    }

    /// Escape hatch for callers needing the underlying ciphertext framed
    /// as a reader without going through `encrypt`/`decrypt` (e.g. relaying
    /// an already-decrypted buffer). Convenient for the demo binary and
    /// tests, not otherwise part of the orchestration surface.
    pub fn wrap_bytes(bytes: Vec<u8>) -> BoxAsyncRead {
        box_reader(std::io::Cursor::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::aes_wrap::AesWrapProvider;
    use crate::providers::none::NoneProvider;
    use crate::stream_io::box_reader;
    use tokio::io::AsyncReadExt;

    fn orchestrator_with_aes_wrap(mode: &str) -> Orchestrator {
        let mut config = Config::default();
        config.integrity_verification = mode.to_string();
        let provider: Arc<dyn KekProvider> = Arc::new(AesWrapProvider::new([6u8; 32], "fp-1"));
        Orchestrator::new(config, vec![provider], "fp-1").unwrap()
    }

    #[tokio::test]
    async fn small_gcm_round_trip_scenario() {
        let orch = orchestrator_with_aes_wrap("off");
        let reader = box_reader(std::io::Cursor::new(b"hello".to_vec()));
        let (ciphertext, metadata) = orch.encrypt(reader, "bucket/obj", Some(5)).await.unwrap();

        assert_eq!(metadata.get("s3ep-dek-algorithm").unwrap(), "aes-gcm");
        assert!(metadata.contains_key("s3ep-encrypted-dek"));
        assert!(metadata.contains_key("s3ep-aes-iv"));
        assert!(!metadata.contains_key("s3ep-hmac"));

        let mut plaintext_reader = orch.decrypt(ciphertext, &metadata, "bucket/obj").await.unwrap();
        let mut out = Vec::new();
        plaintext_reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");

        orch.shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn legacy_object_with_no_envelope_passes_through() {
        let orch = orchestrator_with_aes_wrap("off");
        let reader = box_reader(std::io::Cursor::new(b"already plain".to_vec()));
        let metadata = Metadata::new();
        let mut out_reader = orch.decrypt(reader, &metadata, "bucket/obj").await.unwrap();
        let mut out = Vec::new();
        out_reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"already plain");
        orch.shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn none_provider_emits_no_metadata_and_identity_ciphertext() {
        let config = Config::default();
        let provider: Arc<dyn KekProvider> = Arc::new(NoneProvider);
        let orch = Orchestrator::new(config, vec![provider], crate::provider::NONE_PROVIDER_FINGERPRINT).unwrap();
        let reader = box_reader(std::io::Cursor::new(b"unchanged".to_vec()));
        let (mut ciphertext, metadata) = orch.encrypt(reader, "bucket/obj", Some(9)).await.unwrap();
        assert!(metadata.is_empty());
        let mut out = Vec::new();
        ciphertext.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"unchanged");
        orch.shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn filter_metadata_for_client_strips_envelope_keys() {
        let orch = orchestrator_with_aes_wrap("off");
        let reader = box_reader(std::io::Cursor::new(b"hello".to_vec()));
        let (_ct, metadata) = orch.encrypt(reader, "bucket/obj", Some(5)).await.unwrap();
        let filtered = orch.filter_metadata_for_client(&metadata);
        for key in ["encrypted-dek", "aes-iv", "dek-algorithm", "kek-fingerprint", "kek-algorithm", "hmac"] {
            assert!(!filtered.contains_key(&format!("s3ep-{key}")));
        }
        orch.shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn stats_reports_provider_and_thresholds() {
        let orch = orchestrator_with_aes_wrap("strict");
        let stats = orch.stats();
        assert_eq!(stats.active_provider_fingerprint, "fp-1");
        assert_eq!(stats.hmac_mode, "strict");
        assert_eq!(stats.active_sessions, 0);
        orch.shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn multipart_facade_initiate_upload_part_complete_cleanup() {
        let orch = orchestrator_with_aes_wrap("hybrid");
        orch.initiate_upload("U1", "bucket/key", "bucket").await.unwrap();
        let (ct, _meta, algo, _fp) = orch
            .upload_part("U1", 1, box_reader(std::io::Cursor::new(vec![1u8; 16])))
            .await
            .unwrap();
        assert_eq!(algo, "aes-ctr");
        let mut drained = Vec::new();
        let mut ct = ct;
        ct.read_to_end(&mut drained).await.unwrap();
        assert_eq!(drained.len(), 16);

        orch.store_etag("U1", 1, "\"etag-1\"".to_string()).unwrap();
        let metadata = orch.complete_upload("U1", vec![]).await.unwrap().unwrap();
        assert_eq!(metadata.get("s3ep-dek-algorithm").unwrap(), "aes-ctr");
        orch.cleanup_upload("U1").await.unwrap();
        let err = orch.cleanup_upload("U1").await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
        orch.shutdown(Duration::from_millis(50)).await;
    }
}
