//! MultipartSessionManager: lifecycle of multipart upload sessions.
//!
//! `sessions` is a read/write lock over the session table: writers
//! (`initiate`/`abort`/`cleanup`/`expire_sessions`) take the write half,
//! `get_session`/`process_part`/`store_etag` take the read half (they only
//! need a stable `Arc<Session>` clone; all further mutation happens inside
//! the session's own locks, per [`super::session`]).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::instrument;

use crate::ctr_cipher::{Aes256CtrCipher, CtrCipher};
use crate::dek::{Dek, Iv};
use crate::error::{Error, Result};
use crate::hmac_engine::HMACEngine;
use crate::metadata::{Metadata, MetadataCodec};
use crate::provider::ProviderRegistry;
use crate::stream_io::{box_reader, BoxAsyncRead};
use crate::streaming::{DecryptingReader, HMACValidatingReader};

use super::session::{CryptoState, PartResult, Session};

/// S3's own multipart part-number range: `1 <= partNumber <= 10_000`.
pub const MIN_PART_NUMBER: u32 = 1;
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Hard cap on a single buffered part, matching S3's per-part size ceiling
/// (5 GiB). Parts arrive as a stream and are drained into memory before the
/// CTR/HMAC state lock is taken — this bounds that buffer.
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

pub struct MultipartSessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    registry: Arc<ProviderRegistry>,
    hmac: HMACEngine,
    codec: MetadataCodec,
}

impl MultipartSessionManager {
    pub fn new(registry: Arc<ProviderRegistry>, hmac: HMACEngine, codec: MetadataCodec) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            registry,
            hmac,
            codec,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    #[instrument(level = "debug", skip(self), fields(upload_id))]
    pub async fn initiate(&self, upload_id: &str, object_key: &str, bucket_name: &str) -> Result<Arc<Session>> {
        if self.sessions.read().unwrap().contains_key(upload_id) {
            return Err(Error::SessionExists(upload_id.to_string()));
        }

        let crypto = if self.registry.is_none_provider() {
            None
        } else {
            let dek = Dek::generate();
            let cipher = Aes256CtrCipher::new(&dek);
            let iv = cipher.get_iv();
            let hmac_calc = if self.hmac.enabled() { Some(self.hmac.create_calculator(&dek)?) } else { None };
            Some(CryptoState {
                dek,
                iv,
                ctr: Box::new(cipher),
                hmac_calc,
                fingerprint: self.registry.active_fingerprint(),
            })
        };

        let session = Arc::new(Session::new(
            upload_id.to_string(),
            object_key.to_string(),
            bucket_name.to_string(),
            crypto,
        ));

        let mut sessions = self.sessions.write().unwrap();
        // Re-check under the write lock: another task may have raced us
        // between the read-lock existence check above and taking the
        // write lock.
        if sessions.contains_key(upload_id) {
            return Err(Error::SessionExists(upload_id.to_string()));
        }
        sessions.insert(upload_id.to_string(), session.clone());
        tracing::debug!(upload_id, "multipart session initiated");
        Ok(session)
    }

    pub fn get_session(&self, upload_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .get(upload_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(upload_id.to_string()))
    }

    /// Drains `reader` into a bounded buffer before handing off to the
    /// session (never hold the session's state lock across I/O), then
    /// returns ciphertext ready to stream to the backend.
    #[instrument(level = "debug", skip(self, reader), fields(upload_id, part_number))]
    pub async fn process_part(&self, upload_id: &str, part_number: u32, mut reader: BoxAsyncRead) -> Result<(BoxAsyncRead, Metadata, &'static str, String)> {
        if !(MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(Error::InvalidPartNumber(part_number));
        }
        let session = self.get_session(upload_id)?;

        use tokio::io::AsyncReadExt;
        let mut buffer = Vec::new();
        let mut limited = (&mut reader).take(MAX_PART_SIZE + 1);
        limited.read_to_end(&mut buffer).await?;
        if buffer.len() as u64 > MAX_PART_SIZE {
            return Err(Error::ObjectTooLarge { size: buffer.len() as u64, cap: MAX_PART_SIZE });
        }

        let PartResult { ciphertext, algorithm, fingerprint } = session.process_part(part_number, buffer).await?;
        Ok((box_reader(std::io::Cursor::new(ciphertext)), Metadata::new(), algorithm, fingerprint))
    }

    pub fn store_etag(&self, upload_id: &str, part_number: u32, etag: String) -> Result<()> {
        let session = self.get_session(upload_id)?;
        session.store_etag(part_number, etag);
        Ok(())
    }

    /// Commits the session's DEK to the backend. The session is left
    /// registered; callers must explicitly `cleanup` after the backend
    /// `CompleteMultipartUpload` succeeds.
    #[instrument(level = "debug", skip(self), fields(upload_id))]
    pub async fn finalize(&self, upload_id: &str) -> Result<Option<Metadata>> {
        let session = self.get_session(upload_id)?;
        if session.is_none_provider() {
            return Ok(None);
        }
        let fingerprint = session.fingerprint();
        let (dek, iv, hmac_tag) = session.finalize_crypto(&self.hmac);

        let (wrapped_dek, kek_algorithm) = self.registry.wrap_with(&fingerprint, &dek, &session.object_key).await?;
        let mut metadata = self.codec.build(&wrapped_dek, iv.as_bytes(), "aes-ctr", &fingerprint, &kek_algorithm);
        if let Some(tag) = hmac_tag {
            self.codec.set_hmac(&mut metadata, &tag);
        }
        Ok(Some(metadata))
    }

    /// Download path for multipart objects (spec §4.5): unwraps the DEK via
    /// the fingerprint-addressed provider, constructs a CTR decryptor from
    /// the stored DEK+IV, and returns a reader that decrypts lazily in
    /// bounded memory rather than buffering the whole object — the CTR
    /// counter is seeded once from the stored IV and advances with every
    /// `poll_read`, mirroring how the upload side kept one contiguous
    /// keystream across parts.
    ///
    /// When HMAC is enabled, the metadata carries a tag, and the caller
    /// knows the expected plaintext size, the stream is wrapped in an
    /// [`HMACValidatingReader`] so the final chunk is withheld from the
    /// caller until its tag checks out (§4.6). Per §4.6, when
    /// `expected_size` is absent/non-positive or no HMAC is available, a
    /// plain [`DecryptingReader`] is returned instead.
    #[instrument(level = "debug", skip(self, reader), fields(object_key))]
    pub async fn decrypt_multipart(
        &self,
        reader: BoxAsyncRead,
        metadata: &Metadata,
        object_key: &str,
        expected_size: Option<u64>,
    ) -> Result<BoxAsyncRead> {
        if self.codec.has_no_envelope(metadata) {
            return Ok(reader);
        }
        let algorithm = self.codec.get_dek_algorithm(metadata)?;
        if algorithm != "aes-ctr" {
            return Err(Error::UnknownAlgorithm(algorithm));
        }

        let fingerprint = self.codec.get_fingerprint(metadata)?;
        let kek_algorithm = self.codec.get_kek_algorithm(metadata)?;
        let wrapped_dek = self.codec.get_encrypted_dek(metadata)?;
        let iv_bytes = self.codec.get_iv(metadata)?;
        if iv_bytes.len() != 16 {
            return Err(Error::MetadataCorrupt("aes-iv"));
        }
        let mut iv_arr = [0u8; 16];
        iv_arr.copy_from_slice(&iv_bytes);

        let dek = self.registry.unwrap(&wrapped_dek, &fingerprint, &kek_algorithm, object_key).await?;
        let cipher = Aes256CtrCipher::new_with_iv(&dek, Iv(iv_arr));
        let decrypting = DecryptingReader::new(reader, Box::new(cipher));

        let expected_hmac = self.codec.get_hmac(metadata)?;
        match (expected_hmac, expected_size) {
            (Some(tag), Some(size)) if self.hmac.enabled() && size > 0 => {
                let calc = self.hmac.create_calculator(&dek)?;
                Ok(box_reader(HMACValidatingReader::new(
                    decrypting,
                    Arc::new(self.hmac.clone()),
                    calc,
                    tag,
                    size as i64,
                )))
            }
            _ => Ok(box_reader(decrypting)),
        }
    }

    #[instrument(level = "debug", skip(self), fields(upload_id))]
    pub async fn abort(&self, upload_id: &str) -> Result<()> {
        let session = self.remove(upload_id)?;
        session.fail_all_pending(|| Error::SessionAborted(upload_id.to_string()));
        session.clear_crypto();
        tracing::debug!(upload_id, "multipart session aborted");
        Ok(())
    }

    /// Internal post-success teardown, called once the backend confirms
    /// `CompleteMultipartUpload`.
    #[instrument(level = "debug", skip(self), fields(upload_id))]
    pub async fn cleanup(&self, upload_id: &str) -> Result<()> {
        let session = self.remove(upload_id)?;
        session.fail_all_pending(|| Error::SessionCleaned(upload_id.to_string()));
        session.clear_crypto();
        tracing::debug!(upload_id, "multipart session cleaned up");
        Ok(())
    }

    /// Sweep sessions older than `max_age`, treating each as an abort with
    /// cause `SessionExpired`. Invoked periodically by the orchestrator's
    /// background task.
    #[instrument(level = "debug", skip(self))]
    pub async fn expire_sessions(&self, max_age: Duration) -> usize {
        let now = std::time::Instant::now();
        let expired: Vec<String> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .iter()
                .filter(|(_, s)| now.saturating_duration_since(s.created_at) > max_age)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut count = 0;
        for upload_id in expired {
            if let Ok(session) = self.remove(&upload_id) {
                session.fail_all_pending(|| Error::SessionExpired(upload_id.clone(), max_age));
                session.clear_crypto();
                count += 1;
                tracing::debug!(upload_id = upload_id.as_str(), "multipart session expired");
            }
        }
        count
    }

    fn remove(&self, upload_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .write()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| Error::SessionNotFound(upload_id.to_string()))
    }
}
