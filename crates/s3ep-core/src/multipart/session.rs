//! A single multipart upload's in-flight state.
//!
//! Two locks in a fixed acquisition order: `ordering` (guards
//! `expected_part_number` + `pending`) is taken briefly
//! and released before `state` (guards the CTR/HMAC/ETag state) is ever
//! touched, so no code path holds both at once. Both are `std::sync::Mutex`
//! — held only across synchronous crypto work, never across an `.await`
//! point, which is what keeps this safe without `tokio::sync::Mutex`'s
//! extra bookkeeping.

use std::collections::BTreeMap;
use std::time::Instant;

use tokio::sync::oneshot;
use zeroize::Zeroize;

use crate::ctr_cipher::CtrCipher;
use crate::dek::{Dek, Iv};
use crate::error::{Error, Result};
use crate::hmac_engine::Calculator;

/// Crypto state present for every session except ones created under the
/// `none` provider, which needs no DEK/IV/HMAC state at all.
pub(super) struct CryptoState {
    pub dek: Dek,
    pub iv: Iv,
    pub ctr: Box<dyn CtrCipher>,
    pub hmac_calc: Option<Calculator>,
    pub fingerprint: String,
}

pub(super) struct PendingPart {
    pub buffer: Vec<u8>,
    pub responder: oneshot::Sender<Result<PartResult>>,
}

struct Ordering {
    expected_part_number: u32,
    pending: std::collections::HashMap<u32, PendingPart>,
}

struct State {
    crypto: Option<CryptoState>,
    part_etags: BTreeMap<u32, String>,
}

/// Result of processing one part: ciphertext bytes plus the routing tag the
/// caller needs to eventually attach to the backend `PUT` for this part.
#[derive(Debug, Clone)]
pub struct PartResult {
    pub ciphertext: Vec<u8>,
    pub algorithm: &'static str,
    pub fingerprint: String,
}

pub struct Session {
    pub upload_id: String,
    pub object_key: String,
    pub bucket_name: String,
    pub created_at: Instant,
    ordering: std::sync::Mutex<Ordering>,
    state: std::sync::Mutex<State>,
}

impl Session {
    pub(super) fn new(upload_id: String, object_key: String, bucket_name: String, crypto: Option<CryptoState>) -> Self {
        Self {
            upload_id,
            object_key,
            bucket_name,
            created_at: Instant::now(),
            ordering: std::sync::Mutex::new(Ordering {
                expected_part_number: 1,
                pending: std::collections::HashMap::new(),
            }),
            state: std::sync::Mutex::new(State {
                crypto,
                part_etags: BTreeMap::new(),
            }),
        }
    }

    pub(super) fn fingerprint(&self) -> String {
        self.state.lock().unwrap().crypto.as_ref().map(|c| c.fingerprint.clone()).unwrap_or_default()
    }

    pub(super) fn is_none_provider(&self) -> bool {
        self.state.lock().unwrap().crypto.is_none()
    }

    pub(super) fn store_etag(&self, part_number: u32, etag: String) {
        self.state.lock().unwrap().part_etags.insert(part_number, etag);
    }

    pub(super) fn etags(&self) -> BTreeMap<u32, String> {
        self.state.lock().unwrap().part_etags.clone()
    }

    /// Process one already-drained part, blocking the caller until its turn
    /// comes if it arrived ahead of the expected part number. Part-size-cap
    /// validation and metadata wrapping happen in the manager before/after
    /// calling in. `buffer` must already be fully drained from the caller's
    /// reader —
    /// this method never touches I/O, only in-memory crypto state, so it
    /// never needs to hold a lock across an `.await`.
    pub(super) async fn process_part(&self, part_number: u32, buffer: Vec<u8>) -> Result<PartResult> {
        enum Decision {
            Now(Vec<u8>),
            Wait(oneshot::Receiver<Result<PartResult>>),
        }

        let decision = {
            let mut ordering = self.ordering.lock().unwrap();
            if part_number <= ordering.expected_part_number {
                Decision::Now(buffer)
            } else {
                let (tx, rx) = oneshot::channel();
                ordering.pending.insert(part_number, PendingPart { buffer, responder: tx });
                Decision::Wait(rx)
            }
        };

        match decision {
            Decision::Now(buf) => self.process_in_place_and_advance(part_number, buf),
            Decision::Wait(rx) => rx
                .await
                .unwrap_or_else(|_| Err(Error::SessionCleaned(self.upload_id.clone()))),
        }
    }

    /// "Process in place" under `state`'s exclusive lock, then advance
    /// `expected_part_number` and drain any pending waiters it unblocks —
    /// all synchronous, no I/O.
    fn process_in_place_and_advance(&self, part_number: u32, buffer: Vec<u8>) -> Result<PartResult> {
        let result = self.process_in_place(buffer);
        self.advance_past(part_number);
        result
    }

    fn process_in_place(&self, mut buffer: Vec<u8>) -> Result<PartResult> {
        let mut state = self.state.lock().unwrap();
        let result = match state.crypto.as_mut() {
            None => Ok(PartResult {
                ciphertext: buffer.clone(),
                algorithm: "none",
                fingerprint: crate::provider::NONE_PROVIDER_FINGERPRINT.to_string(),
            }),
            Some(crypto) => {
                if let Some(calc) = crypto.hmac_calc.as_mut() {
                    calc.add(&buffer);
                }
                let ciphertext = crypto.ctr.encrypt_part(&buffer);
                Ok(PartResult {
                    ciphertext,
                    algorithm: "aes-ctr",
                    fingerprint: crypto.fingerprint.clone(),
                })
            }
        };
        buffer.zeroize();
        result
    }

    fn advance_past(&self, part_number: u32) {
        let mut current = part_number;
        loop {
            let next_entry = {
                let mut ordering = self.ordering.lock().unwrap();
                if ordering.expected_part_number <= current {
                    ordering.expected_part_number = current + 1;
                }
                let next = ordering.expected_part_number;
                ordering.pending.remove(&next).map(|p| (next, p))
            };
            match next_entry {
                Some((next_number, pending)) => {
                    let result = self.process_in_place(pending.buffer);
                    let _ = pending.responder.send(result);
                    current = next_number;
                }
                None => break,
            }
        }
    }

    /// Fail every currently-blocked `processPart` waiter with `error`
    /// (called from `abort`/`expire`/`cleanup` before the session is
    /// dropped).
    pub(super) fn fail_all_pending(&self, error: impl Fn() -> Error) {
        let mut ordering = self.ordering.lock().unwrap();
        for (_, pending) in ordering.pending.drain() {
            let _ = pending.responder.send(Err(error()));
        }
    }

    /// Zero the DEK/IV/CTR/HMAC state. Every session that leaves the
    /// manager (completed, aborted, or expired) must have gone through this
    /// first. Dropping `crypto` entirely drops the `Dek` (whose
    /// `secrecy::Secret` backing store zeroizes itself on drop) and the
    /// `Calculator` (which zeroizes its own key material on drop), after
    /// explicitly zeroizing the IV and cipher scratch state first.
    pub(super) fn clear_crypto(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(mut crypto) = state.crypto.take() {
            crypto.iv.zeroize();
            crypto.ctr.cleanup();
        }
    }

    pub(super) fn is_crypto_cleared(&self) -> bool {
        self.state.lock().unwrap().crypto.is_none()
    }

    /// Pull out everything `finalize` needs — the DEK, IV, and a finalized
    /// HMAC tag if enabled — without holding the state lock
    /// across the subsequent async KEK-wrap call. The session's HMAC
    /// calculator is consumed here (finalize only ever runs once per
    /// session); the DEK/IV are cloned, not removed, because `finalize`
    /// leaves the session registered for the caller to `cleanup` later.
    pub(super) fn finalize_crypto(&self, hmac: &crate::hmac_engine::HMACEngine) -> (Dek, Iv, Option<[u8; 32]>) {
        let mut state = self.state.lock().unwrap();
        let crypto = state.crypto.as_mut().expect("finalize_crypto called on a none-provider session");
        let dek = crypto.dek.clone();
        let iv = crypto.iv;
        let tag = crypto.hmac_calc.take().map(|calc| hmac.finalize(calc));
        (dek, iv, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctr_cipher::Aes256CtrCipher;
    use crate::hmac_engine::{HMACEngine, Mode};

    fn session_with_crypto(mode: Mode) -> (Session, Dek) {
        let dek = Dek::generate();
        let cipher = Aes256CtrCipher::new(&dek);
        let iv = cipher.get_iv();
        let engine = HMACEngine::new(mode);
        let hmac_calc = if engine.enabled() { Some(engine.create_calculator(&dek).unwrap()) } else { None };
        let crypto = CryptoState {
            dek: dek.clone(),
            iv,
            ctr: Box::new(cipher),
            hmac_calc,
            fingerprint: "fp-1".to_string(),
        };
        (Session::new("u1".into(), "bucket/key".into(), "bucket".into(), Some(crypto)), dek)
    }

    #[tokio::test]
    async fn out_of_order_arrival_processes_in_part_number_order() {
        let (session, _dek) = session_with_crypto(Mode::Off);
        let session = std::sync::Arc::new(session);

        let s2 = session.clone();
        let h2 = tokio::spawn(async move { s2.process_part(2, vec![2u8; 8]).await });
        tokio::task::yield_now().await;

        let r1 = session.process_part(1, vec![1u8; 8]).await.unwrap();
        let r2 = h2.await.unwrap().unwrap();
        assert_eq!(r1.algorithm, "aes-ctr");
        assert_eq!(r2.algorithm, "aes-ctr");
    }

    #[tokio::test]
    async fn abort_releases_blocked_waiter_with_session_aborted() {
        let (session, _dek) = session_with_crypto(Mode::Off);
        let session = std::sync::Arc::new(session);

        let s2 = session.clone();
        let handle = tokio::spawn(async move { s2.process_part(2, vec![0u8; 4]).await });
        tokio::task::yield_now().await;

        session.fail_all_pending(|| Error::SessionAborted("u1".to_string()));
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::SessionAborted(_))));
    }

    #[tokio::test]
    async fn clear_crypto_drops_dek_and_zeroes_iv() {
        let (session, _dek) = session_with_crypto(Mode::Off);
        assert!(!session.is_crypto_cleared());
        session.clear_crypto();
        assert!(session.is_crypto_cleared());
    }

    #[tokio::test]
    async fn none_provider_session_has_no_crypto_state() {
        let session = Session::new("u1".into(), "bucket/key".into(), "bucket".into(), None);
        assert!(session.is_none_provider());
        let result = session.process_part(1, b"hello".to_vec()).await.unwrap();
        assert_eq!(result.algorithm, "none");
        assert_eq!(result.ciphertext, b"hello");
    }
}
