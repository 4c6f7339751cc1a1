//! HMACEngine: derive a per-object HMAC key from a DEK via HKDF, run an
//! incremental HMAC-SHA-256 calculator over plaintext, and verify it against
//! a stored tag under one of four verification modes.
//!
//! The derivation step is a fixed-salt, domain-separated HKDF-SHA-256
//! expansion, used to key an HMAC-SHA-256 (via the `hmac` crate) that
//! stands in for the AEAD tag CTR mode carries none of on its own.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt};
use zeroize::Zeroize;

use crate::dek::Dek;
use crate::error::{Error, Result};

const HKDF_SALT: &[u8] = b"s3-proxy-integrity-v1";
const HKDF_INFO: &[u8] = b"file-hmac-key";
const STREAM_CHUNK: usize = 32 * 1024;

/// Verification strictness, configured once per [`Orchestrator`](crate::orchestrator::Orchestrator)
/// instance. `Mode::default()` is `Hybrid`, matching "default hybrid when
/// mode string is empty."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Off,
    Lax,
    Strict,
    #[default]
    Hybrid,
}

impl std::str::FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Ok(Mode::Hybrid),
            "off" => Ok(Mode::Off),
            "lax" => Ok(Mode::Lax),
            "strict" => Ok(Mode::Strict),
            "hybrid" => Ok(Mode::Hybrid),
            other => Err(Error::ConfigInvalid(format!(
                "integrityVerification must be one of off/lax/strict/hybrid, got {other:?}"
            ))),
        }
    }
}

/// Outcome of [`HMACEngine::verify`]. `Passed` covers both "tags matched"
/// and "mode tolerates the mismatch/absence" so callers don't need to
/// inspect the mode themselves to decide whether to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Passed,
    /// `lax` mode swallowed a mismatch; the caller should log it but still
    /// deliver the plaintext.
    PassedWithWarning,
}

#[derive(Clone)]
pub struct HMACEngine {
    mode: Mode,
}

impl HMACEngine {
    pub fn new(mode: Mode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn enabled(&self) -> bool {
        self.mode != Mode::Off
    }

    /// Derive the 32-byte HMAC key from `dek` via HKDF-SHA-256 and start a
    /// fresh [`Calculator`].
    pub fn create_calculator(&self, dek: &Dek) -> Result<Calculator> {
        if dek.is_empty() {
            return Err(Error::HMACKeyDerivation);
        }
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), dek.expose());
        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|_| Error::HMACKeyDerivation)?;
        let mac = <Hmac<Sha256> as Mac>::new_from_slice(&key).map_err(|_| Error::HMACKeyDerivation)?;
        key.zeroize();
        Ok(Calculator { mac: Some(mac) })
    }

    /// Finalize `calc`, snapshotting its tag and zeroing its internal key
    /// material. The calculator must not be used afterwards (enforced by
    /// taking it by value).
    pub fn finalize(&self, calc: Calculator) -> [u8; 32] {
        calc.hash_and_consume()
    }

    /// Verify `calc`'s running tag against `expected` (from stored
    /// metadata, if present), applying this engine's [`Mode`].
    pub fn verify(&self, calc: Calculator, expected: Option<&[u8]>) -> Result<VerifyOutcome> {
        let actual = self.finalize(calc);
        match self.mode {
            Mode::Off => Ok(VerifyOutcome::Passed),
            Mode::Strict => match expected {
                None => Err(Error::HMACMissing),
                Some(exp) => {
                    if bool::from(actual.ct_eq(exp)) {
                        Ok(VerifyOutcome::Passed)
                    } else {
                        Err(Error::HMACMismatch)
                    }
                }
            },
            Mode::Hybrid => match expected {
                None => Ok(VerifyOutcome::Passed),
                Some(exp) => {
                    if bool::from(actual.ct_eq(exp)) {
                        Ok(VerifyOutcome::Passed)
                    } else {
                        Err(Error::HMACMismatch)
                    }
                }
            },
            Mode::Lax => match expected {
                None => Ok(VerifyOutcome::Passed),
                Some(exp) => {
                    if bool::from(actual.ct_eq(exp)) {
                        Ok(VerifyOutcome::Passed)
                    } else {
                        tracing::warn!("HMAC mismatch tolerated under lax verification mode");
                        Ok(VerifyOutcome::PassedWithWarning)
                    }
                }
            },
        }
    }

    /// Zero an arbitrary byte buffer. Exposed so single-part/multipart
    /// callers can scrub plaintext buffers they buffered only to compute an
    /// HMAC over, without reaching into this module's internals.
    pub fn clear(bytes: &mut [u8]) {
        bytes.zeroize();
    }
}

/// An in-progress HMAC-SHA-256 computation over plaintext bytes. Must be fed
/// bytes in strictly ascending order across a multipart upload's parts (see
/// [`crate::multipart`]).
pub struct Calculator {
    mac: Option<Hmac<Sha256>>,
}

impl Calculator {
    pub fn add(&mut self, bytes: &[u8]) -> usize {
        self.mac.as_mut().expect("calculator used after finalize").update(bytes);
        bytes.len()
    }

    /// Drain `reader` in 32 KiB chunks, feeding each chunk into this
    /// calculator, returning the total byte count read.
    pub async fn add_from_stream<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> Result<u64> {
        let mut buf = vec![0u8; STREAM_CHUNK];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.add(&buf[..n]);
            total += n as u64;
        }
        buf.zeroize();
        Ok(total)
    }

    /// Non-destructive snapshot of the current tag.
    pub fn hash(&self) -> [u8; 32] {
        let mac = self.mac.clone().expect("calculator used after finalize");
        let bytes = mac.finalize().into_bytes();
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        out
    }

    fn hash_and_consume(mut self) -> [u8; 32] {
        let out = self.hash();
        self.mac = None;
        out
    }
}

impl Drop for Calculator {
    fn drop(&mut self) {
        // `Hmac<Sha256>` has no public zeroization hook; dropping the
        // `Option` releases the only reference to the derived key material
        // this calculator held. `finalize`/`verify` already null it out on
        // the success path — this covers early-drop error paths.
        self.mac = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dek() -> Dek {
        Dek::from_bytes([7u8; 32])
    }

    #[test]
    fn derivation_fails_on_empty_dek() {
        let engine = HMACEngine::new(Mode::Strict);
        let empty = Dek::from_bytes([0u8; 32]);
        assert!(matches!(engine.create_calculator(&empty), Err(Error::HMACKeyDerivation)));
    }

    #[test]
    fn same_dek_same_plaintext_same_tag() {
        let engine = HMACEngine::new(Mode::Strict);
        let mut c1 = engine.create_calculator(&dek()).unwrap();
        let mut c2 = engine.create_calculator(&dek()).unwrap();
        c1.add(b"hello ");
        c1.add(b"world");
        c2.add(b"hello world");
        assert_eq!(c1.hash(), c2.hash());
    }

    #[test]
    fn strict_mode_requires_expected_tag() {
        let engine = HMACEngine::new(Mode::Strict);
        let calc = engine.create_calculator(&dek()).unwrap();
        assert!(matches!(engine.verify(calc, None), Err(Error::HMACMissing)));
    }

    #[test]
    fn hybrid_mode_accepts_missing_tag() {
        let engine = HMACEngine::new(Mode::Hybrid);
        let calc = engine.create_calculator(&dek()).unwrap();
        assert_eq!(engine.verify(calc, None).unwrap(), VerifyOutcome::Passed);
    }

    #[test]
    fn lax_mode_swallows_mismatch() {
        let engine = HMACEngine::new(Mode::Lax);
        let mut calc = engine.create_calculator(&dek()).unwrap();
        calc.add(b"payload");
        let bogus = [0u8; 32];
        assert_eq!(
            engine.verify(calc, Some(&bogus)).unwrap(),
            VerifyOutcome::PassedWithWarning
        );
    }

    #[test]
    fn strict_mode_rejects_mismatch() {
        let engine = HMACEngine::new(Mode::Strict);
        let mut calc = engine.create_calculator(&dek()).unwrap();
        calc.add(b"payload");
        let bogus = [0u8; 32];
        assert!(matches!(engine.verify(calc, Some(&bogus)), Err(Error::HMACMismatch)));
    }

    #[tokio::test]
    async fn add_from_stream_matches_add() {
        let engine = HMACEngine::new(Mode::Strict);
        let mut c1 = engine.create_calculator(&dek()).unwrap();
        c1.add(b"streamed payload bytes");
        let mut c2 = engine.create_calculator(&dek()).unwrap();
        let cursor = std::io::Cursor::new(b"streamed payload bytes".to_vec());
        c2.add_from_stream(cursor).await.unwrap();
        assert_eq!(c1.hash(), c2.hash());
    }
}
