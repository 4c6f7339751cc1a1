//! Per-object secret material: the Data Encryption Key and the IV/nonce
//! seed that accompanies it.
//!
//! Backed by `secrecy::Secret<[u8; 32]>`, generated from `OsRng`, exposed
//! only via `expose_secret`. Every exit path — success, error, `abort`,
//! `expire` — must leave the bytes zeroed; `Dek`/`Iv` enforce that via
//! `Drop` instead of relying on callers to remember to call a `cleanup`
//! method.

use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use zeroize::Zeroize;

/// A 32-byte Data Encryption Key, owned exclusively by whichever component
/// generated it (a [`SinglePartPipeline`](crate::single_part::SinglePartPipeline)
/// call or a multipart [`Session`](crate::multipart::Session)).
#[derive(Clone)]
pub struct Dek(Secret<[u8; 32]>);

impl Dek {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(Secret::new(bytes))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Secret::new(bytes))
    }

    pub fn expose(&self) -> &[u8; 32] {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().iter().all(|b| *b == 0)
    }
}

impl std::fmt::Debug for Dek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Dek(..)")
    }
}

/// A 16-byte IV/counter seed (CTR mode) or the 96-bit GCM nonce padded into
/// the same storage. Not itself secret (it is stored in object metadata in
/// the clear), but zeroized on drop anyway since it is derived alongside the
/// DEK and shares its lifetime inside a session.
#[derive(Clone, Copy)]
pub struct Iv(pub [u8; 16]);

impl Iv {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn zero() -> Self {
        Self([0u8; 16])
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Explicit zeroization for session/pipeline cleanup paths. `Iv` is
    /// `Copy` (it is handed around by value between the cipher and the
    /// session that owns it) and so cannot also implement `Drop`; callers
    /// that need "IV is all-zero after abort/cleanup/expire" must call this
    /// on every stored copy they are retiring.
    pub fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Iv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Iv(..)")
    }
}
