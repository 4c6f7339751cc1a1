//! The data-encryption interface: a stateful AES-256-CTR stream cipher
//! whose counter persists across calls, so that repeated
//! `encrypt_part`/`decrypt_part` calls over an object's parts produce one
//! contiguous keystream — the property multipart sessions rely on to keep
//! the whole upload as a single CTR stream no matter how it was split.
//!
//! The concrete AES-GCM/AES-CTR primitives are treated as a narrow,
//! swappable interface rather than baked directly into the callers.
//! [`CtrCipher`] is that interface; [`Aes256CtrCipher`] is the one concrete
//! implementation this workspace ships, built on RustCrypto's `aes` + `ctr`
//! crates.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::dek::{Dek, Iv};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Stateful counter-mode cipher: `encrypt_part`/`decrypt_part` are the same
/// XOR-with-keystream operation (CTR is its own inverse), but kept as two
/// names to match each call site's intent.
pub trait CtrCipher: Send {
    fn encrypt_part(&mut self, plaintext: &[u8]) -> Vec<u8>;
    fn decrypt_part(&mut self, ciphertext: &[u8]) -> Vec<u8>;
    fn get_iv(&self) -> Iv;
    fn cleanup(&mut self);
}

pub struct Aes256CtrCipher {
    cipher: Aes256Ctr,
    iv: Iv,
}

impl Aes256CtrCipher {
    /// Construct a cipher with a freshly generated IV seed.
    pub fn new(dek: &Dek) -> Self {
        let iv = Iv::generate();
        Self::new_with_iv(dek, iv)
    }

    /// Construct a cipher seeded from an existing IV (the download path,
    /// where the IV comes from stored metadata).
    pub fn new_with_iv(dek: &Dek, iv: Iv) -> Self {
        let cipher = Aes256Ctr::new(dek.expose().into(), iv.as_bytes().into());
        Self { cipher, iv }
    }
}

impl CtrCipher for Aes256CtrCipher {
    fn encrypt_part(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let mut buf = plaintext.to_vec();
        self.cipher.apply_keystream(&mut buf);
        buf
    }

    fn decrypt_part(&mut self, ciphertext: &[u8]) -> Vec<u8> {
        // CTR: decryption is identical to encryption.
        self.encrypt_part(ciphertext)
    }

    fn get_iv(&self) -> Iv {
        self.iv
    }

    fn cleanup(&mut self) {
        self.iv.zeroize();
    }
}
