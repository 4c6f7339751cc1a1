//! MetadataCodec: encode/decode the per-object encryption envelope
//! carried in S3 object metadata.
//!
//! Every core key is `<prefix><field>` (default prefix `s3ep-`). All byte
//! fields are standard-alphabet base64. Readers accept the unprefixed key as
//! a legacy fallback; writers always emit the prefixed form. Shaped as a
//! plain string-keyed map rather than a binary wire struct, since that's
//! what an S3 `x-amz-meta-*` header set actually is.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{Error, Result};

pub const DEFAULT_PREFIX: &str = "s3ep-";

const FIELD_DEK_ALGORITHM: &str = "dek-algorithm";
const FIELD_ENCRYPTED_DEK: &str = "encrypted-dek";
const FIELD_AES_IV: &str = "aes-iv";
const FIELD_KEK_ALGORITHM: &str = "kek-algorithm";
const FIELD_KEK_FINGERPRINT: &str = "kek-fingerprint";
const FIELD_HMAC: &str = "hmac";

/// Keys (without prefix) this codec recognizes as belonging to the
/// encryption envelope, including two client-content-negotiation keys that
/// aren't produced by `build` but must still be stripped for clients.
const ENCRYPTION_KEY_WHITELIST: &[&str] = &[
    FIELD_DEK_ALGORITHM,
    FIELD_ENCRYPTED_DEK,
    FIELD_AES_IV,
    FIELD_KEK_ALGORITHM,
    FIELD_KEK_FINGERPRINT,
    FIELD_HMAC,
    "algorithm",
    "content-type",
    "encryption-mode",
];

/// A per-object metadata map (what the HTTP layer hands us, and what we hand
/// back). Ordered so that tests and debug output are deterministic.
pub type Metadata = BTreeMap<String, String>;

#[derive(Clone)]
pub struct MetadataCodec {
    prefix: String,
}

impl Default for MetadataCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl MetadataCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn prefixed(&self, field: &str) -> String {
        format!("{}{}", self.prefix, field)
    }

    fn get_str(&self, map: &Metadata, field: &'static str) -> Result<String> {
        if let Some(v) = map.get(&self.prefixed(field)) {
            return Ok(v.clone());
        }
        if let Some(v) = map.get(field) {
            return Ok(v.clone());
        }
        Err(Error::MetadataMissing(field))
    }

    fn get_bytes(&self, map: &Metadata, field: &'static str) -> Result<Vec<u8>> {
        let encoded = self.get_str(map, field)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(|_| Error::MetadataCorrupt(field))
    }

    /// Build the envelope map for a freshly encrypted object.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &self,
        encrypted_dek: &[u8],
        iv: &[u8],
        dek_algorithm: &str,
        kek_fingerprint: &str,
        kek_algorithm: &str,
    ) -> Metadata {
        let mut map = Metadata::new();
        map.insert(self.prefixed(FIELD_DEK_ALGORITHM), dek_algorithm.to_ascii_lowercase());
        map.insert(self.prefixed(FIELD_ENCRYPTED_DEK), STANDARD.encode(encrypted_dek));
        map.insert(self.prefixed(FIELD_AES_IV), STANDARD.encode(iv));
        map.insert(self.prefixed(FIELD_KEK_FINGERPRINT), kek_fingerprint.to_string());
        map.insert(self.prefixed(FIELD_KEK_ALGORITHM), kek_algorithm.to_ascii_lowercase());
        map
    }

    pub fn get_encrypted_dek(&self, map: &Metadata) -> Result<Vec<u8>> {
        self.get_bytes(map, FIELD_ENCRYPTED_DEK)
    }

    pub fn get_iv(&self, map: &Metadata) -> Result<Vec<u8>> {
        self.get_bytes(map, FIELD_AES_IV)
    }

    pub fn get_fingerprint(&self, map: &Metadata) -> Result<String> {
        self.get_str(map, FIELD_KEK_FINGERPRINT)
    }

    pub fn get_dek_algorithm(&self, map: &Metadata) -> Result<String> {
        self.get_str(map, FIELD_DEK_ALGORITHM)
    }

    pub fn get_kek_algorithm(&self, map: &Metadata) -> Result<String> {
        self.get_str(map, FIELD_KEK_ALGORITHM)
    }

    pub fn set_hmac(&self, map: &mut Metadata, hmac: &[u8]) {
        map.insert(self.prefixed(FIELD_HMAC), STANDARD.encode(hmac));
    }

    /// Returns `None` rather than erroring — absence of `hmac` is a normal,
    /// mode-dependent state (see [`crate::hmac_engine`]), not a corrupt
    /// object.
    pub fn get_hmac(&self, map: &Metadata) -> Result<Option<Vec<u8>>> {
        match self.get_bytes(map, FIELD_HMAC) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(Error::MetadataMissing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Strip every key under our prefix (and the unprefixed whitelist, for
    /// legacy objects) so end-clients never see envelope internals.
    pub fn filter_client(&self, map: &Metadata) -> Metadata {
        map.iter()
            .filter(|(k, _)| !self.is_encryption_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// True if `key` (prefixed or not) names a field this codec owns.
    pub fn is_encryption_key(&self, key: &str) -> bool {
        if let Some(stripped) = key.strip_prefix(self.prefix.as_str()) {
            return ENCRYPTION_KEY_WHITELIST.contains(&stripped);
        }
        ENCRYPTION_KEY_WHITELIST.contains(&key)
    }

    /// True if `map` carries no field under our prefix — the signal the
    /// [`Orchestrator`](crate::orchestrator::Orchestrator) uses to treat an
    /// object as legacy/unencrypted and pass it through untouched.
    pub fn has_no_envelope(&self, map: &Metadata) -> bool {
        !map.keys().any(|k| k.starts_with(self.prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_round_trips_through_accessors() {
        let codec = MetadataCodec::default();
        let map = codec.build(b"wrapped-dek-bytes", b"0123456789abcdef", "aes-ctr", "fp-1", "aes-wrap");

        assert_eq!(codec.get_encrypted_dek(&map).unwrap(), b"wrapped-dek-bytes");
        assert_eq!(codec.get_iv(&map).unwrap(), b"0123456789abcdef");
        assert_eq!(codec.get_fingerprint(&map).unwrap(), "fp-1");
        assert_eq!(codec.get_dek_algorithm(&map).unwrap(), "aes-ctr");
        assert_eq!(codec.get_kek_algorithm(&map).unwrap(), "aes-wrap");
        assert_eq!(codec.get_hmac(&map).unwrap(), None);
    }

    #[test]
    fn missing_field_is_reported_by_name() {
        let codec = MetadataCodec::default();
        let map = Metadata::new();
        match codec.get_encrypted_dek(&map) {
            Err(Error::MetadataMissing(field)) => assert_eq!(field, FIELD_ENCRYPTED_DEK),
            other => panic!("expected MetadataMissing, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_base64_is_reported_by_name() {
        let codec = MetadataCodec::default();
        let mut map = Metadata::new();
        map.insert(codec.prefixed(FIELD_AES_IV), "not base64!!".to_string());
        match codec.get_iv(&map) {
            Err(Error::MetadataCorrupt(field)) => assert_eq!(field, FIELD_AES_IV),
            other => panic!("expected MetadataCorrupt, got {other:?}"),
        }
    }

    #[test]
    fn legacy_unprefixed_keys_are_read_but_never_written() {
        let codec = MetadataCodec::default();
        let mut map = Metadata::new();
        map.insert(FIELD_KEK_FINGERPRINT.to_string(), "legacy-fp".to_string());
        assert_eq!(codec.get_fingerprint(&map).unwrap(), "legacy-fp");

        let built = codec.build(b"x", b"y", "aes-gcm", "fp", "aes-wrap");
        assert!(!built.contains_key(FIELD_KEK_FINGERPRINT));
        assert!(built.contains_key("s3ep-kek-fingerprint"));
    }

    #[test]
    fn filter_client_strips_prefixed_and_legacy_whitelisted_keys() {
        let codec = MetadataCodec::default();
        let mut map = codec.build(b"x", b"y", "aes-gcm", "fp", "aes-wrap");
        map.insert("content-disposition".to_string(), "attachment".to_string());
        map.insert("algorithm".to_string(), "legacy-leak".to_string());

        let filtered = codec.filter_client(&map);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("content-disposition").unwrap(), "attachment");
    }

    #[test]
    fn has_no_envelope_detects_legacy_objects() {
        let codec = MetadataCodec::default();
        let mut map = Metadata::new();
        assert!(codec.has_no_envelope(&map));
        map.insert("content-type".to_string(), "text/plain".to_string());
        assert!(codec.has_no_envelope(&map));
        map.insert("s3ep-dek-algorithm".to_string(), "aes-gcm".to_string());
        assert!(!codec.has_no_envelope(&map));
    }
}
