//! ProviderRegistry: hold multiple KEK providers keyed by fingerprint,
//! expose the active provider for writes and fingerprint-addressed
//! providers for reads, and wrap/unwrap DEKs through them.
//!
//! Concrete KEK providers (AES-wrap, RSA-envelope, KMS clients, "none")
//! are treated as a narrow, pluggable capability — only the trait they
//! implement lives in the orchestration core. [`crate::providers`] ships
//! reference implementations of the two that don't require an external
//! service ("none" and a local AES-wrap) so the rest of this crate is
//! testable end-to-end; RSA-envelope/KMS remain unimplemented by design.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use lru::LruCache;

use crate::dek::Dek;
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::stream_io::BoxAsyncRead;

/// Sentinel fingerprint signaling pure pass-through: no wrapping, no
/// metadata emitted.
pub const NONE_PROVIDER_FINGERPRINT: &str = "none-provider-fingerprint";

/// What an [`EnvelopeEncryptor`] is being built for — whole-object or
/// multipart content. Multipart sessions currently talk to [`KekProvider`]
/// directly rather than through an envelope (see
/// [`crate::multipart::manager`]); the distinction is kept in the trait so a
/// provider that needs to frame AAD differently per content type (an
/// RSA-envelope or KMS provider, say) has somewhere to key off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeContentType {
    Whole,
    Multipart,
}

/// KEK provider contract. Implementations may be backed by a local key,
/// an HSM, or a network KMS call — `wrap`/`unwrap` are async so
/// network-backed providers aren't forced into blocking calls.
#[async_trait]
pub trait KekProvider: Send + Sync {
    /// Opaque identifier routing unwrap requests to this provider instance,
    /// even after the active provider has rotated away from it.
    fn fingerprint(&self) -> &str;

    /// Descriptive tag stored as `kek-algorithm` in object metadata.
    fn algorithm(&self) -> &str;

    /// Wrap `dek`, optionally mixing `object_key` in as AAD. Returns the
    /// wrapped ciphertext.
    async fn wrap(&self, dek: &Dek, object_key: &str) -> Result<Vec<u8>>;

    /// Unwrap a ciphertext produced by [`KekProvider::wrap`] on this same
    /// provider instance.
    async fn unwrap(&self, wrapped: &[u8], object_key: &str) -> Result<Dek>;

    /// Build a streaming envelope encryptor bound to this provider, for the
    /// single-part GCM path.
    fn create_envelope(
        self: Arc<Self>,
        content_type: EnvelopeContentType,
        metadata_prefix: &str,
    ) -> Arc<dyn EnvelopeEncryptor>;
}

/// Streaming whole-object envelope: generates/wraps a DEK, encrypts under
/// GCM, and frames the nonce alongside the ciphertext (or reverses the
/// process on read). See [`crate::providers::envelope::GcmEnvelope`] for the
/// one concrete implementation shipped here.
#[async_trait]
pub trait EnvelopeEncryptor: Send + Sync {
    async fn encrypt_data_stream(
        &self,
        reader: BoxAsyncRead,
        aad: &[u8],
    ) -> Result<(BoxAsyncRead, Vec<u8>, Metadata)>;

    async fn decrypt_data_stream(
        &self,
        reader: BoxAsyncRead,
        wrapped_dek: &[u8],
        iv: Option<&[u8]>,
        aad: &[u8],
    ) -> Result<BoxAsyncRead>;
}

/// Cache key: a provider can wrap the same DEK for different object keys
/// (different AAD) and get different ciphertexts, so the wrap cache keys on
/// `(fingerprint, object_key)` and the unwrap cache on
/// `(fingerprint, wrapped_dek)`.
type WrapCacheKey = (String, String);
type UnwrapCacheKey = (String, Vec<u8>);

const DEFAULT_CACHE_CAPACITY: usize = 256;

pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn KekProvider>>>,
    active_fingerprint: RwLock<String>,
    wrap_cache: Mutex<LruCache<WrapCacheKey, (Vec<u8>, String)>>,
    unwrap_cache: Mutex<LruCache<UnwrapCacheKey, [u8; 32]>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        let cap = std::num::NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap();
        Self {
            providers: RwLock::new(HashMap::new()),
            active_fingerprint: RwLock::new(NONE_PROVIDER_FINGERPRINT.to_string()),
            wrap_cache: Mutex::new(LruCache::new(cap)),
            unwrap_cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Register `provider` under its own fingerprint. Does not change the
    /// active provider — call [`ProviderRegistry::set_active`] for that.
    pub fn register(&self, provider: Arc<dyn KekProvider>) {
        self.providers
            .write()
            .unwrap()
            .insert(provider.fingerprint().to_string(), provider);
    }

    pub fn set_active(&self, fingerprint: &str) -> Result<()> {
        if fingerprint != NONE_PROVIDER_FINGERPRINT && !self.providers.read().unwrap().contains_key(fingerprint) {
            return Err(Error::ConfigInvalid(format!(
                "cannot activate unregistered provider {fingerprint:?}"
            )));
        }
        *self.active_fingerprint.write().unwrap() = fingerprint.to_string();
        Ok(())
    }

    pub fn active_fingerprint(&self) -> String {
        self.active_fingerprint.read().unwrap().clone()
    }

    pub fn is_none_provider(&self) -> bool {
        self.active_fingerprint() == NONE_PROVIDER_FINGERPRINT
    }

    /// Enumerate `(fingerprint, algorithm)` for every registered provider,
    /// for diagnostics/`stats()`.
    pub fn summary(&self) -> Vec<(String, String)> {
        self.providers
            .read()
            .unwrap()
            .values()
            .map(|p| (p.fingerprint().to_string(), p.algorithm().to_string()))
            .collect()
    }

    fn resolve(&self, fingerprint: &str, kek_algorithm: &str, object_key: &str) -> Result<Arc<dyn KekProvider>> {
        self.providers
            .read()
            .unwrap()
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| Error::ProviderMissing {
                fingerprint: fingerprint.to_string(),
                kek_algorithm: kek_algorithm.to_string(),
                object_key: object_key.to_string(),
            })
    }

    fn active(&self) -> Result<Arc<dyn KekProvider>> {
        let fp = self.active_fingerprint();
        self.resolve(&fp, "unknown", "<active-provider-lookup>")
    }

    /// Wrap `dek` under the active provider, returning `(wrapped, algorithm,
    /// fingerprint)`.
    pub async fn wrap_active(&self, dek: &Dek, object_key: &str) -> Result<(Vec<u8>, String, String)> {
        let provider = self.active()?;
        let fp = provider.fingerprint().to_string();
        let cache_key: WrapCacheKey = (fp.clone(), object_key.to_string());
        if let Some(hit) = self.wrap_cache.lock().unwrap().get(&cache_key).cloned() {
            return Ok((hit.0, hit.1, fp));
        }
        let wrapped = provider.wrap(dek, object_key).await?;
        let algo = provider.algorithm().to_string();
        self.wrap_cache
            .lock()
            .unwrap()
            .put(cache_key, (wrapped.clone(), algo.clone()));
        Ok((wrapped, algo, fp))
    }

    /// Wrap `dek` via the provider addressed by `fingerprint` rather than
    /// whichever provider is currently active. Multipart sessions capture
    /// their fingerprint at `initiate` time (all parts of a multipart
    /// upload must commit to one provider), so `finalize` must wrap under that captured
    /// provider even if the registry's active provider has rotated away
    /// from it in the meantime.
    pub async fn wrap_with(&self, fingerprint: &str, dek: &Dek, object_key: &str) -> Result<(Vec<u8>, String)> {
        let provider = self.resolve(fingerprint, "unknown", object_key)?;
        let cache_key: WrapCacheKey = (fingerprint.to_string(), object_key.to_string());
        if let Some(hit) = self.wrap_cache.lock().unwrap().get(&cache_key).cloned() {
            return Ok(hit);
        }
        let wrapped = provider.wrap(dek, object_key).await?;
        let algo = provider.algorithm().to_string();
        self.wrap_cache.lock().unwrap().put(cache_key, (wrapped.clone(), algo.clone()));
        Ok((wrapped, algo))
    }

    /// Unwrap `wrapped` via the provider addressed by `fingerprint`.
    pub async fn unwrap(&self, wrapped: &[u8], fingerprint: &str, kek_algorithm: &str, object_key: &str) -> Result<Dek> {
        let cache_key: UnwrapCacheKey = (fingerprint.to_string(), wrapped.to_vec());
        if let Some(hit) = self.unwrap_cache.lock().unwrap().get(&cache_key).copied() {
            return Ok(Dek::from_bytes(hit));
        }
        let provider = self.resolve(fingerprint, kek_algorithm, object_key)?;
        let dek = provider.unwrap(wrapped, object_key).await?;
        self.unwrap_cache.lock().unwrap().put(cache_key, *dek.expose());
        Ok(dek)
    }

    /// Build an envelope encryptor bound to the provider addressed by
    /// `fingerprint`, for GCM decrypt — object metadata carries the
    /// fingerprint the object was originally wrapped under, which may no
    /// longer be the active provider after a rotation.
    pub fn create_envelope_for(
        &self,
        fingerprint: &str,
        kek_algorithm: &str,
        object_key: &str,
        content_type: EnvelopeContentType,
        metadata_prefix: &str,
    ) -> Result<Arc<dyn EnvelopeEncryptor>> {
        let provider = self.resolve(fingerprint, kek_algorithm, object_key)?;
        Ok(provider.create_envelope(content_type, metadata_prefix))
    }

    /// Build an envelope encryptor bound to the active provider, for the
    /// single-part GCM path.
    pub fn create_active_envelope(&self, content_type: EnvelopeContentType, metadata_prefix: &str) -> Result<Arc<dyn EnvelopeEncryptor>> {
        Ok(self.active()?.create_envelope(content_type, metadata_prefix))
    }

    /// Drop every cached wrap/unwrap entry.
    pub fn clear_caches(&self) {
        self.wrap_cache.lock().unwrap().clear();
        self.unwrap_cache.lock().unwrap().clear();
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
