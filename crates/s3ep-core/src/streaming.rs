//! StreamingReaders: lazy `AsyncRead` transforms that encrypt/decrypt
//! on read, and a validating wrapper that withholds the final plaintext
//! chunk until its HMAC has been checked.
//!
//! `EncryptingReader`/`DecryptingReader` are thin `poll_read` adapters over
//! a [`CtrCipher`](crate::ctr_cipher::CtrCipher) — "read a bounded chunk,
//! transform in place, write it on", expressed as `AsyncRead` impls instead
//! of a `File`-to-`File` loop so they compose with whatever the embedding
//! HTTP layer's response body type is. `HMACValidatingReader` implements a
//! "release nothing until the last chunk's tag checks out" contract, with a
//! safe-direction heuristic for `expected_size`.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use zeroize::Zeroize;

use crate::ctr_cipher::CtrCipher;
use crate::error::Error;
use crate::hmac_engine::{Calculator, HMACEngine, VerifyOutcome};
use crate::stream_io::BoxAsyncRead;

/// Wraps a plaintext source reader and a stateful CTR cipher; each `read`
/// pulls from the source into the caller's buffer and encrypts in place.
/// Does not compute an HMAC — that's the pipeline/session's job, since it
/// may span multiple readers (multipart parts).
pub struct EncryptingReader {
    source: BoxAsyncRead,
    cipher: Box<dyn CtrCipher>,
}

impl EncryptingReader {
    pub fn new(source: BoxAsyncRead, cipher: Box<dyn CtrCipher>) -> Self {
        Self { source, cipher }
    }
}

impl AsyncRead for EncryptingReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.source).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = buf.filled_mut();
                let produced = &mut filled[before..];
                if !produced.is_empty() {
                    let encrypted = this.cipher.encrypt_part(produced);
                    produced.copy_from_slice(&encrypted);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl Drop for EncryptingReader {
    fn drop(&mut self) {
        self.cipher.cleanup();
    }
}

/// Mirror of [`EncryptingReader`] for the download path.
pub struct DecryptingReader {
    source: BoxAsyncRead,
    cipher: Box<dyn CtrCipher>,
}

impl DecryptingReader {
    pub fn new(source: BoxAsyncRead, cipher: Box<dyn CtrCipher>) -> Self {
        Self { source, cipher }
    }
}

impl AsyncRead for DecryptingReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.source).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = buf.filled_mut();
                let produced = &mut filled[before..];
                if !produced.is_empty() {
                    let decrypted = this.cipher.decrypt_part(produced);
                    produced.copy_from_slice(&decrypted);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl Drop for DecryptingReader {
    fn drop(&mut self) {
        self.cipher.cleanup();
    }
}

/// Wraps a [`DecryptingReader`] for download paths that must enforce
/// integrity before the HTTP client sees the last plaintext byte.
///
/// `expected_size` is advisory
/// only in the direction of "buffer earlier, never later" — this reader
/// unconditionally treats the read that produces EOF from the inner source
/// as the final chunk, regardless of whether the byte-count heuristic fired
/// first. A wrong `expected_size` can therefore make verification more
/// conservative (more bytes withheld) but can never release unauthenticated
/// bytes.
pub struct HMACValidatingReader {
    inner: DecryptingReader,
    engine: Arc<HMACEngine>,
    calculator: Option<Calculator>,
    expected_hmac: Option<Vec<u8>>,
    expected_size: i64,
    total_read: u64,
    state: ValidationState,
}

enum ValidationState {
    Streaming,
    /// At least one chunk looked like it might be the last one (per the
    /// `near_end` heuristic); `pending` accumulates every subsequent chunk,
    /// already fed to the HMAC calculator, until the inner reader actually
    /// reaches EOF. Only real EOF triggers `finalize_and_verify` — the
    /// heuristic only controls how early buffering starts, never whether a
    /// chunk is treated as final.
    Buffering { pending: Vec<u8> },
    Released { buf: Vec<u8>, offset: usize },
    Failed,
}

impl HMACValidatingReader {
    pub fn new(
        inner: DecryptingReader,
        engine: Arc<HMACEngine>,
        calculator: Calculator,
        expected_hmac: Vec<u8>,
        expected_size: i64,
    ) -> Self {
        Self {
            inner,
            engine,
            calculator: Some(calculator),
            expected_hmac: Some(expected_hmac),
            expected_size,
            total_read: 0,
            state: ValidationState::Streaming,
        }
    }

    /// Heuristic: once `total_read` is within two chunk-widths of
    /// `expected_size`, start
    /// treating reads as potentially-final so a short last read doesn't slip
    /// past unbuffered. The *actual* decision of "is this the last chunk" is
    /// always EOF from the inner reader, never this heuristic alone — this
    /// only controls how eagerly we start buffering defensively.
    fn near_end(&self, buf_len: usize) -> bool {
        if self.expected_size <= 0 {
            return false;
        }
        let threshold = (self.expected_size as u64).saturating_sub(2 * buf_len as u64);
        self.total_read >= threshold
    }

    fn finalize_and_verify(&mut self, pending: Vec<u8>) {
        let calc = self.calculator.take().expect("calculator consumed twice");
        let expected = self.expected_hmac.take();
        match self.engine.verify(calc, expected.as_deref()) {
            Ok(VerifyOutcome::Passed) | Ok(VerifyOutcome::PassedWithWarning) => {
                self.state = ValidationState::Released { buf: pending, offset: 0 };
            }
            Err(_) => {
                let mut pending = pending;
                pending.zeroize();
                self.state = ValidationState::Failed;
            }
        }
    }
}

impl AsyncRead for HMACValidatingReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ValidationState::Failed => {
                    return Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::InvalidData, Error::HMACMismatch)));
                }
                ValidationState::Released { buf: released, offset } => {
                    let remaining = &released[*offset..];
                    if remaining.is_empty() {
                        return Poll::Ready(Ok(()));
                    }
                    let n = remaining.len().min(buf.remaining());
                    buf.put_slice(&remaining[..n]);
                    *offset += n;
                    return Poll::Ready(Ok(()));
                }
                ValidationState::Streaming | ValidationState::Buffering { .. } => {
                    // Read into a scratch buffer so we can decide, after
                    // seeing the result, whether this was the final (EOF)
                    // read rather than committing the bytes to the caller
                    // first.
                    let mut scratch = vec![0u8; buf.remaining().max(1)];
                    let mut scratch_buf = ReadBuf::new(&mut scratch);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut scratch_buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(())) => {
                            let n = scratch_buf.filled().len();
                            if n == 0 {
                                // Real EOF: finalize over whatever was
                                // buffered (possibly nothing, if no chunk
                                // ever looked near-end) and release it.
                                let pending = match std::mem::replace(&mut this.state, ValidationState::Streaming) {
                                    ValidationState::Buffering { pending } => pending,
                                    _ => Vec::new(),
                                };
                                this.finalize_and_verify(pending);
                                continue;
                            }
                            let chunk = scratch_buf.filled().to_vec();
                            this.total_read += n as u64;
                            let calc = this.calculator.as_mut().expect("calculator consumed twice");
                            calc.add(&chunk);

                            if let ValidationState::Buffering { pending } = &mut this.state {
                                // Already in defensive-buffering mode:
                                // every chunk from here on is held back
                                // until we actually see EOF.
                                pending.extend_from_slice(&chunk);
                                continue;
                            }
                            if this.near_end(chunk.len()) {
                                this.state = ValidationState::Buffering { pending: chunk };
                                continue;
                            }
                            buf.put_slice(&chunk);
                            return Poll::Ready(Ok(()));
                        }
                    }
                }
            }
        }
    }
}
