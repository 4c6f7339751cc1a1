//! Shared async I/O aliases used across the provider, pipeline, and
//! streaming-reader modules.

use std::pin::Pin;

use tokio::io::AsyncRead;

/// A boxed, pinned, owned async byte source. Because the box is already
/// pinned, wrappers that hold one as a field don't need pin-projection —
/// they just forward through `as_mut()`.
pub type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send>>;

pub fn box_reader<R: AsyncRead + Send + 'static>(reader: R) -> BoxAsyncRead {
    Box::pin(reader)
}
