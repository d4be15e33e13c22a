//! The canonical chunk stream handed back to callers, plus the cooperative
//! cancellation handle threaded through every normalizer.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use futures::Stream;

use crate::errors::ProviderError;
use crate::models::chunk::StreamChunk;

pub type BoxChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Shared abort flag. Normalizers check it at every read/yield boundary and
/// terminate silently when it is set; aborting is never surfaced as an error.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A lazy sequence of canonical chunks wrapping one provider response.
///
/// At most one consumption is permitted: several providers' native streams
/// are themselves single-pass, so a second `consume` is a contract violation
/// and fails with [`ProviderError::StreamConsumed`].
pub struct ChunkStream {
    inner: Option<BoxChunkStream>,
    abort: AbortHandle,
}

impl ChunkStream {
    pub fn new<S>(inner: S, abort: AbortHandle) -> Self
    where
        S: Stream<Item = Result<StreamChunk>> + Send + 'static,
    {
        ChunkStream {
            inner: Some(Box::pin(inner)),
            abort,
        }
    }

    /// The cancellation handle for this stream. Aborting it ends iteration
    /// cleanly without an error.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Take the underlying stream for iteration. Fails on the second call.
    pub fn consume(&mut self) -> Result<BoxChunkStream, ProviderError> {
        self.inner.take().ok_or(ProviderError::StreamConsumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_single_consumption() {
        let chunks = futures::stream::iter(vec![Ok(StreamChunk::MessageStart)]);
        let mut stream = ChunkStream::new(chunks, AbortHandle::new());

        let first = stream.consume();
        assert!(first.is_ok());

        let second = stream.consume();
        assert!(matches!(second, Err(ProviderError::StreamConsumed)));
    }

    #[tokio::test]
    async fn test_consumed_stream_yields_items() {
        let chunks = futures::stream::iter(vec![
            Ok(StreamChunk::MessageStart),
            Ok(StreamChunk::ContentBlockStop { index: 0 }),
        ]);
        let mut stream = ChunkStream::new(chunks, AbortHandle::new());

        let collected: Vec<_> = stream.consume().unwrap().collect().await;
        assert_eq!(collected.len(), 2);
    }

    #[test]
    fn test_abort_handle_shared_state() {
        let handle = AbortHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_aborted());
        clone.abort();
        assert!(handle.is_aborted());
    }
}
