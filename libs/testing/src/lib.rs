//! Test utilities shared across the workspace.
//!
//! - [`HandleCounter`] / [`TrackedStream`]: count how many stream handles were
//!   opened and how many were dropped, to assert that nothing leaks.
//! - [`tracked_pipe`]: an in-memory duplex pipe whose near end is tracked.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// Default buffer size for in-memory pipes.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Counts opened and closed stream handles.
#[derive(Debug, Default)]
pub struct HandleCounter {
    opened: AtomicU64,
    closed: AtomicU64,
}

impl HandleCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Handles opened but not yet dropped.
    pub fn open(&self) -> u64 {
        self.opened() - self.closed()
    }
}

/// A stream wrapper that records its own drop in a [`HandleCounter`].
#[derive(Debug)]
pub struct TrackedStream<S> {
    inner: S,
    counter: Arc<HandleCounter>,
}

impl<S> TrackedStream<S> {
    pub fn new(inner: S, counter: Arc<HandleCounter>) -> Self {
        counter.opened.fetch_add(1, Ordering::SeqCst);
        Self { inner, counter }
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        self.counter.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Create an in-memory pipe. The first end is tracked by `counter`, the
/// second end is handed to the test as the remote peer.
pub fn tracked_pipe(counter: &Arc<HandleCounter>) -> (TrackedStream<DuplexStream>, DuplexStream) {
    let (near, far) = tokio::io::duplex(DEFAULT_PIPE_CAPACITY);
    (TrackedStream::new(near, Arc::clone(counter)), far)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_counter_tracks_drop() {
        let counter = HandleCounter::new();
        let (mut near, mut far) = tracked_pipe(&counter);
        assert_eq!(counter.open(), 1);

        near.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(near);
        assert_eq!(counter.opened(), 1);
        assert_eq!(counter.closed(), 1);
        assert_eq!(counter.open(), 0);
    }
}
