//! Stream that replays bytes already consumed from its transport

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Transport wrapper serving a retained prefix before the transport itself
///
/// Classification reads the first record header off the wire; the handshake
/// then runs on a `Rewind` so it still sees those bytes. Writes always go
/// straight to the transport.
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Option<Bytes>,
    inner: S,
}

impl<S> Rewind<S> {
    /// Wrap a transport with nothing to replay
    pub fn new(inner: S) -> Self {
        Self { prefix: None, inner }
    }

    /// Wrap a transport that will first yield `prefix`
    pub fn with_prefix(inner: S, prefix: Bytes) -> Self {
        let prefix = if prefix.is_empty() { None } else { Some(prefix) };
        Self { prefix, inner }
    }

    /// Replace the replay buffer
    ///
    /// Any bytes still pending from a previous prefix are kept in front.
    pub fn rewind(&mut self, prefix: Bytes) {
        if prefix.is_empty() {
            return;
        }
        self.prefix = match self.prefix.take() {
            Some(pending) => {
                let mut joined = Vec::with_capacity(pending.len() + prefix.len());
                joined.extend_from_slice(&pending);
                joined.extend_from_slice(&prefix);
                Some(Bytes::from(joined))
            }
            None => Some(prefix),
        };
    }

    /// Bytes still waiting to be replayed
    pub fn pending(&self) -> usize {
        self.prefix.as_ref().map_or(0, Bytes::len)
    }

    /// Underlying transport
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Underlying transport, mutably
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap, returning the transport and any unread prefix
    pub fn into_parts(self) -> (S, Bytes) {
        (self.inner, self.prefix.unwrap_or_default())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            if !prefix.is_empty() {
                let n = prefix.len().min(buf.remaining());
                buf.put_slice(&prefix[..n]);
                prefix.advance(n);
                if !prefix.is_empty() {
                    self.prefix = Some(prefix);
                }
                return Poll::Ready(Ok(()));
            }
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_prefix_served_first() {
        let (mut near, far) = tokio::io::duplex(64);
        near.write_all(b" world").await.unwrap();
        drop(near);

        let mut stream = Rewind::with_prefix(far, Bytes::from_static(b"hello"));
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_partial_prefix_reads() {
        let (_near, far) = tokio::io::duplex(64);
        let mut stream = Rewind::with_prefix(far, Bytes::from_static(&[1, 2, 3, 4, 5]));

        let mut small = [0u8; 3];
        stream.read_exact(&mut small).await.unwrap();
        assert_eq!(small, [1, 2, 3]);
        assert_eq!(stream.pending(), 2);

        let mut rest = [0u8; 2];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest, [4, 5]);
        assert_eq!(stream.pending(), 0);
    }

    #[tokio::test]
    async fn test_writes_bypass_prefix() {
        let (mut near, far) = tokio::io::duplex(64);
        let mut stream = Rewind::with_prefix(far, Bytes::from_static(b"queued"));

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(stream.pending(), 6);
    }

    #[test]
    fn test_rewind_keeps_pending_in_front() {
        let (_near, far) = tokio::io::duplex(8);
        let mut stream = Rewind::with_prefix(far, Bytes::from_static(b"ab"));
        stream.rewind(Bytes::from_static(b"cd"));
        let (_, prefix) = stream.into_parts();
        assert_eq!(&prefix[..], b"abcd");
    }
}
