//! The inbound build context stream.
//!
//! A [`BuildSource`] is single-pass: it is handed to exactly one reader
//! (the backend) and is neither `Clone` nor rewindable. Chunks are
//! yielded as they arrive from the transport, so memory stays bounded
//! by the transport's chunk size rather than the archive size.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use futures::stream::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

/// A type-erased, fallible stream of byte chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Single-reader stream over the uploaded build context.
pub struct BuildSource {
    inner: ByteStream,
    bytes_read: u64,
    finished: bool,
}

impl BuildSource {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self::from_boxed(Box::pin(stream))
    }

    pub fn from_boxed(inner: ByteStream) -> Self {
        Self {
            inner,
            bytes_read: 0,
            finished: false,
        }
    }

    /// A source over an in-memory buffer, yielded as a single chunk.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let chunks: Vec<io::Result<Bytes>> = if data.is_empty() {
            Vec::new()
        } else {
            vec![Ok(data)]
        };
        Self::new(futures::stream::iter(chunks))
    }

    /// Next chunk from the client, or `None` at end of stream.
    ///
    /// Empty chunks are skipped. After `None` has been returned once the
    /// source stays exhausted.
    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        self.next().await
    }

    /// Total bytes yielded so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Whether end of stream has been observed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Adapt the source into an [`AsyncRead`].
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        StreamReader::new(self)
    }
}

impl Stream for BuildSource {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) if chunk.is_empty() => continue,
                Poll::Ready(Some(Ok(chunk))) => {
                    this.bytes_read += chunk.len() as u64;
                    return Poll::Ready(Some(Ok(chunk)));
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for BuildSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildSource")
            .field("bytes_read", &self.bytes_read)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn chunked(parts: &[&'static [u8]]) -> BuildSource {
        let items: Vec<io::Result<Bytes>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        BuildSource::new(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn yields_chunks_in_order_and_counts() {
        let mut source = chunked(&[b"abc", b"", b"de"]);
        assert_eq!(source.next_chunk().await.unwrap().unwrap(), "abc");
        assert_eq!(source.next_chunk().await.unwrap().unwrap(), "de");
        assert!(source.next_chunk().await.is_none());
        assert!(source.is_finished());
        assert_eq!(source.bytes_read(), 5);
        assert!(source.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn empty_source_finishes_immediately() {
        let mut source = BuildSource::from_bytes(Bytes::new());
        assert!(source.next_chunk().await.is_none());
        assert_eq!(source.bytes_read(), 0);
    }

    #[tokio::test]
    async fn errors_are_passed_through() {
        let items: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"x")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let mut source = BuildSource::new(futures::stream::iter(items));
        assert!(source.next_chunk().await.unwrap().is_ok());
        let err = source.next_chunk().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn async_read_adapter_reads_everything() {
        let source = chunked(&[b"hello ", b"world"]);
        let mut reader = source.into_async_read();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }
}
