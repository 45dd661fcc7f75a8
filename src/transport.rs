//! Byte-level transport abstraction.
//!
//! A [`Transport`] is the ordered byte pipe every message frame travels
//! over. The runtime consumes this interface; concrete transports are
//! expected to come from the surrounding application (sockets, pipes,
//! in-memory duplexes). [`ReaderTransport`] and [`WriterTransport`] adapt
//! one half of a split connection each, which is how a single duplex
//! connection is shared between an input and an output protocol without a
//! read ever blocking a write.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::context::Context;
use crate::error::{Error, Result, TransportError, TransportErrorKind};

/// The byte transport contract.
///
/// `write_context` is invoked once per outgoing message, before the flush,
/// and is the hook for propagating per-message deadlines or metadata into
/// the transport. Transports that have no use for it keep the default no-op.
#[async_trait]
pub trait Transport: Send {
    /// Opens the transport for communication.
    async fn open(&mut self) -> Result<()>;

    /// Returns true if the transport is open.
    fn is_open(&self) -> bool;

    /// Reads up to `buf.len()` bytes, returning the count read.
    ///
    /// A return of zero for a non-empty buffer means end of file; callers
    /// that need exact reads treat it as such.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes the whole buffer.
    async fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Flushes buffered bytes to the peer.
    async fn flush(&mut self) -> Result<()>;

    /// Closes the transport.
    async fn close(&mut self) -> Result<()>;

    /// Per-message deadline/metadata hook, called before each flush.
    async fn write_context(&mut self, ctx: &Context) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn open(&mut self) -> Result<()> {
        (**self).open().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf).await
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write(buf).await
    }

    async fn flush(&mut self) -> Result<()> {
        (**self).flush().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    async fn write_context(&mut self, ctx: &Context) -> Result<()> {
        (**self).write_context(ctx).await
    }
}

fn read_only_error() -> Error {
    Error::Transport(TransportError::new(
        TransportErrorKind::NotOpen,
        "transport is read-only",
    ))
}

fn write_only_error() -> Error {
    Error::Transport(TransportError::new(
        TransportErrorKind::NotOpen,
        "transport is write-only",
    ))
}

/// Read half of a connection as a [`Transport`].
///
/// Write-side operations fail with a `NotOpen` transport error.
pub struct ReaderTransport<R> {
    reader: R,
    open: bool,
}

impl<R: AsyncRead + Send + Unpin> ReaderTransport<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, open: true }
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> Transport for ReaderTransport<R> {
    async fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.reader.read(buf).await?;
        Ok(n)
    }

    async fn write(&mut self, _buf: &[u8]) -> Result<()> {
        Err(read_only_error())
    }

    async fn flush(&mut self) -> Result<()> {
        Err(read_only_error())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

/// Write half of a connection as a [`Transport`].
///
/// Read-side operations fail with a `NotOpen` transport error.
pub struct WriterTransport<W> {
    writer: W,
    open: bool,
}

impl<W: AsyncWrite + Send + Unpin> WriterTransport<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, open: true }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> Transport for WriterTransport<W> {
    async fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(write_only_error())
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_all(buf).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        let _ = self.writer.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_transport_rejects_writes() {
        let (_w, r) = tokio::io::duplex(64);
        let mut t = ReaderTransport::new(r);
        assert!(t.is_open());
        assert!(t.write(b"x").await.is_err());
        assert!(t.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_writer_transport_rejects_reads() {
        let (w, _r) = tokio::io::duplex(64);
        let mut t = WriterTransport::new(w);
        let mut buf = [0u8; 4];
        assert!(t.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_reader_writer_round_trip() {
        let (a, b) = tokio::io::duplex(64);
        let (rx, _atx) = tokio::io::split(a);
        let (_brx, tx) = tokio::io::split(b);
        let mut reader = ReaderTransport::new(rx);
        let mut writer = WriterTransport::new(tx);

        writer.write(b"hello").await.unwrap();
        writer.flush().await.unwrap();

        let mut buf = [0u8; 5];
        let mut read = 0;
        while read < 5 {
            let n = reader.read(&mut buf[read..]).await.unwrap();
            assert!(n > 0);
            read += n;
        }
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_writer_close_marks_not_open() {
        let (w, _r) = tokio::io::duplex(64);
        let mut t = WriterTransport::new(w);
        t.close().await.unwrap();
        assert!(!t.is_open());
    }
}
