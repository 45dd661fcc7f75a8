//! In-memory transports and helpers for testing services without sockets.

use std::sync::Arc;

use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream};

use crate::binary::BinaryProtocol;
use crate::client::SyncClient;
use crate::middleware::Middleware;
use crate::protocol::{protocol_ref, ProtocolRef};
use crate::transport::{ReaderTransport, WriterTransport};

/// Default buffer size for in-memory pipes.
const PIPE_BUFFER: usize = 64 * 1024;

/// Creates a pair of connected in-memory duplex streams.
///
/// Returns `(client_io, server_io)`.
pub fn pipe() -> (DuplexStream, DuplexStream) {
    duplex(PIPE_BUFFER)
}

/// Binds an input and an output binary protocol to the two halves of `io`.
pub fn binary_protocol_pair<S>(io: S) -> (ProtocolRef, ProtocolRef)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    (
        protocol_ref(BinaryProtocol::new(ReaderTransport::new(read_half))),
        protocol_ref(BinaryProtocol::new(WriterTransport::new(write_half))),
    )
}

/// Builds a [`SyncClient`] speaking binary protocol over `io`.
pub fn sync_client<S>(io: S, middlewares: Vec<Arc<dyn Middleware>>) -> SyncClient
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (iprot, oprot) = binary_protocol_pair(io);
    SyncClient::new(iprot, oprot, middlewares)
}
