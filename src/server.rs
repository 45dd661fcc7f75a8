//! Connection-serving loop.
//!
//! [`SimpleServer`] accepts duplex byte streams, binds a protocol pair to
//! each through its factory, and drives the processor until the connection
//! ends. Application-level exceptions (for example an unknown method) keep
//! the connection alive; transport or protocol failures end it.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::processor::Processor;
use crate::protocol::{ProtocolFactory, ProtocolRef};
use crate::transport::{ReaderTransport, WriterTransport};

/// Serves a processor over accepted connections.
pub struct SimpleServer<P> {
    processor: Arc<P>,
    factory: Arc<dyn ProtocolFactory>,
}

impl<P: Processor + 'static> SimpleServer<P> {
    pub fn new(processor: P, factory: impl ProtocolFactory + 'static) -> Self {
        Self {
            processor: Arc::new(processor),
            factory: Arc::new(factory),
        }
    }

    pub fn with_arc(processor: Arc<P>, factory: Arc<dyn ProtocolFactory>) -> Self {
        Self { processor, factory }
    }

    /// Accepts connections from `listener` and spawns a task per connection.
    ///
    /// Individual connection errors are logged and do not stop the loop;
    /// the loop ends when the listener is exhausted.
    pub async fn serve<L, S>(&self, mut listener: L) -> Result<()>
    where
        L: futures::Stream<Item = std::io::Result<S>> + Unpin,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        while let Some(conn) = listener.next().await {
            match conn {
                Ok(io) => {
                    let server = self.clone_for_spawn();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(io).await {
                            error!(%err, "connection error");
                        }
                    });
                }
                Err(err) => {
                    error!(%err, "accept error");
                }
            }
        }
        Ok(())
    }

    /// Serves one connection until EOF or a fatal error.
    pub async fn handle_connection<S>(&self, io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let iprot: ProtocolRef = Arc::new(Mutex::new(
            self.factory
                .protocol(Box::new(ReaderTransport::new(read_half))),
        ));
        let oprot: ProtocolRef = Arc::new(Mutex::new(
            self.factory
                .protocol(Box::new(WriterTransport::new(write_half))),
        ));

        loop {
            let ctx = Context::new();
            let (_handled, result) = self.processor.process(&ctx, &iprot, &oprot).await;
            match result {
                Ok(()) => {}
                Err(Error::Eof) => return Ok(()),
                Err(Error::Transport(t)) => {
                    use crate::error::TransportErrorKind;
                    if t.kind() == TransportErrorKind::EndOfFile {
                        return Ok(());
                    }
                    return Err(Error::Transport(t));
                }
                Err(Error::Application(err)) => {
                    // The frame was answered with an exception; the
                    // connection is still usable.
                    debug!(%err, "application exception");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn clone_for_spawn(&self) -> Self {
        Self {
            processor: self.processor.clone(),
            factory: self.factory.clone(),
        }
    }
}
