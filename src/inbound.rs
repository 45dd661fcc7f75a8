//! Receiver side of a uni-directional stream.
//!
//! The receiver consumes data frames until either side half-closes. A
//! peer-initiated close arrives as a GOAWAY frame during receive; a
//! locally-initiated close sends GOAWAY and drains in-flight frames until
//! the peer's ACK arrives.

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{Error, ProtocolError, ProtocolErrorKind, Result};
use crate::message::{MessageType, TType};
use crate::protocol::{skip, ProtocolRef, Request};
use crate::stream::{parse_stream_error, BaseStream, Closer, InboundStream};

pub(crate) struct Inbound {
    pub(crate) base: BaseStream,
    message_type: MessageType,
}

impl Inbound {
    /// Client-side receiver for a server-streaming call.
    pub(crate) fn client(
        name: impl Into<String>,
        seq_id: i32,
        iprot: ProtocolRef,
        oprot: ProtocolRef,
        closer: Closer,
    ) -> Self {
        Self {
            base: BaseStream::client(
                name,
                seq_id,
                iprot,
                oprot,
                MessageType::ServerStreamGoAway,
                closer,
            ),
            message_type: MessageType::ServerStreamMessage,
        }
    }

    /// Server-side receiver for a client-streaming call.
    pub(crate) fn server(
        name: impl Into<String>,
        seq_id: i32,
        iprot: ProtocolRef,
        oprot: ProtocolRef,
    ) -> Self {
        Self {
            base: BaseStream::server(name, seq_id, iprot, oprot, MessageType::ClientStreamGoAway),
            message_type: MessageType::ClientStreamMessage,
        }
    }

    pub(crate) fn ready(&self) {
        self.base.ready();
    }

    async fn receive_impl(&self, ctx: &Context, req: &mut dyn Request) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.base.wait_ready(ctx).await?;

        let mut prot = self.base.iprot.lock().await;
        let mtype = match self.base.read_header(ctx, &mut **prot).await {
            Ok(mtype) => mtype,
            Err(err) => {
                self.base.close();
                return Err(parse_stream_error(err));
            }
        };

        if mtype == self.message_type {
            req.read(&mut **prot).await?;
            return prot.read_message_end().await;
        }

        if mtype == self.base.goaway_type {
            prot.read_message_end().await?;
            drop(prot);
            // The peer started the handshake; answer it and skip ours.
            self.base.claim_goaway();
            let _ = self.base.write_goaway_ack().await;
            self.base.close();
            return Err(Error::Eof);
        }

        let _ = prot.read_message_end().await;
        Err(Error::Protocol(ProtocolError::new(
            ProtocolErrorKind::InvalidData,
            format!("unexpected message type: {mtype:?}"),
        )))
    }

    async fn close_impl(&self) -> Result<()> {
        if self.base.claim_goaway() {
            let handshake = async {
                self.base.write_goaway().await?;
                self.read_goaway_ack().await
            }
            .await;
            self.base.close();
            match handshake {
                Err(err) if !err.is_eof() => return Err(err),
                _ => return Ok(()),
            }
        }
        self.base.close();
        Ok(())
    }

    /// Drains frames until the peer acknowledges our GOAWAY. In-flight data
    /// frames are skipped; a crossing GOAWAY from the peer is answered and
    /// also terminates the handshake.
    async fn read_goaway_ack(&self) -> Result<()> {
        let ctx = Context::new();
        loop {
            let mut prot = self.base.iprot.lock().await;
            if self.base.closed.is_set() {
                return Err(Error::Eof);
            }
            let mtype = self
                .base
                .read_header(&ctx, &mut **prot)
                .await
                .map_err(parse_stream_error)?;

            if mtype == self.message_type {
                skip(&mut **prot, TType::Struct).await?;
                prot.read_message_end().await?;
                continue;
            }

            prot.read_message_end().await?;
            if mtype == self.base.goaway_ack_type {
                return Ok(());
            }
            if mtype == self.base.goaway_type {
                drop(prot);
                let _ = self.base.write_goaway_ack().await;
                return Ok(());
            }
            return Err(Error::Protocol(ProtocolError::new(
                ProtocolErrorKind::InvalidData,
                format!("invalid go away ack: {mtype:?}"),
            )));
        }
    }
}

#[async_trait]
impl InboundStream for Inbound {
    async fn receive(&self, ctx: &Context, req: &mut dyn Request) -> Result<()> {
        self.receive_impl(ctx, req).await
    }

    async fn close(&self) -> Result<()> {
        self.close_impl().await
    }
}
