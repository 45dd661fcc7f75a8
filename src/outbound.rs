//! Sender side of a uni-directional stream.
//!
//! The sender never reads during normal operation, so once it is ready a
//! background watcher owns the input protocol: it reads exactly one control
//! frame, which is either the peer's GOAWAY (receiver gave up; answer with
//! an ACK) or the ACK for a GOAWAY this side sent. Either way the stream is
//! closed afterwards, which is what unblocks a pending `close`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::context::Context;
use crate::error::Result;
use crate::message::MessageType;
use crate::protocol::{ProtocolRef, Request};
use crate::stream::{BaseStream, Closer, OutboundStream};

pub(crate) struct Outbound {
    pub(crate) base: BaseStream,
    message_type: MessageType,
    readied: AtomicBool,
}

impl Outbound {
    /// Client-side sender for a client-streaming call.
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
                MessageType::ClientStreamGoAway,
                closer,
            ),
            message_type: MessageType::ClientStreamMessage,
            readied: AtomicBool::new(false),
        }
    }

    /// Server-side sender for a server-streaming call.
    pub(crate) fn server(
        name: impl Into<String>,
        seq_id: i32,
        iprot: ProtocolRef,
        oprot: ProtocolRef,
    ) -> Self {
        Self {
            base: BaseStream::server(name, seq_id, iprot, oprot, MessageType::ServerStreamGoAway),
            message_type: MessageType::ServerStreamMessage,
            readied: AtomicBool::new(false),
        }
    }

    /// Opens the stream for sending and starts the GOAWAY watcher, once.
    pub(crate) fn ready(this: &Arc<Self>) {
        if !this.readied.swap(true, Ordering::SeqCst) {
            this.base.ready();
            let watcher = this.clone();
            tokio::spawn(async move { watcher.watch_goaway().await });
        }
    }

    /// Aborts the stream without a handshake.
    pub(crate) fn abort(&self) {
        self.base.close();
    }

    async fn watch_goaway(self: Arc<Self>) {
        let this = &self;
        let _close = scopeguard::guard((), |_| this.base.close());
        match this.base.read_shell().await {
            Ok(mtype) if mtype == this.base.goaway_type => {
                // Receiver-initiated shutdown; acknowledge it.
                let _ = this.base.write_goaway_ack().await;
            }
            Ok(mtype) => {
                trace!(name = %this.base.name, ?mtype, "goaway watcher done");
            }
            Err(_) => {}
        }
    }

    async fn send_impl(&self, ctx: &Context, req: &dyn Request) -> Result<()> {
        self.base.write(ctx, self.message_type, req).await
    }

    async fn close_impl(&self) -> Result<()> {
        // A server cannot half-close before the opening REPLY is on the
        // wire, so wait for readiness unless already closed.
        tokio::select! {
            biased;
            _ = self.base.closed.wait() => return Ok(()),
            _ = self.base.ready.wait() => {}
        }
        if self.base.closed.is_set() {
            return Ok(());
        }

        if let Err(err) = self.base.write_goaway().await {
            self.base.close();
            return Err(err);
        }

        // The watcher latches `closed` once the ACK (or an error) arrives.
        self.base.closed.wait().await;
        Ok(())
    }
}

#[async_trait]
impl OutboundStream for Outbound {
    async fn send(&self, ctx: &Context, req: &dyn Request) -> Result<()> {
        self.send_impl(ctx, req).await
    }

    async fn close(&self) -> Result<()> {
        self.close_impl().await
    }
}
