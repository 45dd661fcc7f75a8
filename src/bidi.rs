//! Bidirectional stream: two half-streams over one transport.
//!
//! One object carries both directions; [`InboundBidi`] and [`OutboundBidi`]
//! are facets aliasing it. Each direction half-closes independently via its
//! own GOAWAY/ACK pair and latch; the stream as a whole terminates only
//! when both halves have closed.
//!
//! Two rules keep the shared protocol safe:
//! - all writes (data frames and control shells) go through the output
//!   protocol lock, and
//! - at most one task reads at a time, enforced by a one-permit receive
//!   token whose acquisition is raced against the close latches.
//!
//! When a half is closed explicitly, a background receiver tied to that
//! half's latch keeps draining frames so the reciprocal GOAWAY/ACK is
//! actually pulled off the wire; waiting on the latch alone would deadlock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::trace;

use crate::context::Context;
use crate::error::{Error, ProtocolError, ProtocolErrorKind, Result};
use crate::message::{MessageType, TType};
use crate::protocol::{skip, Protocol, ProtocolRef, Request};
use crate::stream::{parse_stream_error, BaseStream, Closer, InboundStream, Latch, OutboundStream};

pub(crate) struct Bidi {
    pub(crate) base: BaseStream,

    pub(crate) inbound_closed: Latch,
    pub(crate) outbound_closed: Latch,
    inbound_done: AtomicBool,
    outbound_done: AtomicBool,

    in_message_type: MessageType,
    in_goaway_type: MessageType,
    in_goaway_ack_type: MessageType,
    out_message_type: MessageType,
    out_goaway_type: MessageType,
    out_goaway_ack_type: MessageType,

    /// True once this side has sent (or decided to send) a GOAWAY for the
    /// half, so an incoming GOAWAY on it is answered with an ACK only when
    /// the close is peer-initiated.
    closing_inbound: AtomicBool,
    closing_outbound: AtomicBool,

    /// One-permit token: at most one reader on the shared protocol.
    receiving: Semaphore,
}

impl Bidi {
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
            inbound_closed: Latch::new(),
            outbound_closed: Latch::new(),
            inbound_done: AtomicBool::new(false),
            outbound_done: AtomicBool::new(false),
            in_message_type: MessageType::ServerStreamMessage,
            in_goaway_type: MessageType::ServerStreamGoAway,
            in_goaway_ack_type: MessageType::ServerStreamGoAwayAck,
            out_message_type: MessageType::ClientStreamMessage,
            out_goaway_type: MessageType::ClientStreamGoAway,
            out_goaway_ack_type: MessageType::ClientStreamGoAwayAck,
            closing_inbound: AtomicBool::new(false),
            closing_outbound: AtomicBool::new(false),
            receiving: Semaphore::new(1),
        }
    }

    pub(crate) fn server(
        name: impl Into<String>,
        seq_id: i32,
        iprot: ProtocolRef,
        oprot: ProtocolRef,
    ) -> Self {
        Self {
            base: BaseStream::server(name, seq_id, iprot, oprot, MessageType::ServerStreamGoAway),
            inbound_closed: Latch::new(),
            outbound_closed: Latch::new(),
            inbound_done: AtomicBool::new(false),
            outbound_done: AtomicBool::new(false),
            in_message_type: MessageType::ClientStreamMessage,
            in_goaway_type: MessageType::ClientStreamGoAway,
            in_goaway_ack_type: MessageType::ClientStreamGoAwayAck,
            out_message_type: MessageType::ServerStreamMessage,
            out_goaway_type: MessageType::ServerStreamGoAway,
            out_goaway_ack_type: MessageType::ServerStreamGoAwayAck,
            closing_inbound: AtomicBool::new(false),
            closing_outbound: AtomicBool::new(false),
            receiving: Semaphore::new(1),
        }
    }

    pub(crate) fn ready(&self) {
        self.base.ready();
    }

    /// Splits the stream into its two facets.
    pub(crate) fn facets(this: &Arc<Self>) -> (Arc<dyn InboundStream>, Arc<dyn OutboundStream>) {
        let sink: Arc<dyn InboundStream> = Arc::new(InboundBidi(this.clone()));
        let stream: Arc<dyn OutboundStream> = Arc::new(OutboundBidi(this.clone()));
        (sink, stream)
    }

    fn close(&self) {
        self.base.close();
    }

    /// Latches the inbound half. The first caller spawns a receiver for the
    /// outbound half if that is still open, so its handshake frames keep
    /// being consumed. Closes the aggregate when both halves are done.
    fn close_inbound(this: &Arc<Self>) {
        if !this.inbound_done.swap(true, Ordering::SeqCst) {
            trace!(name = %this.base.name, "inbound half closed");
            this.inbound_closed.set();
            if !this.outbound_closed.is_set() {
                let receiver = this.clone();
                let sentinel = this.outbound_closed.clone();
                tokio::spawn(async move { Bidi::receive(receiver, sentinel).await });
            }
        }
        if this.outbound_closed.is_set() {
            this.close();
        }
    }

    /// Latches the outbound half; closes the aggregate when both are done.
    fn close_outbound(&self) {
        if !self.outbound_done.swap(true, Ordering::SeqCst) {
            trace!(name = %self.base.name, "outbound half closed");
            self.outbound_closed.set();
        }
        if self.inbound_closed.is_set() {
            self.close();
        }
    }

    async fn write_shell(&self, mtype: MessageType) -> Result<()> {
        self.base.write_shell(mtype).await
    }

    /// Dispatches one incoming frame that is not an application-visible
    /// data frame for the caller.
    ///
    /// Returns `Err(Eof)` for inbound-half closures (they interrupt a
    /// pending receive) and `Ok` for outbound-half closures (they do not).
    /// Data frames reaching this path are drained by a background receiver
    /// and skipped.
    async fn process_message(
        this: &Arc<Self>,
        prot: &mut dyn Protocol,
        mtype: MessageType,
    ) -> Result<()> {
        if mtype == this.in_message_type {
            skip(prot, TType::Struct).await?;
            prot.read_message_end().await?;
            return Ok(());
        }

        prot.read_message_end().await?;

        if mtype == this.in_goaway_type {
            if !this.closing_inbound.swap(true, Ordering::SeqCst) {
                if let Err(err) = this.write_shell(this.in_goaway_ack_type).await {
                    this.close();
                    return Err(err);
                }
            }
            Bidi::close_inbound(this);
            return Err(Error::Eof);
        }
        if mtype == this.in_goaway_ack_type {
            Bidi::close_inbound(this);
            return Err(Error::Eof);
        }
        if mtype == this.out_goaway_type {
            if !this.closing_outbound.swap(true, Ordering::SeqCst) {
                if let Err(err) = this.write_shell(this.out_goaway_ack_type).await {
                    this.close();
                    return Err(err);
                }
            }
            this.close_outbound();
            return Ok(());
        }
        if mtype == this.out_goaway_ack_type {
            this.close_outbound();
            return Ok(());
        }

        Err(Error::Protocol(ProtocolError::new(
            ProtocolErrorKind::InvalidData,
            format!("unexpected message type: {mtype:?}"),
        )))
    }

    async fn receive_once(this: &Arc<Self>) -> Result<()> {
        let mut prot = this.base.iprot.lock().await;
        if this.base.closed.is_set() {
            return Ok(());
        }
        let outcome = match this.base.read_header(&Context::new(), &mut **prot).await {
            Ok(mtype) => Bidi::process_message(this, &mut **prot, mtype).await,
            Err(err) => Err(parse_stream_error(err)),
        };
        match outcome {
            Err(err) if !err.is_eof() => {
                this.close();
                Err(err)
            }
            _ => Ok(()),
        }
    }

    /// Background receiver draining frames until `sentinel` (the half being
    /// waited on) or the aggregate close fires.
    async fn receive(this: Arc<Self>, sentinel: Latch) {
        let _permit = tokio::select! {
            biased;
            _ = sentinel.wait() => return,
            _ = this.base.closed.wait() => return,
            permit = this.receiving.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        loop {
            if Bidi::receive_once(&this).await.is_err() {
                return;
            }
            if sentinel.is_set() || this.base.closed.is_set() {
                return;
            }
        }
    }
}

/// Receiving facet of a bidirectional stream.
pub(crate) struct InboundBidi(pub(crate) Arc<Bidi>);

#[async_trait]
impl InboundStream for InboundBidi {
    async fn receive(&self, ctx: &Context, req: &mut dyn Request) -> Result<()> {
        let bidi = &self.0;

        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            _ = bidi.base.closed.wait() => return Err(Error::Eof),
            _ = bidi.inbound_closed.wait() => return Err(Error::Eof),
            _ = bidi.base.ready.wait() => {}
        }

        let _permit = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            _ = bidi.base.closed.wait() => return Err(Error::Eof),
            _ = bidi.inbound_closed.wait() => return Err(Error::Eof),
            permit = bidi.receiving.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(Error::Eof),
            },
        };

        loop {
            let mut prot = bidi.base.iprot.lock().await;
            let mtype = match bidi.base.read_header(ctx, &mut **prot).await {
                Ok(mtype) => mtype,
                Err(err) => {
                    let err = parse_stream_error(err);
                    if !err.is_eof() {
                        bidi.close();
                    }
                    return Err(err);
                }
            };

            if mtype == bidi.in_message_type {
                req.read(&mut **prot).await?;
                return prot.read_message_end().await;
            }

            match Bidi::process_message(bidi, &mut **prot, mtype).await {
                Ok(()) => {}
                Err(err) => {
                    if !err.is_eof() {
                        bidi.close();
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let bidi = &self.0;

        tokio::select! {
            biased;
            _ = bidi.inbound_closed.wait() => return Ok(()),
            _ = bidi.base.closed.wait() => return Ok(()),
            _ = bidi.base.ready.wait() => {}
        }

        if bidi.closing_inbound.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Drain reciprocal frames while we wait for the half to settle.
        let receiver = bidi.clone();
        let sentinel = bidi.inbound_closed.clone();
        tokio::spawn(async move { Bidi::receive(receiver, sentinel).await });

        match bidi.write_shell(bidi.in_goaway_type).await {
            Err(err) if !err.is_eof() => {
                bidi.close();
                return Err(err);
            }
            _ => {}
        }

        tokio::select! {
            biased;
            _ = bidi.inbound_closed.wait() => {}
            _ = bidi.base.closed.wait() => {}
        }
        Ok(())
    }
}

/// Sending facet of a bidirectional stream.
pub(crate) struct OutboundBidi(pub(crate) Arc<Bidi>);

#[async_trait]
impl OutboundStream for OutboundBidi {
    async fn send(&self, ctx: &Context, req: &dyn Request) -> Result<()> {
        let bidi = &self.0;

        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            _ = bidi.outbound_closed.wait() => return Err(Error::Eof),
            _ = bidi.base.closed.wait() => return Err(Error::Eof),
            _ = bidi.base.ready.wait() => {}
        }

        let mut prot = bidi.base.oprot.lock().await;
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        // A GOAWAY may have been written while we waited for the lock.
        if bidi.closing_outbound.load(Ordering::SeqCst) {
            return Err(Error::Eof);
        }
        if !prot.transport().is_open() {
            bidi.close();
            return Err(Error::Eof);
        }
        if let Err(err) = bidi
            .base
            .write_frame(ctx, &mut **prot, bidi.out_message_type, req)
            .await
        {
            bidi.close();
            return Err(parse_stream_error(err));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let bidi = &self.0;

        tokio::select! {
            biased;
            _ = bidi.outbound_closed.wait() => return Ok(()),
            _ = bidi.base.closed.wait() => return Ok(()),
            _ = bidi.base.ready.wait() => {}
        }

        if bidi.closing_outbound.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let receiver = bidi.clone();
        let sentinel = bidi.outbound_closed.clone();
        tokio::spawn(async move { Bidi::receive(receiver, sentinel).await });

        if let Err(err) = bidi.write_shell(bidi.out_goaway_type).await {
            bidi.close();
            return Err(err);
        }

        tokio::select! {
            biased;
            _ = bidi.outbound_closed.wait() => {}
            _ = bidi.base.closed.wait() => {}
        }
        Ok(())
    }
}
