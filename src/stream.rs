//! Shared substrate for every streaming mode.
//!
//! A stream multiplexes typed data frames and half-close control frames
//! (GOAWAY / GOAWAY-ACK) over the connection that carried its opening call.
//! [`BaseStream`] owns the pieces common to all modes: the `(name, seq_id)`
//! identity every frame must match, the `ready` and `closed` one-shot
//! latches, shell (empty-body) frame I/O for the half-close handshake, and
//! the close finalizer that releases the client connection lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::context::Context;
use crate::error::{Error, ProtocolError, ProtocolErrorKind, Result, TransportErrorKind};
use crate::message::MessageType;
use crate::protocol::{Protocol, ProtocolRef, Request};

/// Receiver side of a message stream.
#[async_trait]
pub trait InboundStream: Send + Sync {
    /// Receives one message into `req`.
    ///
    /// Returns [`Error::Eof`] once the direction is half-closed, either by
    /// the peer's GOAWAY or by this side's own close.
    async fn receive(&self, ctx: &Context, req: &mut dyn Request) -> Result<()>;

    /// Half-closes the direction: sends GOAWAY, awaits the peer's ACK.
    ///
    /// Idempotent; returns `Ok` if the stream is already closed.
    async fn close(&self) -> Result<()>;
}

/// Sender side of a message stream.
#[async_trait]
pub trait OutboundStream: Send + Sync {
    /// Sends one message.
    ///
    /// Returns [`Error::Eof`] once the direction is half-closed.
    async fn send(&self, ctx: &Context, req: &dyn Request) -> Result<()>;

    /// Half-closes the direction: sends GOAWAY and waits until the ACK has
    /// been observed.
    async fn close(&self) -> Result<()>;
}

/// A one-shot broadcast latch: set once, observable forever after.
///
/// Wraps a cancellation token, which provides exactly the required pair of
/// operations: an is-set check and a cancellable wait-until-set.
#[derive(Clone, Debug)]
pub struct Latch {
    token: CancellationToken,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Sets the latch. Repeat calls are harmless.
    pub fn set(&self) {
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until the latch is set.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}

/// Normalizes end-of-file transport errors to the standard EOF sentinel at
/// the stream boundary.
pub fn parse_stream_error(err: Error) -> Error {
    match &err {
        Error::Transport(t) if t.kind() == TransportErrorKind::EndOfFile => Error::Eof,
        _ => err,
    }
}

/// Finalizer run exactly once when a stream closes.
///
/// On the client side this releases the connection lock; the enclosing
/// `Option` is taken under a mutex so concurrent closes run it once.
pub(crate) struct Closer(Box<dyn FnOnce() + Send>);

impl Closer {
    pub(crate) fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    fn run(self) {
        (self.0)()
    }
}

/// State shared by every streaming mode.
pub(crate) struct BaseStream {
    pub(crate) name: String,
    pub(crate) seq_id: i32,
    pub(crate) iprot: ProtocolRef,
    pub(crate) oprot: ProtocolRef,
    pub(crate) goaway_type: MessageType,
    pub(crate) goaway_ack_type: MessageType,
    /// Open once application frames may be exchanged. Client streams are
    /// readied by the opener right after the REPLY; server streams only
    /// after the REPLY has been written.
    pub(crate) ready: Latch,
    /// Terminal state; every blocking operation observes it.
    pub(crate) closed: Latch,
    /// Set once a GOAWAY for this direction has been sent or answered, so
    /// a later close does not start a second handshake.
    pub(crate) goaway_done: AtomicBool,
    closer: StdMutex<Option<Closer>>,
}

impl BaseStream {
    pub(crate) fn server(
        name: impl Into<String>,
        seq_id: i32,
        iprot: ProtocolRef,
        oprot: ProtocolRef,
        goaway_type: MessageType,
    ) -> Self {
        Self {
            name: name.into(),
            seq_id,
            iprot,
            oprot,
            goaway_type,
            goaway_ack_type: goaway_type.goaway_ack(),
            ready: Latch::new(),
            closed: Latch::new(),
            goaway_done: AtomicBool::new(false),
            closer: StdMutex::new(None),
        }
    }

    pub(crate) fn client(
        name: impl Into<String>,
        seq_id: i32,
        iprot: ProtocolRef,
        oprot: ProtocolRef,
        goaway_type: MessageType,
        closer: Closer,
    ) -> Self {
        Self {
            name: name.into(),
            seq_id,
            iprot,
            oprot,
            goaway_type,
            goaway_ack_type: goaway_type.goaway_ack(),
            ready: Latch::new(),
            closed: Latch::new(),
            goaway_done: AtomicBool::new(false),
            closer: StdMutex::new(Some(closer)),
        }
    }

    /// Latches the terminal state and runs the finalizer, once.
    pub(crate) fn close(&self) {
        if let Some(closer) = self.closer.lock().unwrap().take() {
            closer.run();
        }
        if !self.closed.is_set() {
            trace!(name = %self.name, seq_id = self.seq_id, "stream closed");
        }
        self.closed.set();
    }

    /// Claims the GOAWAY handshake. Returns true for exactly one caller.
    pub(crate) fn claim_goaway(&self) -> bool {
        !self.goaway_done.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn ready(&self) {
        self.ready.set();
    }

    /// Waits for the stream to become ready, racing cancellation and close.
    pub(crate) async fn wait_ready(&self, ctx: &Context) -> Result<()> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            _ = self.closed.wait() => Err(Error::Eof),
            _ = self.ready.wait() => Ok(()),
        }
    }

    /// Rejects frames that do not carry this stream's identity.
    pub(crate) fn check_frame(&self, name: &str, seq_id: i32) -> Result<()> {
        if name != self.name {
            return Err(Error::Protocol(ProtocolError::new(
                ProtocolErrorKind::InvalidData,
                format!("invalid method name {name:?}, expected: {:?}", self.name),
            )));
        }
        if seq_id != self.seq_id {
            return Err(Error::Protocol(ProtocolError::new(
                ProtocolErrorKind::InvalidData,
                format!("invalid sequence ID {seq_id}, expected: {}", self.seq_id),
            )));
        }
        Ok(())
    }

    /// Reads and validates a frame header. The caller holds the input
    /// protocol and is responsible for the body and the end marker.
    pub(crate) async fn read_header(
        &self,
        ctx: &Context,
        prot: &mut dyn Protocol,
    ) -> Result<MessageType> {
        let _ = prot.transport_mut().write_context(ctx).await;
        let (name, mtype, seq_id) = prot.read_message_begin().await?;
        self.check_frame(&name, seq_id)?;
        Ok(mtype)
    }

    /// Writes one data frame. Waits for readiness, re-checks the context
    /// after taking the write lock, and latches `closed` on failure.
    pub(crate) async fn write(
        &self,
        ctx: &Context,
        mtype: MessageType,
        req: &dyn Request,
    ) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.wait_ready(ctx).await?;

        let mut prot = self.oprot.lock().await;
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.closed.is_set() {
            return Err(Error::Eof);
        }
        if !prot.transport().is_open() {
            self.close();
            return Err(Error::Eof);
        }
        if let Err(err) = self.write_frame(ctx, &mut **prot, mtype, req).await {
            self.close();
            return Err(parse_stream_error(err));
        }
        Ok(())
    }

    /// Writes a full frame on an already-held output protocol.
    pub(crate) async fn write_frame(
        &self,
        ctx: &Context,
        prot: &mut dyn Protocol,
        mtype: MessageType,
        req: &dyn Request,
    ) -> Result<()> {
        prot.write_message_begin(&self.name, mtype, self.seq_id).await?;
        req.write(prot).await?;
        prot.write_message_end().await?;
        prot.transport_mut().write_context(ctx).await?;
        prot.flush().await
    }

    /// Writes a control frame with an empty body.
    pub(crate) async fn write_shell(&self, mtype: MessageType) -> Result<()> {
        let mut prot = self.oprot.lock().await;
        self.write_shell_locked(&mut **prot, mtype).await
    }

    pub(crate) async fn write_shell_locked(
        &self,
        prot: &mut dyn Protocol,
        mtype: MessageType,
    ) -> Result<()> {
        if !prot.transport().is_open() {
            return Err(Error::Eof);
        }
        if self.closed.is_set() {
            return Err(Error::Eof);
        }
        prot.write_message_begin(&self.name, mtype, self.seq_id).await?;
        prot.write_message_end().await?;
        prot.flush().await
    }

    /// Reads a control frame with an empty body and returns its type.
    pub(crate) async fn read_shell(&self) -> Result<MessageType> {
        let mut prot = self.iprot.lock().await;
        if self.closed.is_set() {
            return Err(Error::Eof);
        }
        if !prot.transport().is_open() {
            return Err(Error::Eof);
        }
        let (name, mtype, seq_id) = prot.read_message_begin().await?;
        self.check_frame(&name, seq_id)?;
        prot.read_message_end().await?;
        Ok(mtype)
    }

    pub(crate) async fn write_goaway(&self) -> Result<()> {
        self.write_shell(self.goaway_type).await
    }

    pub(crate) async fn write_goaway_ack(&self) -> Result<()> {
        self.write_shell(self.goaway_ack_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use crate::binary::BinaryProtocol;
    use crate::error::TransportError;
    use crate::protocol::protocol_ref;
    use crate::transport::{ReaderTransport, WriterTransport};

    fn test_base() -> (BaseStream, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(local);
        let iprot = protocol_ref(BinaryProtocol::new(ReaderTransport::new(r)));
        let oprot = protocol_ref(BinaryProtocol::new(WriterTransport::new(w)));
        (
            BaseStream::server("m", 3, iprot, oprot, MessageType::ClientStreamGoAway),
            remote,
        )
    }

    #[test]
    fn test_latch_once() {
        let latch = Latch::new();
        assert!(!latch.is_set());
        latch.set();
        latch.set();
        assert!(latch.is_set());
    }

    #[tokio::test]
    async fn test_latch_wait() {
        let latch = Latch::new();
        let waiter = latch.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        latch.set();
        handle.await.unwrap();
    }

    #[test]
    fn test_parse_stream_error_normalizes_eof() {
        let err = Error::Transport(TransportError::new(TransportErrorKind::EndOfFile, "eof"));
        assert!(parse_stream_error(err).is_eof());

        let err = Error::Transport(TransportError::new(TransportErrorKind::TimedOut, "slow"));
        assert!(!parse_stream_error(err).is_eof());
    }

    #[tokio::test]
    async fn test_close_runs_finalizer_once() {
        let (local, _remote) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(local);
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let base = BaseStream::client(
            "m",
            3,
            protocol_ref(BinaryProtocol::new(ReaderTransport::new(r))),
            protocol_ref(BinaryProtocol::new(WriterTransport::new(w))),
            MessageType::ClientStreamGoAway,
            Closer::new(move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        base.close();
        base.close();
        assert!(base.closed.is_set());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_claim_goaway_single_winner() {
        let (base, _remote) = test_base();
        assert!(base.claim_goaway());
        assert!(!base.claim_goaway());
    }

    #[tokio::test]
    async fn test_wait_ready_prefers_close() {
        let (base, _remote) = test_base();
        base.ready();
        base.closed.set();
        let err = base.wait_ready(&Context::new()).await.unwrap_err();
        assert!(err.is_eof());
    }

    #[tokio::test]
    async fn test_wait_ready_cancellation() {
        let (base, _remote) = test_base();
        let ctx = Context::new();
        ctx.cancel();
        let err = base.wait_ready(&ctx).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_frame_identity_checked() {
        let (base, _remote) = test_base();
        assert!(base.check_frame("m", 3).is_ok());
        assert!(base.check_frame("other", 3).is_err());
        assert!(base.check_frame("m", 4).is_err());
    }
}
