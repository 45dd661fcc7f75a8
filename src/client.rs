//! Client-side call paths.
//!
//! A [`SyncClient`] serializes calls on one connection: a unary call holds
//! the connection lock for its duration; a streaming call holds it for the
//! stream's whole lifetime and releases it, exactly once, when the stream
//! closes. Sequence ids are assigned under the lock and validated against
//! every reply.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::trace;

use crate::bidi::Bidi;
use crate::context::Context;
use crate::error::{ApplicationError, ApplicationErrorKind, Error, Result};
use crate::inbound::Inbound;
use crate::message::MessageType;
use crate::middleware::{BinaryNext, Middleware, UnaryNext};
use crate::outbound::Outbound;
use crate::protocol::{ProtocolFactory, ProtocolRef, Request, Response};
use crate::stream::{Closer, InboundStream, OutboundStream};
use crate::transport::{ReaderTransport, WriterTransport};

/// The client call surface.
#[async_trait]
pub trait Client: Send + Sync {
    /// Request/response call.
    async fn call_binary(
        &self,
        ctx: &Context,
        method: &str,
        req: &dyn Request,
        res: &mut dyn Response,
    ) -> Result<()>;

    /// One-way call: no response frame is read.
    async fn call_unary(&self, ctx: &Context, method: &str, req: &dyn Request) -> Result<()>;

    /// Opens a server-streaming call; the returned stream receives the
    /// server's frames.
    async fn stream_server(
        &self,
        ctx: &Context,
        method: &str,
        req: &dyn Request,
        res: &mut dyn Response,
    ) -> Result<Arc<dyn InboundStream>>;

    /// Opens a client-streaming call; the returned stream sends frames to
    /// the server.
    async fn stream_client(
        &self,
        ctx: &Context,
        method: &str,
        req: &dyn Request,
        res: &mut dyn Response,
    ) -> Result<Arc<dyn OutboundStream>>;

    /// Opens a bidirectional call, returning the two facets of one stream.
    async fn stream_bidi(
        &self,
        ctx: &Context,
        method: &str,
        req: &dyn Request,
        res: &mut dyn Response,
    ) -> Result<(Arc<dyn InboundStream>, Arc<dyn OutboundStream>)>;
}

struct ClientState {
    seq_id: i32,
}

/// Client that serializes calls over a single connection.
pub struct SyncClient {
    state: Arc<Mutex<ClientState>>,
    iprot: ProtocolRef,
    oprot: ProtocolRef,
    middlewares: Arc<[Arc<dyn Middleware>]>,
}

impl SyncClient {
    pub fn new(
        iprot: ProtocolRef,
        oprot: ProtocolRef,
        middlewares: Vec<Arc<dyn Middleware>>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClientState { seq_id: 0 })),
            iprot,
            oprot,
            middlewares: middlewares.into(),
        }
    }

    /// Builds a client over a duplex byte stream, splitting it into read
    /// and write halves bound through `factory`.
    pub fn from_io<S>(
        io: S,
        factory: &dyn ProtocolFactory,
        middlewares: Vec<Arc<dyn Middleware>>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let iprot = factory.protocol(Box::new(ReaderTransport::new(read_half)));
        let oprot = factory.protocol(Box::new(WriterTransport::new(write_half)));
        Self::new(
            Arc::new(Mutex::new(iprot)),
            Arc::new(Mutex::new(oprot)),
            middlewares,
        )
    }
}

/// Writes one framed message: header, body, end marker, context hook, flush.
pub(crate) async fn send_frame(
    ctx: &Context,
    oprot: &ProtocolRef,
    seq_id: i32,
    method: &str,
    req: &dyn Request,
    mtype: MessageType,
) -> Result<()> {
    let mut prot = oprot.lock().await;
    prot.write_message_begin(method, mtype, seq_id).await?;
    req.write(&mut **prot).await?;
    prot.write_message_end().await?;
    prot.transport_mut().write_context(ctx).await?;
    prot.flush().await
}

/// Reads one reply frame for `(method, seq_id)` into `res`.
///
/// Surfaces an application exception frame as its decoded error, and maps
/// identity mismatches to the corresponding application error kinds.
pub(crate) async fn recv_frame(
    iprot: &ProtocolRef,
    seq_id: i32,
    method: &str,
    res: &mut dyn Response,
) -> Result<()> {
    let mut prot = iprot.lock().await;
    let (r_method, r_type, r_seq_id) = prot.read_message_begin().await?;

    if r_method != method {
        return Err(Error::Application(ApplicationError::new(
            ApplicationErrorKind::WrongMethodName,
            format!("{method}: wrong method name"),
        )));
    }
    if r_seq_id != seq_id {
        return Err(Error::Application(ApplicationError::new(
            ApplicationErrorKind::BadSequenceId,
            format!("{method}: out of order sequence response"),
        )));
    }
    if r_type == MessageType::Exception {
        let mut exception = ApplicationError::default();
        Request::read(&mut exception, &mut **prot).await?;
        prot.read_message_end().await?;
        return Err(Error::Application(exception));
    }
    if r_type != MessageType::Reply {
        return Err(Error::Application(ApplicationError::new(
            ApplicationErrorKind::InvalidMessageType,
            format!("{method}: invalid message type"),
        )));
    }

    res.read(&mut **prot).await?;
    prot.read_message_end().await
}

#[async_trait]
impl Client for SyncClient {
    async fn call_binary(
        &self,
        ctx: &Context,
        method: &str,
        req: &dyn Request,
        res: &mut dyn Response,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.seq_id = state.seq_id.wrapping_add(1);
        let seq_id = state.seq_id;
        trace!(method, seq_id, "binary call");

        let iprot = self.iprot.clone();
        let oprot = self.oprot.clone();
        let next = BinaryNext::new(
            &self.middlewares,
            method,
            seq_id,
            Box::new(move |ctx, req| {
                Box::pin(async move {
                    send_frame(ctx, &oprot, seq_id, method, req, MessageType::Call).await?;
                    recv_frame(&iprot, seq_id, method, res).await?;
                    Ok(None)
                })
            }),
        );
        next.run(ctx, req).await.map(|_| ())
    }

    async fn call_unary(&self, ctx: &Context, method: &str, req: &dyn Request) -> Result<()> {
        let mut state = self.state.lock().await;
        state.seq_id = state.seq_id.wrapping_add(1);
        let seq_id = state.seq_id;
        trace!(method, seq_id, "one-way call");

        let oprot = self.oprot.clone();
        let next = UnaryNext::new(
            &self.middlewares,
            method,
            seq_id,
            Box::new(move |ctx, req| {
                Box::pin(async move {
                    send_frame(ctx, &oprot, seq_id, method, req, MessageType::Oneway).await
                })
            }),
        );
        next.run(ctx, req).await
    }

    async fn stream_server(
        &self,
        ctx: &Context,
        method: &str,
        req: &dyn Request,
        res: &mut dyn Response,
    ) -> Result<Arc<dyn InboundStream>> {
        let mut guard = self.state.clone().lock_owned().await;
        guard.seq_id = guard.seq_id.wrapping_add(1);
        let seq_id = guard.seq_id;
        trace!(method, seq_id, "opening server stream");

        // Any failure before the stream exists drops the guard and with it
        // the connection lock.
        send_frame(ctx, &self.oprot, seq_id, method, req, MessageType::Call).await?;
        recv_frame(&self.iprot, seq_id, method, res).await?;

        let closer = Closer::new(move || drop(guard));
        let stream = Arc::new(Inbound::client(
            method,
            seq_id,
            self.iprot.clone(),
            self.oprot.clone(),
            closer,
        ));
        stream.ready();
        let stream: Arc<dyn InboundStream> = stream;
        Ok(stream)
    }

    async fn stream_client(
        &self,
        ctx: &Context,
        method: &str,
        req: &dyn Request,
        res: &mut dyn Response,
    ) -> Result<Arc<dyn OutboundStream>> {
        let mut guard = self.state.clone().lock_owned().await;
        guard.seq_id = guard.seq_id.wrapping_add(1);
        let seq_id = guard.seq_id;
        trace!(method, seq_id, "opening client stream");

        send_frame(ctx, &self.oprot, seq_id, method, req, MessageType::Call).await?;
        recv_frame(&self.iprot, seq_id, method, res).await?;

        let closer = Closer::new(move || drop(guard));
        let stream = Arc::new(Outbound::client(
            method,
            seq_id,
            self.iprot.clone(),
            self.oprot.clone(),
            closer,
        ));
        Outbound::ready(&stream);
        let stream: Arc<dyn OutboundStream> = stream;
        Ok(stream)
    }

    async fn stream_bidi(
        &self,
        ctx: &Context,
        method: &str,
        req: &dyn Request,
        res: &mut dyn Response,
    ) -> Result<(Arc<dyn InboundStream>, Arc<dyn OutboundStream>)> {
        let mut guard = self.state.clone().lock_owned().await;
        guard.seq_id = guard.seq_id.wrapping_add(1);
        let seq_id = guard.seq_id;
        trace!(method, seq_id, "opening bidi stream");

        send_frame(ctx, &self.oprot, seq_id, method, req, MessageType::Call).await?;
        recv_frame(&self.iprot, seq_id, method, res).await?;

        let closer = Closer::new(move || drop(guard));
        let bidi = Arc::new(Bidi::client(
            method,
            seq_id,
            self.iprot.clone(),
            self.oprot.clone(),
            closer,
        ));
        bidi.ready();
        let (sink, stream) = Bidi::facets(&bidi);
        Ok((sink, stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    use crate::binary::BinaryProtocol;
    use crate::protocol::{protocol_ref, Protocol};

    #[derive(Default)]
    struct TStr(String);

    #[async_trait]
    impl Request for TStr {
        fn as_any(&self) -> &dyn Any {
            self
        }

        async fn read(&mut self, iprot: &mut dyn Protocol) -> Result<()> {
            self.0 = iprot.read_string().await?;
            Ok(())
        }

        async fn write(&self, oprot: &mut dyn Protocol) -> Result<()> {
            oprot.write_string(&self.0).await
        }
    }

    impl Response for TStr {}

    fn wire_client() -> (SyncClient, ProtocolRef, ProtocolRef) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (lr, lw) = tokio::io::split(local);
        let (rr, rw) = tokio::io::split(remote);
        let client = SyncClient::new(
            protocol_ref(BinaryProtocol::new(ReaderTransport::new(lr))),
            protocol_ref(BinaryProtocol::new(WriterTransport::new(lw))),
            Vec::new(),
        );
        let peer_in = protocol_ref(BinaryProtocol::new(ReaderTransport::new(rr)));
        let peer_out = protocol_ref(BinaryProtocol::new(WriterTransport::new(rw)));
        (client, peer_in, peer_out)
    }

    #[tokio::test]
    async fn test_call_binary_round_trip() {
        let (client, peer_in, peer_out) = wire_client();

        let peer = tokio::spawn(async move {
            let mut prot = peer_in.lock().await;
            let (name, mtype, seq_id) = prot.read_message_begin().await.unwrap();
            assert_eq!(name, "echo");
            assert_eq!(mtype, MessageType::Call);
            assert_eq!(seq_id, 1);
            let body = prot.read_string().await.unwrap();
            prot.read_message_end().await.unwrap();
            drop(prot);

            let mut prot = peer_out.lock().await;
            prot.write_message_begin("echo", MessageType::Reply, seq_id)
                .await
                .unwrap();
            prot.write_string(&body).await.unwrap();
            prot.write_message_end().await.unwrap();
            prot.flush().await.unwrap();
        });

        let ctx = Context::new();
        let mut res = TStr::default();
        client
            .call_binary(&ctx, "echo", &TStr("hello".into()), &mut res)
            .await
            .unwrap();
        assert_eq!(res.0, "hello");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_exception_reply_surfaces_application_error() {
        let (client, peer_in, peer_out) = wire_client();

        let peer = tokio::spawn(async move {
            let mut prot = peer_in.lock().await;
            let (name, _mtype, seq_id) = prot.read_message_begin().await.unwrap();
            let _ = prot.read_string().await.unwrap();
            prot.read_message_end().await.unwrap();
            drop(prot);

            let aerr =
                ApplicationError::new(ApplicationErrorKind::InternalError, "handler blew up");
            let mut prot = peer_out.lock().await;
            prot.write_message_begin(&name, MessageType::Exception, seq_id)
                .await
                .unwrap();
            Request::write(&aerr, &mut **prot).await.unwrap();
            prot.write_message_end().await.unwrap();
            prot.flush().await.unwrap();
        });

        let mut res = TStr::default();
        let err = client
            .call_binary(&Context::new(), "boom", &TStr("x".into()), &mut res)
            .await
            .unwrap_err();
        let aerr = err.as_application().expect("application error");
        assert_eq!(aerr.kind(), ApplicationErrorKind::InternalError);
        assert_eq!(aerr.message(), "handler blew up");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_method_name_in_reply() {
        let (client, peer_in, peer_out) = wire_client();

        let peer = tokio::spawn(async move {
            let mut prot = peer_in.lock().await;
            let (_name, _mtype, seq_id) = prot.read_message_begin().await.unwrap();
            let _ = prot.read_string().await.unwrap();
            prot.read_message_end().await.unwrap();
            drop(prot);

            let mut prot = peer_out.lock().await;
            prot.write_message_begin("other", MessageType::Reply, seq_id)
                .await
                .unwrap();
            prot.write_string("resp").await.unwrap();
            prot.write_message_end().await.unwrap();
            prot.flush().await.unwrap();
        });

        let mut res = TStr::default();
        let err = client
            .call_binary(&Context::new(), "echo", &TStr("x".into()), &mut res)
            .await
            .unwrap_err();
        assert_eq!(
            err.as_application().expect("application error").kind(),
            ApplicationErrorKind::WrongMethodName
        );
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_unary_writes_oneway() {
        let (client, peer_in, _peer_out) = wire_client();

        client
            .call_unary(&Context::new(), "notify", &TStr("fire".into()))
            .await
            .unwrap();

        let mut prot = peer_in.lock().await;
        let (name, mtype, seq_id) = prot.read_message_begin().await.unwrap();
        assert_eq!(name, "notify");
        assert_eq!(mtype, MessageType::Oneway);
        assert_eq!(seq_id, 1);
        assert_eq!(prot.read_string().await.unwrap(), "fire");
    }

    #[tokio::test]
    async fn test_seq_id_increments_per_call() {
        let (client, peer_in, _peer_out) = wire_client();

        client
            .call_unary(&Context::new(), "a", &TStr("1".into()))
            .await
            .unwrap();
        client
            .call_unary(&Context::new(), "b", &TStr("2".into()))
            .await
            .unwrap();

        let mut prot = peer_in.lock().await;
        let (_, _, seq_id) = prot.read_message_begin().await.unwrap();
        assert_eq!(seq_id, 1);
        let _ = prot.read_string().await.unwrap();
        prot.read_message_end().await.unwrap();
        let (_, _, seq_id) = prot.read_message_begin().await.unwrap();
        assert_eq!(seq_id, 2);
    }
}
