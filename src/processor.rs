//! Server-side message dispatch.
//!
//! A [`Processor`] reads one frame off a connection, routes it by method
//! name, runs the middleware chain around the handler, and writes the reply
//! or exception. Streaming methods additionally drive their stream state
//! machine: the handler runs first (typically spawning a producer or
//! consumer task), then the REPLY is written, then the stream is readied —
//! that ordering guarantees the client observes the REPLY before any stream
//! frame carrying the same sequence id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bidi::Bidi;
use crate::context::Context;
use crate::error::{ApplicationError, ApplicationErrorKind, Error, Result};
use crate::inbound::Inbound;
use crate::message::{MessageType, TType};
use crate::middleware::{
    BidiStreamNext, BinaryNext, InboundStreamNext, Middleware, OutboundStreamNext, ResponseResult,
    UnaryNext,
};
use crate::outbound::Outbound;
use crate::protocol::{skip, ProtocolRef, Request, Response};
use crate::stream::{InboundStream, OutboundStream};

/// Builds an empty request struct for a method, to be decoded from the wire.
pub type RequestBuilder = Box<dyn Fn() -> Box<dyn Request> + Send + Sync>;

/// Server-side dispatcher: reads and handles one message per call.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Processes one incoming message.
    ///
    /// Returns `(handled, result)`: `handled` is false when the frame could
    /// not be routed (read failure or unknown method), in which case
    /// `result` carries the error.
    async fn process(
        &self,
        ctx: &Context,
        iprot: &ProtocolRef,
        oprot: &ProtocolRef,
    ) -> (bool, Result<()>);
}

/// Per-method dispatch entry.
#[async_trait]
pub trait ProcessorFunction: Send + Sync {
    async fn process(
        &self,
        ctx: &Context,
        seq_id: i32,
        iprot: &ProtocolRef,
        oprot: &ProtocolRef,
    ) -> (bool, Result<()>);
}

/// Dispatcher with a method-name registry and a shared middleware chain.
pub struct StandardProcessor {
    functions: RwLock<HashMap<String, Arc<dyn ProcessorFunction>>>,
    middlewares: Arc<[Arc<dyn Middleware>]>,
}

impl StandardProcessor {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
            middlewares: middlewares.into(),
        }
    }

    /// Registers the dispatch entry for a method name.
    pub fn add_processor(&self, name: impl Into<String>, function: Arc<dyn ProcessorFunction>) {
        self.functions
            .write()
            .unwrap()
            .insert(name.into(), function);
    }

    pub(crate) fn middlewares(&self) -> Arc<[Arc<dyn Middleware>]> {
        self.middlewares.clone()
    }
}

async fn write_exception_frame(
    oprot: &ProtocolRef,
    name: &str,
    seq_id: i32,
    exception: &ApplicationError,
) -> Result<()> {
    let mut prot = oprot.lock().await;
    prot.write_message_begin(name, MessageType::Exception, seq_id)
        .await?;
    Request::write(exception, &mut **prot).await?;
    prot.write_message_end().await?;
    prot.flush().await
}

#[async_trait]
impl Processor for StandardProcessor {
    async fn process(
        &self,
        ctx: &Context,
        iprot: &ProtocolRef,
        oprot: &ProtocolRef,
    ) -> (bool, Result<()>) {
        let (name, _mtype, seq_id) = {
            let mut prot = iprot.lock().await;
            match prot.read_message_begin().await {
                Ok(header) => header,
                Err(err) => return (false, Err(err)),
            }
        };
        debug!(method = %name, seq_id, "processing message");

        let function = self.functions.read().unwrap().get(&name).cloned();
        match function {
            Some(function) => function.process(ctx, seq_id, iprot, oprot).await,
            None => {
                warn!(method = %name, seq_id, "unknown method");
                {
                    let mut prot = iprot.lock().await;
                    let _ = skip(&mut **prot, TType::Struct).await;
                    let _ = prot.read_message_end().await;
                }
                let exception = ApplicationError::new(
                    ApplicationErrorKind::UnknownMethod,
                    format!("unknown function {name}"),
                );
                let _ = write_exception_frame(oprot, &name, seq_id, &exception).await;
                (false, Err(Error::Application(exception)))
            }
        }
    }
}

/// Plumbing shared by every per-method function kind.
struct FunctionBase {
    fname: String,
    builder: RequestBuilder,
    middlewares: Arc<[Arc<dyn Middleware>]>,
}

impl FunctionBase {
    fn new(processor: &StandardProcessor, fname: impl Into<String>, builder: RequestBuilder) -> Self {
        Self {
            fname: fname.into(),
            builder,
            middlewares: processor.middlewares(),
        }
    }

    async fn read_request(&self, iprot: &ProtocolRef) -> Result<Box<dyn Request>> {
        let mut args = (self.builder)();
        let mut prot = iprot.lock().await;
        if let Err(err) = args.read(&mut **prot).await {
            let _ = prot.read_message_end().await;
            return Err(err);
        }
        prot.read_message_end().await?;
        Ok(args)
    }

    async fn write_reply(&self, oprot: &ProtocolRef, seq_id: i32, res: &dyn Response) -> Result<()> {
        let mut prot = oprot.lock().await;
        prot.write_message_begin(&self.fname, MessageType::Reply, seq_id)
            .await?;
        res.write(&mut **prot).await?;
        prot.write_message_end().await?;
        prot.flush().await
    }

    async fn write_exception(
        &self,
        oprot: &ProtocolRef,
        seq_id: i32,
        exception: &ApplicationError,
    ) -> Result<()> {
        write_exception_frame(oprot, &self.fname, seq_id, exception).await
    }

    /// Emits the terminal frame for a dispatch: REPLY on success, EXCEPTION
    /// otherwise (timeouts get their own type id). Returns `(reply_written,
    /// dispatch_result)`.
    async fn write_response(
        &self,
        oprot: &ProtocolRef,
        seq_id: i32,
        outcome: ResponseResult,
    ) -> (bool, Result<()>) {
        match outcome {
            Ok(Some(res)) => (true, self.write_reply(oprot, seq_id, &*res).await),
            Ok(None) => {
                let exception = ApplicationError::new(
                    ApplicationErrorKind::MissingResult,
                    format!("{}: no response produced", self.fname),
                );
                let wrote = self.write_exception(oprot, seq_id, &exception).await;
                (wrote.is_ok(), Err(Error::Application(exception)))
            }
            Err(err) => {
                let kind = if err.is_timeout() {
                    ApplicationErrorKind::InternalTimeout
                } else {
                    ApplicationErrorKind::InternalError
                };
                let exception = ApplicationError::new(
                    kind,
                    format!("internal error processing {}: {err}", self.fname),
                );
                let wrote = self.write_exception(oprot, seq_id, &exception).await;
                (wrote.is_ok(), Err(err))
            }
        }
    }
}

/// Handler for a request/response method.
#[async_trait]
pub trait BinaryHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, req: &dyn Request) -> Result<Box<dyn Response>>;
}

/// Handler for a one-way method.
#[async_trait]
pub trait UnaryHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, req: &dyn Request) -> Result<()>;
}

/// Handler for a server-streaming method. Typically spawns a producer on
/// the stream and returns the opening response promptly; the stream only
/// becomes ready once that response is on the wire.
#[async_trait]
pub trait StreamServerHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &Context,
        req: &dyn Request,
        stream: Arc<dyn OutboundStream>,
    ) -> Result<Box<dyn Response>>;
}

/// Handler for a client-streaming method; `sink` yields the client's frames.
#[async_trait]
pub trait StreamClientHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &Context,
        req: &dyn Request,
        sink: Arc<dyn InboundStream>,
    ) -> Result<Box<dyn Response>>;
}

/// Handler for a bidirectional method.
#[async_trait]
pub trait StreamBidiHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &Context,
        req: &dyn Request,
        sink: Arc<dyn InboundStream>,
        stream: Arc<dyn OutboundStream>,
    ) -> Result<Box<dyn Response>>;
}

/// Dispatch entry for a request/response method.
pub struct BinaryFunction {
    base: FunctionBase,
    handler: Arc<dyn BinaryHandler>,
}

impl BinaryFunction {
    pub fn new(
        processor: &StandardProcessor,
        fname: &str,
        builder: RequestBuilder,
        handler: Arc<dyn BinaryHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: FunctionBase::new(processor, fname, builder),
            handler,
        })
    }
}

#[async_trait]
impl ProcessorFunction for BinaryFunction {
    async fn process(
        &self,
        ctx: &Context,
        seq_id: i32,
        iprot: &ProtocolRef,
        oprot: &ProtocolRef,
    ) -> (bool, Result<()>) {
        let args = match self.base.read_request(iprot).await {
            Ok(args) => args,
            Err(err) => {
                let exception = ApplicationError::new(
                    ApplicationErrorKind::ProtocolError,
                    err.to_string(),
                );
                let _ = self.base.write_exception(oprot, seq_id, &exception).await;
                return (false, Err(err));
            }
        };

        let handler = self.handler.clone();
        let outcome = BinaryNext::new(
            &self.base.middlewares,
            &self.base.fname,
            seq_id,
            Box::new(move |ctx, req| {
                Box::pin(async move { handler.handle(ctx, req).await.map(Some) })
            }),
        )
        .run(ctx, &*args)
        .await;

        self.base.write_response(oprot, seq_id, outcome).await
    }
}

/// Dispatch entry for a one-way method: no response frame is written.
pub struct UnaryFunction {
    base: FunctionBase,
    handler: Arc<dyn UnaryHandler>,
}

impl UnaryFunction {
    pub fn new(
        processor: &StandardProcessor,
        fname: &str,
        builder: RequestBuilder,
        handler: Arc<dyn UnaryHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: FunctionBase::new(processor, fname, builder),
            handler,
        })
    }
}

#[async_trait]
impl ProcessorFunction for UnaryFunction {
    async fn process(
        &self,
        ctx: &Context,
        seq_id: i32,
        iprot: &ProtocolRef,
        _oprot: &ProtocolRef,
    ) -> (bool, Result<()>) {
        let args = match self.base.read_request(iprot).await {
            Ok(args) => args,
            Err(err) => return (false, Err(err)),
        };

        let handler = self.handler.clone();
        let result = UnaryNext::new(
            &self.base.middlewares,
            &self.base.fname,
            seq_id,
            Box::new(move |ctx, req| Box::pin(async move { handler.handle(ctx, req).await })),
        )
        .run(ctx, &*args)
        .await;

        (true, result)
    }
}

/// Dispatch entry for a server-streaming method.
pub struct StreamServerFunction {
    base: FunctionBase,
    handler: Arc<dyn StreamServerHandler>,
}

impl StreamServerFunction {
    pub fn new(
        processor: &StandardProcessor,
        fname: &str,
        builder: RequestBuilder,
        handler: Arc<dyn StreamServerHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: FunctionBase::new(processor, fname, builder),
            handler,
        })
    }
}

#[async_trait]
impl ProcessorFunction for StreamServerFunction {
    async fn process(
        &self,
        ctx: &Context,
        seq_id: i32,
        iprot: &ProtocolRef,
        oprot: &ProtocolRef,
    ) -> (bool, Result<()>) {
        let args = match self.base.read_request(iprot).await {
            Ok(args) => args,
            Err(err) => return (false, Err(err)),
        };

        let stream = Arc::new(Outbound::server(
            self.base.fname.as_str(),
            seq_id,
            iprot.clone(),
            oprot.clone(),
        ));

        let handler = self.handler.clone();
        let dyn_stream: Arc<dyn OutboundStream> = stream.clone();
        let outcome = OutboundStreamNext::new(
            &self.base.middlewares,
            &self.base.fname,
            seq_id,
            Box::new(move |ctx, req, stream| {
                Box::pin(async move { handler.handle(ctx, req, stream).await.map(Some) })
            }),
        )
        .run(ctx, &*args, dyn_stream)
        .await;

        let (ok, result) = self.base.write_response(oprot, seq_id, outcome).await;

        // The REPLY is on the wire; open the stream for the producer and
        // start watching for the client's GOAWAY.
        Outbound::ready(&stream);

        if !ok || result.is_err() {
            stream.abort();
            return (ok, result);
        }

        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                stream.abort();
                (true, Err(Error::Cancelled))
            }
            _ = stream.base.closed.wait() => (true, Ok(())),
        }
    }
}

/// Dispatch entry for a client-streaming method.
pub struct StreamClientFunction {
    base: FunctionBase,
    handler: Arc<dyn StreamClientHandler>,
}

impl StreamClientFunction {
    pub fn new(
        processor: &StandardProcessor,
        fname: &str,
        builder: RequestBuilder,
        handler: Arc<dyn StreamClientHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: FunctionBase::new(processor, fname, builder),
            handler,
        })
    }
}

#[async_trait]
impl ProcessorFunction for StreamClientFunction {
    async fn process(
        &self,
        ctx: &Context,
        seq_id: i32,
        iprot: &ProtocolRef,
        oprot: &ProtocolRef,
    ) -> (bool, Result<()>) {
        let args = match self.base.read_request(iprot).await {
            Ok(args) => args,
            Err(err) => return (false, Err(err)),
        };

        let sink = Arc::new(Inbound::server(
            self.base.fname.as_str(),
            seq_id,
            iprot.clone(),
            oprot.clone(),
        ));

        let handler = self.handler.clone();
        let dyn_sink: Arc<dyn InboundStream> = sink.clone();
        let outcome = InboundStreamNext::new(
            &self.base.middlewares,
            &self.base.fname,
            seq_id,
            Box::new(move |ctx, req, sink| {
                Box::pin(async move { handler.handle(ctx, req, sink).await.map(Some) })
            }),
        )
        .run(ctx, &*args, dyn_sink)
        .await;

        let (ok, result) = self.base.write_response(oprot, seq_id, outcome).await;

        sink.ready();

        if !ok || result.is_err() {
            sink.base.close();
            return (ok, result);
        }

        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                sink.base.close();
                (true, Err(Error::Cancelled))
            }
            _ = sink.base.closed.wait() => (true, Ok(())),
        }
    }
}

/// Dispatch entry for a bidirectional method.
pub struct StreamBidiFunction {
    base: FunctionBase,
    handler: Arc<dyn StreamBidiHandler>,
}

impl StreamBidiFunction {
    pub fn new(
        processor: &StandardProcessor,
        fname: &str,
        builder: RequestBuilder,
        handler: Arc<dyn StreamBidiHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: FunctionBase::new(processor, fname, builder),
            handler,
        })
    }
}

#[async_trait]
impl ProcessorFunction for StreamBidiFunction {
    async fn process(
        &self,
        ctx: &Context,
        seq_id: i32,
        iprot: &ProtocolRef,
        oprot: &ProtocolRef,
    ) -> (bool, Result<()>) {
        let args = match self.base.read_request(iprot).await {
            Ok(args) => args,
            Err(err) => return (false, Err(err)),
        };

        let bidi = Arc::new(Bidi::server(
            self.base.fname.as_str(),
            seq_id,
            iprot.clone(),
            oprot.clone(),
        ));
        let (sink, stream) = Bidi::facets(&bidi);

        let handler = self.handler.clone();
        let outcome = BidiStreamNext::new(
            &self.base.middlewares,
            &self.base.fname,
            seq_id,
            Box::new(move |ctx, req, sink, stream| {
                Box::pin(async move { handler.handle(ctx, req, sink, stream).await.map(Some) })
            }),
        )
        .run(ctx, &*args, sink, stream)
        .await;

        let (ok, result) = self.base.write_response(oprot, seq_id, outcome).await;

        bidi.ready();

        if !ok || result.is_err() {
            bidi.base.close();
            return (ok, result);
        }

        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                bidi.base.close();
                (true, Err(Error::Cancelled))
            }
            _ = bidi.base.closed.wait() => (true, Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    use crate::binary::BinaryProtocol;
    use crate::protocol::{protocol_ref, Protocol};
    use crate::transport::{ReaderTransport, WriterTransport};

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

    struct EchoHandler;

    #[async_trait]
    impl BinaryHandler for EchoHandler {
        async fn handle(&self, _ctx: &Context, req: &dyn Request) -> Result<Box<dyn Response>> {
            let req = req.as_any().downcast_ref::<TStr>().expect("TStr request");
            Ok(Box::new(TStr(req.0.clone())))
        }
    }

    fn wire() -> (ProtocolRef, ProtocolRef, ProtocolRef, ProtocolRef) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (lr, lw) = tokio::io::split(local);
        let (rr, rw) = tokio::io::split(remote);
        (
            protocol_ref(BinaryProtocol::new(ReaderTransport::new(lr))),
            protocol_ref(BinaryProtocol::new(WriterTransport::new(lw))),
            protocol_ref(BinaryProtocol::new(ReaderTransport::new(rr))),
            protocol_ref(BinaryProtocol::new(WriterTransport::new(rw))),
        )
    }

    fn builder() -> RequestBuilder {
        Box::new(|| Box::new(TStr::default()))
    }

    #[tokio::test]
    async fn test_binary_dispatch_replies() {
        let (s_in, s_out, c_in, c_out) = wire();
        let processor = StandardProcessor::new(Vec::new());
        processor.add_processor(
            "echo",
            BinaryFunction::new(&processor, "echo", builder(), Arc::new(EchoHandler)),
        );

        {
            let mut prot = c_out.lock().await;
            prot.write_message_begin("echo", MessageType::Call, 11)
                .await
                .unwrap();
            prot.write_string("hi").await.unwrap();
            prot.write_message_end().await.unwrap();
            prot.flush().await.unwrap();
        }

        let (handled, result) = processor.process(&Context::new(), &s_in, &s_out).await;
        assert!(handled);
        result.unwrap();

        let mut prot = c_in.lock().await;
        let (name, mtype, seq_id) = prot.read_message_begin().await.unwrap();
        assert_eq!(name, "echo");
        assert_eq!(mtype, MessageType::Reply);
        assert_eq!(seq_id, 11);
        assert_eq!(prot.read_string().await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_unknown_method_writes_exception() {
        let (s_in, s_out, c_in, c_out) = wire();
        let processor = StandardProcessor::new(Vec::new());

        {
            let mut prot = c_out.lock().await;
            prot.write_message_begin("missing_method", MessageType::Call, 4)
                .await
                .unwrap();
            // Empty struct body so the unknown-method path can skip it.
            prot.write_field_stop().await.unwrap();
            prot.write_message_end().await.unwrap();
            prot.flush().await.unwrap();
        }

        let (handled, result) = processor.process(&Context::new(), &s_in, &s_out).await;
        assert!(!handled);
        let err = result.unwrap_err();
        assert_eq!(
            err.as_application().expect("application error").kind(),
            ApplicationErrorKind::UnknownMethod
        );

        let mut prot = c_in.lock().await;
        let (name, mtype, seq_id) = prot.read_message_begin().await.unwrap();
        assert_eq!(name, "missing_method");
        assert_eq!(mtype, MessageType::Exception);
        assert_eq!(seq_id, 4);
        let mut decoded = ApplicationError::default();
        Request::read(&mut decoded, &mut **prot).await.unwrap();
        assert_eq!(decoded.kind(), ApplicationErrorKind::UnknownMethod);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_internal_exception() {
        struct FailingHandler;

        #[async_trait]
        impl BinaryHandler for FailingHandler {
            async fn handle(
                &self,
                _ctx: &Context,
                _req: &dyn Request,
            ) -> Result<Box<dyn Response>> {
                Err(Error::Application(ApplicationError::new(
                    ApplicationErrorKind::Unknown,
                    "boom",
                )))
            }
        }

        let (s_in, s_out, c_in, c_out) = wire();
        let processor = StandardProcessor::new(Vec::new());
        processor.add_processor(
            "fragile",
            BinaryFunction::new(&processor, "fragile", builder(), Arc::new(FailingHandler)),
        );

        {
            let mut prot = c_out.lock().await;
            prot.write_message_begin("fragile", MessageType::Call, 1)
                .await
                .unwrap();
            prot.write_string("x").await.unwrap();
            prot.write_message_end().await.unwrap();
            prot.flush().await.unwrap();
        }

        let (handled, result) = processor.process(&Context::new(), &s_in, &s_out).await;
        assert!(handled);
        assert!(result.is_err());

        let mut prot = c_in.lock().await;
        let (_name, mtype, _seq_id) = prot.read_message_begin().await.unwrap();
        assert_eq!(mtype, MessageType::Exception);
        let mut decoded = ApplicationError::default();
        Request::read(&mut decoded, &mut **prot).await.unwrap();
        assert_eq!(decoded.kind(), ApplicationErrorKind::InternalError);
        assert!(decoded.message().contains("fragile"));
    }
}
