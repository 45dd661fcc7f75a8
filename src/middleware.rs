//! Onion-style middleware around every dispatch.
//!
//! A [`Middleware`] wraps unary, binary (request/response) and streaming
//! dispatch. Each entry point receives the call metadata plus a `Next`
//! value representing the rest of the chain; it either invokes the next
//! link (possibly with an altered context or request) or short-circuits
//! with a synthesized response or error.
//!
//! Every entry point has a pass-through default, so a middleware that only
//! cares about unary/binary calls is implicitly upgraded to a streaming one:
//! streams flow through unchanged.
//!
//! Composition walks a shared slice with a cursor instead of folding
//! closures: `Next::run` peels the first middleware off the slice and hands
//! it a `Next` for the remainder, so middlewares run outer-to-inner on the
//! way in and inner-to-outer on the way out.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::Context;
use crate::error::Result;
use crate::protocol::{Request, Response};
use crate::stream::{InboundStream, OutboundStream};

/// Result of a response-producing chain.
///
/// Server-side terminals yield `Some(response)`; the client terminal
/// decodes into the caller's slot and yields `None`.
pub type ResponseResult = Result<Option<Box<dyn Response>>>;

pub type BinaryTerminal<'a> =
    Box<dyn FnOnce(&'a Context, &'a dyn Request) -> BoxFuture<'a, ResponseResult> + Send + 'a>;

pub type UnaryTerminal<'a> =
    Box<dyn FnOnce(&'a Context, &'a dyn Request) -> BoxFuture<'a, Result<()>> + Send + 'a>;

pub type InboundStreamTerminal<'a> = Box<
    dyn FnOnce(&'a Context, &'a dyn Request, Arc<dyn InboundStream>) -> BoxFuture<'a, ResponseResult>
        + Send
        + 'a,
>;

pub type OutboundStreamTerminal<'a> = Box<
    dyn FnOnce(&'a Context, &'a dyn Request, Arc<dyn OutboundStream>) -> BoxFuture<'a, ResponseResult>
        + Send
        + 'a,
>;

pub type BidiStreamTerminal<'a> = Box<
    dyn FnOnce(
            &'a Context,
            &'a dyn Request,
            Arc<dyn InboundStream>,
            Arc<dyn OutboundStream>,
        ) -> BoxFuture<'a, ResponseResult>
        + Send
        + 'a,
>;

/// The rest of a binary-call chain.
pub struct BinaryNext<'a> {
    chain: &'a [Arc<dyn Middleware>],
    method: &'a str,
    seq_id: i32,
    terminal: BinaryTerminal<'a>,
}

impl<'a> BinaryNext<'a> {
    pub fn new(
        chain: &'a [Arc<dyn Middleware>],
        method: &'a str,
        seq_id: i32,
        terminal: BinaryTerminal<'a>,
    ) -> Self {
        Self {
            chain,
            method,
            seq_id,
            terminal,
        }
    }

    /// Invokes the remainder of the chain.
    pub fn run(self, ctx: &'a Context, req: &'a dyn Request) -> BoxFuture<'a, ResponseResult> {
        let Self {
            chain,
            method,
            seq_id,
            terminal,
        } = self;
        match chain.split_first() {
            Some((mw, rest)) => mw.handle_binary(
                ctx,
                method,
                seq_id,
                req,
                BinaryNext {
                    chain: rest,
                    method,
                    seq_id,
                    terminal,
                },
            ),
            None => terminal(ctx, req),
        }
    }
}

/// The rest of a one-way chain.
pub struct UnaryNext<'a> {
    chain: &'a [Arc<dyn Middleware>],
    method: &'a str,
    seq_id: i32,
    terminal: UnaryTerminal<'a>,
}

impl<'a> UnaryNext<'a> {
    pub fn new(
        chain: &'a [Arc<dyn Middleware>],
        method: &'a str,
        seq_id: i32,
        terminal: UnaryTerminal<'a>,
    ) -> Self {
        Self {
            chain,
            method,
            seq_id,
            terminal,
        }
    }

    pub fn run(self, ctx: &'a Context, req: &'a dyn Request) -> BoxFuture<'a, Result<()>> {
        let Self {
            chain,
            method,
            seq_id,
            terminal,
        } = self;
        match chain.split_first() {
            Some((mw, rest)) => mw.handle_unary(
                ctx,
                method,
                seq_id,
                req,
                UnaryNext {
                    chain: rest,
                    method,
                    seq_id,
                    terminal,
                },
            ),
            None => terminal(ctx, req),
        }
    }
}

/// The rest of a client-streaming (inbound sink) dispatch chain.
pub struct InboundStreamNext<'a> {
    chain: &'a [Arc<dyn Middleware>],
    method: &'a str,
    seq_id: i32,
    terminal: InboundStreamTerminal<'a>,
}

impl<'a> InboundStreamNext<'a> {
    pub fn new(
        chain: &'a [Arc<dyn Middleware>],
        method: &'a str,
        seq_id: i32,
        terminal: InboundStreamTerminal<'a>,
    ) -> Self {
        Self {
            chain,
            method,
            seq_id,
            terminal,
        }
    }

    pub fn run(
        self,
        ctx: &'a Context,
        req: &'a dyn Request,
        sink: Arc<dyn InboundStream>,
    ) -> BoxFuture<'a, ResponseResult> {
        let Self {
            chain,
            method,
            seq_id,
            terminal,
        } = self;
        match chain.split_first() {
            Some((mw, rest)) => mw.handle_inbound_stream(
                ctx,
                method,
                seq_id,
                req,
                sink,
                InboundStreamNext {
                    chain: rest,
                    method,
                    seq_id,
                    terminal,
                },
            ),
            None => terminal(ctx, req, sink),
        }
    }
}

/// The rest of a server-streaming (outbound stream) dispatch chain.
pub struct OutboundStreamNext<'a> {
    chain: &'a [Arc<dyn Middleware>],
    method: &'a str,
    seq_id: i32,
    terminal: OutboundStreamTerminal<'a>,
}

impl<'a> OutboundStreamNext<'a> {
    pub fn new(
        chain: &'a [Arc<dyn Middleware>],
        method: &'a str,
        seq_id: i32,
        terminal: OutboundStreamTerminal<'a>,
    ) -> Self {
        Self {
            chain,
            method,
            seq_id,
            terminal,
        }
    }

    pub fn run(
        self,
        ctx: &'a Context,
        req: &'a dyn Request,
        stream: Arc<dyn OutboundStream>,
    ) -> BoxFuture<'a, ResponseResult> {
        let Self {
            chain,
            method,
            seq_id,
            terminal,
        } = self;
        match chain.split_first() {
            Some((mw, rest)) => mw.handle_outbound_stream(
                ctx,
                method,
                seq_id,
                req,
                stream,
                OutboundStreamNext {
                    chain: rest,
                    method,
                    seq_id,
                    terminal,
                },
            ),
            None => terminal(ctx, req, stream),
        }
    }
}

/// The rest of a bidirectional dispatch chain.
pub struct BidiStreamNext<'a> {
    chain: &'a [Arc<dyn Middleware>],
    method: &'a str,
    seq_id: i32,
    terminal: BidiStreamTerminal<'a>,
}

impl<'a> BidiStreamNext<'a> {
    pub fn new(
        chain: &'a [Arc<dyn Middleware>],
        method: &'a str,
        seq_id: i32,
        terminal: BidiStreamTerminal<'a>,
    ) -> Self {
        Self {
            chain,
            method,
            seq_id,
            terminal,
        }
    }

    pub fn run(
        self,
        ctx: &'a Context,
        req: &'a dyn Request,
        sink: Arc<dyn InboundStream>,
        stream: Arc<dyn OutboundStream>,
    ) -> BoxFuture<'a, ResponseResult> {
        let Self {
            chain,
            method,
            seq_id,
            terminal,
        } = self;
        match chain.split_first() {
            Some((mw, rest)) => mw.handle_bidi_stream(
                ctx,
                method,
                seq_id,
                req,
                sink,
                stream,
                BidiStreamNext {
                    chain: rest,
                    method,
                    seq_id,
                    terminal,
                },
            ),
            None => terminal(ctx, req, sink, stream),
        }
    }
}

/// Composable wrapper invoked around every dispatch.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Wraps a request/response call.
    async fn handle_binary<'a>(
        &self,
        ctx: &'a Context,
        method: &'a str,
        seq_id: i32,
        req: &'a dyn Request,
        next: BinaryNext<'a>,
    ) -> ResponseResult {
        let _ = (method, seq_id);
        next.run(ctx, req).await
    }

    /// Wraps a one-way call.
    async fn handle_unary<'a>(
        &self,
        ctx: &'a Context,
        method: &'a str,
        seq_id: i32,
        req: &'a dyn Request,
        next: UnaryNext<'a>,
    ) -> Result<()> {
        let _ = (method, seq_id);
        next.run(ctx, req).await
    }

    /// Wraps a client-streaming dispatch.
    async fn handle_inbound_stream<'a>(
        &self,
        ctx: &'a Context,
        method: &'a str,
        seq_id: i32,
        req: &'a dyn Request,
        sink: Arc<dyn InboundStream>,
        next: InboundStreamNext<'a>,
    ) -> ResponseResult {
        let _ = (method, seq_id);
        next.run(ctx, req, sink).await
    }

    /// Wraps a server-streaming dispatch.
    async fn handle_outbound_stream<'a>(
        &self,
        ctx: &'a Context,
        method: &'a str,
        seq_id: i32,
        req: &'a dyn Request,
        stream: Arc<dyn OutboundStream>,
        next: OutboundStreamNext<'a>,
    ) -> ResponseResult {
        let _ = (method, seq_id);
        next.run(ctx, req, stream).await
    }

    /// Wraps a bidirectional dispatch.
    async fn handle_bidi_stream<'a>(
        &self,
        ctx: &'a Context,
        method: &'a str,
        seq_id: i32,
        req: &'a dyn Request,
        sink: Arc<dyn InboundStream>,
        stream: Arc<dyn OutboundStream>,
        next: BidiStreamNext<'a>,
    ) -> ResponseResult {
        let _ = (method, seq_id);
        next.run(ctx, req, sink, stream).await
    }
}

/// A middleware that passes everything through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMiddleware;

impl Middleware for NoopMiddleware {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::Mutex as StdMutex;

    use crate::protocol::Protocol;

    struct EmptyRequest;

    #[async_trait]
    impl Request for EmptyRequest {
        fn as_any(&self) -> &dyn Any {
            self
        }

        async fn read(&mut self, _iprot: &mut dyn Protocol) -> Result<()> {
            Ok(())
        }

        async fn write(&self, _oprot: &mut dyn Protocol) -> Result<()> {
            Ok(())
        }
    }

    struct Tagged {
        v: i32,
        out: Arc<StdMutex<String>>,
    }

    impl Tagged {
        fn emit(&self, s: String) {
            self.out.lock().unwrap().push_str(&s);
        }
    }

    #[async_trait]
    impl Middleware for Tagged {
        async fn handle_binary<'a>(
            &self,
            ctx: &'a Context,
            _method: &'a str,
            _seq_id: i32,
            req: &'a dyn Request,
            next: BinaryNext<'a>,
        ) -> ResponseResult {
            self.emit(format!("[b {} in]", self.v));
            let res = next.run(ctx, req).await;
            self.emit(format!("[b {} out]", self.v));
            res
        }

        async fn handle_unary<'a>(
            &self,
            ctx: &'a Context,
            _method: &'a str,
            _seq_id: i32,
            req: &'a dyn Request,
            next: UnaryNext<'a>,
        ) -> Result<()> {
            self.emit(format!("[u {} in]", self.v));
            let res = next.run(ctx, req).await;
            self.emit(format!("[u {} out]", self.v));
            res
        }
    }

    fn tagged_chain(out: &Arc<StdMutex<String>>) -> Vec<Arc<dyn Middleware>> {
        (1..=3)
            .map(|v| {
                Arc::new(Tagged {
                    v,
                    out: out.clone(),
                }) as Arc<dyn Middleware>
            })
            .collect()
    }

    #[tokio::test]
    async fn test_binary_chain_order() {
        let out = Arc::new(StdMutex::new(String::new()));
        let chain = tagged_chain(&out);
        let ctx = Context::new();
        let req = EmptyRequest;

        let terminal: BinaryTerminal<'_> = Box::new(|_ctx, _req| Box::pin(async { Ok(None) }));
        let next = BinaryNext::new(&chain, "m", 0, terminal);
        next.run(&ctx, &req).await.unwrap();

        assert_eq!(
            &*out.lock().unwrap(),
            "[b 1 in][b 2 in][b 3 in][b 3 out][b 2 out][b 1 out]"
        );
    }

    #[tokio::test]
    async fn test_unary_chain_order() {
        let out = Arc::new(StdMutex::new(String::new()));
        let chain = tagged_chain(&out);
        let ctx = Context::new();
        let req = EmptyRequest;

        let terminal: UnaryTerminal<'_> = Box::new(|_ctx, _req| Box::pin(async { Ok(()) }));
        let next = UnaryNext::new(&chain, "m", 0, terminal);
        next.run(&ctx, &req).await.unwrap();

        assert_eq!(
            &*out.lock().unwrap(),
            "[u 1 in][u 2 in][u 3 in][u 3 out][u 2 out][u 1 out]"
        );
    }

    #[tokio::test]
    async fn test_empty_chain_is_identity() {
        let chain: Vec<Arc<dyn Middleware>> = Vec::new();
        let ctx = Context::new();
        let req = EmptyRequest;

        let ran = Arc::new(StdMutex::new(false));
        let ran_clone = ran.clone();
        let terminal: UnaryTerminal<'_> = Box::new(move |_ctx, _req| {
            Box::pin(async move {
                *ran_clone.lock().unwrap() = true;
                Ok(())
            })
        });
        UnaryNext::new(&chain, "m", 0, terminal)
            .run(&ctx, &req)
            .await
            .unwrap();
        assert!(*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn test_noop_middleware_passes_streams_through() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(NoopMiddleware)];
        let ctx = Context::new();
        let req = EmptyRequest;

        // A non-streaming middleware is upgraded by its default methods; the
        // unary path below exercises the default pass-through.
        let terminal: UnaryTerminal<'_> = Box::new(|_ctx, _req| Box::pin(async { Ok(()) }));
        UnaryNext::new(&chain, "m", 7, terminal)
            .run(&ctx, &req)
            .await
            .unwrap();
    }
}
