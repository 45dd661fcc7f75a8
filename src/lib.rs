//! Thrum - Thrift-Compatible Streaming RPC Runtime
//!
//! This crate provides the core runtime of a Thrift-compatible RPC library:
//! the message-framed request/response engine extended with three streaming
//! modes — server-streaming, client-streaming, and bidirectional — layered
//! on top of a single ordered byte transport.
//!
//! # Features
//!
//! - **Unary and one-way calls** with sequence-id and method validation
//! - **Streaming** in all three modes, with GOAWAY/GOAWAY-ACK half-close
//!   handshakes per direction
//! - **Middleware** composed onion-style around every dispatch
//! - **Transport agnostic** - works over any `AsyncRead`/`AsyncWrite` pair
//!
//! # Quick Start
//!
//! ## Client
//!
//! ```rust,ignore
//! use thrum::{BinaryProtocolFactory, Client, Context, SyncClient};
//! use tokio::net::TcpStream;
//!
//! let io = TcpStream::connect("127.0.0.1:9090").await?;
//! let client = SyncClient::from_io(io, &BinaryProtocolFactory::default(), vec![]);
//!
//! let mut res = MyResponse::default();
//! client.call_binary(&Context::new(), "my_method", &request, &mut res).await?;
//! ```
//!
//! ## Server
//!
//! ```rust,ignore
//! use thrum::{BinaryFunction, BinaryProtocolFactory, SimpleServer, StandardProcessor};
//! use std::sync::Arc;
//!
//! let processor = StandardProcessor::new(vec![]);
//! processor.add_processor(
//!     "my_method",
//!     BinaryFunction::new(&processor, "my_method", builder, Arc::new(MyHandler)),
//! );
//!
//! let server = SimpleServer::new(processor, BinaryProtocolFactory::default());
//! server.serve(listener).await?;
//! ```
//!
//! # Wire Format
//!
//! Standard Thrift message framing via the binary protocol: each frame is
//! `(method name, message type, sequence id)` plus a struct body. Streaming
//! adds six control message types; every stream frame carries the opening
//! call's name and sequence id, and each direction half-closes with a
//! GOAWAY answered by a GOAWAY-ACK.

pub mod binary;
pub mod client;
pub mod context;
pub mod error;
pub mod message;
pub mod middleware;
pub mod processor;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod testing;
pub mod transport;

mod bidi;
mod inbound;
mod outbound;

// Re-exports for convenience.
pub use binary::{BinaryConfig, BinaryProtocol, BinaryProtocolFactory};
pub use client::{Client, SyncClient};
pub use context::Context;
pub use error::{
    prepend_error, ApplicationError, ApplicationErrorKind, Error, ProtocolError,
    ProtocolErrorKind, Result, TransportError, TransportErrorKind, FIRST_USER_ERROR,
};
pub use message::{MessageType, TType};
pub use middleware::{Middleware, NoopMiddleware};
pub use processor::{
    BinaryFunction, BinaryHandler, Processor, ProcessorFunction, RequestBuilder,
    StandardProcessor, StreamBidiFunction, StreamBidiHandler, StreamClientFunction,
    StreamClientHandler, StreamServerFunction, StreamServerHandler, UnaryFunction, UnaryHandler,
};
pub use protocol::{
    protocol_ref, Protocol, ProtocolFactory, ProtocolRef, Request, Response,
};
pub use server::SimpleServer;
pub use stream::{InboundStream, Latch, OutboundStream};
pub use transport::{ReaderTransport, Transport, WriterTransport};

// Re-export async_trait for downstream service implementations.
pub use async_trait::async_trait;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{Client, SyncClient};
    pub use crate::context::Context;
    pub use crate::error::{Error, Result};
    pub use crate::middleware::Middleware;
    pub use crate::processor::{Processor, StandardProcessor};
    pub use crate::protocol::{Protocol, Request, Response};
    pub use crate::stream::{InboundStream, OutboundStream};

    pub use async_trait::async_trait;
}
