//! Protocol abstraction: framed Thrift messages over a [`Transport`].
//!
//! A message frame is `(name, message type, sequence id)` followed by a
//! struct body and an end marker. The runtime consumes this interface; the
//! [`crate::binary`] module provides the standard binary codec.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;

use crate::error::{
    ApplicationError, Error, ProtocolError, ProtocolErrorKind, Result,
};
use crate::message::{MessageType, TType};
use crate::transport::Transport;

/// Reads and writes framed Thrift messages and the primitives inside them.
///
/// Implementations hold their transport exclusively; shared access is
/// arranged through [`ProtocolRef`] handles, one for the input side and one
/// for the output side of a connection.
#[async_trait]
pub trait Protocol: Send {
    async fn write_message_begin(
        &mut self,
        name: &str,
        mtype: MessageType,
        seq_id: i32,
    ) -> Result<()>;
    async fn write_message_end(&mut self) -> Result<()>;

    async fn write_struct_begin(&mut self, name: &str) -> Result<()>;
    async fn write_struct_end(&mut self) -> Result<()>;
    async fn write_field_begin(&mut self, name: &str, ttype: TType, id: i16) -> Result<()>;
    async fn write_field_end(&mut self) -> Result<()>;
    async fn write_field_stop(&mut self) -> Result<()>;
    async fn write_map_begin(&mut self, key: TType, value: TType, size: usize) -> Result<()>;
    async fn write_map_end(&mut self) -> Result<()>;
    async fn write_list_begin(&mut self, elem: TType, size: usize) -> Result<()>;
    async fn write_list_end(&mut self) -> Result<()>;
    async fn write_set_begin(&mut self, elem: TType, size: usize) -> Result<()>;
    async fn write_set_end(&mut self) -> Result<()>;

    async fn write_bool(&mut self, value: bool) -> Result<()>;
    async fn write_byte(&mut self, value: i8) -> Result<()>;
    async fn write_i16(&mut self, value: i16) -> Result<()>;
    async fn write_i32(&mut self, value: i32) -> Result<()>;
    async fn write_i64(&mut self, value: i64) -> Result<()>;
    async fn write_double(&mut self, value: f64) -> Result<()>;
    async fn write_string(&mut self, value: &str) -> Result<()>;
    async fn write_binary(&mut self, value: &[u8]) -> Result<()>;

    async fn read_message_begin(&mut self) -> Result<(String, MessageType, i32)>;
    async fn read_message_end(&mut self) -> Result<()>;

    async fn read_struct_begin(&mut self) -> Result<()>;
    async fn read_struct_end(&mut self) -> Result<()>;
    async fn read_field_begin(&mut self) -> Result<(TType, i16)>;
    async fn read_field_end(&mut self) -> Result<()>;
    async fn read_map_begin(&mut self) -> Result<(TType, TType, usize)>;
    async fn read_map_end(&mut self) -> Result<()>;
    async fn read_list_begin(&mut self) -> Result<(TType, usize)>;
    async fn read_list_end(&mut self) -> Result<()>;
    async fn read_set_begin(&mut self) -> Result<(TType, usize)>;
    async fn read_set_end(&mut self) -> Result<()>;

    async fn read_bool(&mut self) -> Result<bool>;
    async fn read_byte(&mut self) -> Result<i8>;
    async fn read_i16(&mut self) -> Result<i16>;
    async fn read_i32(&mut self) -> Result<i32>;
    async fn read_i64(&mut self) -> Result<i64>;
    async fn read_double(&mut self) -> Result<f64>;
    async fn read_string(&mut self) -> Result<String>;
    async fn read_binary(&mut self) -> Result<Bytes>;

    /// Flushes any buffered frame bytes to the transport.
    async fn flush(&mut self) -> Result<()>;

    fn transport(&self) -> &dyn Transport;
    fn transport_mut(&mut self) -> &mut dyn Transport;
}

/// A protocol handle shared between a connection's users.
///
/// The input and output sides of a connection get distinct refs so a
/// blocked read never prevents a write. For bidirectional streams the
/// output-side mutex doubles as the write serialization lock.
pub type ProtocolRef = Arc<Mutex<Box<dyn Protocol>>>;

/// Wraps a protocol into a shareable [`ProtocolRef`].
pub fn protocol_ref(protocol: impl Protocol + 'static) -> ProtocolRef {
    Arc::new(Mutex::new(Box::new(protocol)))
}

/// Builds protocols over transports, used by servers to bind a codec to
/// each accepted connection.
pub trait ProtocolFactory: Send + Sync {
    fn protocol(&self, transport: Box<dyn Transport>) -> Box<dyn Protocol>;
}

/// A struct that can be read from and written to a protocol.
///
/// Request bodies are opaque to the runtime: it frames them and hands the
/// protocol over for the body. `as_any` lets handlers recover the concrete
/// type behind a trait object, the way generated service code does.
#[async_trait]
pub trait Request: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    async fn read(&mut self, iprot: &mut dyn Protocol) -> Result<()>;
    async fn write(&self, oprot: &mut dyn Protocol) -> Result<()>;
}

/// A response struct: a [`Request`] that additionally reports whether the
/// call produced a result and whether it carried a business exception.
pub trait Response: Request {
    fn is_set_success(&self) -> bool {
        true
    }

    fn business_error(&self) -> Option<ApplicationError> {
        None
    }
}

/// Default recursion budget for [`skip`].
pub const DEFAULT_SKIP_DEPTH: u32 = 64;

/// Skips one value of the given type, consuming nested content.
pub async fn skip(iprot: &mut dyn Protocol, ttype: TType) -> Result<()> {
    skip_depth(iprot, ttype, DEFAULT_SKIP_DEPTH).await
}

/// Skips one value with an explicit recursion budget.
pub fn skip_depth(iprot: &mut dyn Protocol, ttype: TType, depth: u32) -> BoxFuture<'_, Result<()>> {
    async move {
        if depth == 0 {
            return Err(Error::Protocol(ProtocolError::new(
                ProtocolErrorKind::DepthLimit,
                "depth limit exceeded while skipping",
            )));
        }

        match ttype {
            TType::Bool => iprot.read_bool().await.map(|_| ()),
            TType::Byte => iprot.read_byte().await.map(|_| ()),
            TType::I16 => iprot.read_i16().await.map(|_| ()),
            TType::I32 => iprot.read_i32().await.map(|_| ()),
            TType::I64 => iprot.read_i64().await.map(|_| ()),
            TType::Double => iprot.read_double().await.map(|_| ()),
            TType::String => iprot.read_binary().await.map(|_| ()),
            TType::Struct => {
                iprot.read_struct_begin().await?;
                loop {
                    let (ftype, _id) = iprot.read_field_begin().await?;
                    if ftype == TType::Stop {
                        break;
                    }
                    skip_depth(iprot, ftype, depth - 1).await?;
                    iprot.read_field_end().await?;
                }
                iprot.read_struct_end().await
            }
            TType::Map => {
                let (key, value, size) = iprot.read_map_begin().await?;
                for _ in 0..size {
                    skip_depth(iprot, key, depth - 1).await?;
                    skip_depth(iprot, value, depth - 1).await?;
                }
                iprot.read_map_end().await
            }
            TType::List => {
                let (elem, size) = iprot.read_list_begin().await?;
                for _ in 0..size {
                    skip_depth(iprot, elem, depth - 1).await?;
                }
                iprot.read_list_end().await
            }
            TType::Set => {
                let (elem, size) = iprot.read_set_begin().await?;
                for _ in 0..size {
                    skip_depth(iprot, elem, depth - 1).await?;
                }
                iprot.read_set_end().await
            }
            TType::Void | TType::Stop => Ok(()),
        }
    }
    .boxed()
}

// Wire form of an application exception: the standard two-field struct
// (1: message string, 2: type i32).
#[async_trait]
impl Request for ApplicationError {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn read(&mut self, iprot: &mut dyn Protocol) -> Result<()> {
        iprot.read_struct_begin().await?;
        loop {
            let (ftype, id) = iprot.read_field_begin().await?;
            if ftype == TType::Stop {
                break;
            }
            match (id, ftype) {
                (1, TType::String) => {
                    let message = iprot.read_string().await?;
                    self.set_message(message);
                }
                (2, TType::I32) => {
                    let type_id = iprot.read_i32().await?;
                    self.set_type_id(type_id);
                }
                (_, ftype) => skip(iprot, ftype).await?,
            }
            iprot.read_field_end().await?;
        }
        iprot.read_struct_end().await
    }

    async fn write(&self, oprot: &mut dyn Protocol) -> Result<()> {
        oprot.write_struct_begin("TApplicationException").await?;
        oprot.write_field_begin("message", TType::String, 1).await?;
        oprot.write_string(self.message()).await?;
        oprot.write_field_end().await?;
        oprot.write_field_begin("type", TType::I32, 2).await?;
        oprot.write_i32(self.type_id()).await?;
        oprot.write_field_end().await?;
        oprot.write_field_stop().await?;
        oprot.write_struct_end().await
    }
}

impl Response for ApplicationError {
    fn is_set_success(&self) -> bool {
        false
    }

    fn business_error(&self) -> Option<ApplicationError> {
        Some(self.clone())
    }
}
