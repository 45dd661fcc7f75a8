//! Thrift binary protocol codec.
//!
//! Strict-mode framing (versioned message headers) on the write side, with
//! lax acceptance of the old unversioned header on the read side unless
//! configured otherwise. Integers are big-endian; strings and binaries are
//! length-prefixed with an `i32`.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{
    Error, ProtocolError, ProtocolErrorKind, Result, TransportError, TransportErrorKind,
};
use crate::message::{MessageType, TType};
use crate::protocol::{Protocol, ProtocolFactory};
use crate::transport::Transport;

const VERSION_1: u32 = 0x8001_0000;
const VERSION_MASK: u32 = 0xffff_0000;

const READ_CHUNK: usize = 4096;

/// Configuration for the binary codec.
#[derive(Clone, Debug)]
pub struct BinaryConfig {
    /// Write versioned message headers. On by default; all peers produced
    /// by this crate expect them.
    pub strict_write: bool,
    /// Reject unversioned message headers on read. Off by default so old
    /// peers can still connect.
    pub strict_read: bool,
    /// Upper bound for any single length-prefixed value or container size.
    pub max_message_size: usize,
}

impl Default for BinaryConfig {
    fn default() -> Self {
        Self {
            strict_write: true,
            strict_read: false,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Binary protocol over any [`Transport`].
pub struct BinaryProtocol<T> {
    transport: T,
    config: BinaryConfig,
    wbuf: BytesMut,
    rbuf: BytesMut,
}

impl<T: Transport> BinaryProtocol<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, BinaryConfig::default())
    }

    pub fn with_config(transport: T, config: BinaryConfig) -> Self {
        Self {
            transport,
            config,
            wbuf: BytesMut::with_capacity(READ_CHUNK),
            rbuf: BytesMut::new(),
        }
    }

    /// Ensures `n` decoded bytes are buffered, then takes them.
    async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        while self.rbuf.len() < n {
            let mut chunk = [0u8; READ_CHUNK];
            let want = (n - self.rbuf.len()).min(READ_CHUNK);
            let got = self.transport.read(&mut chunk[..want]).await?;
            if got == 0 {
                return Err(Error::Transport(TransportError::new(
                    TransportErrorKind::EndOfFile,
                    "unexpected end of file",
                )));
            }
            self.rbuf.extend_from_slice(&chunk[..got]);
        }
        Ok(self.rbuf.split_to(n).freeze())
    }

    async fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_exact(1).await?[0])
    }

    fn check_size(&self, size: i32) -> Result<usize> {
        if size < 0 {
            return Err(Error::Protocol(ProtocolError::new(
                ProtocolErrorKind::NegativeSize,
                format!("negative size: {size}"),
            )));
        }
        let size = size as usize;
        if size > self.config.max_message_size {
            return Err(Error::Protocol(ProtocolError::new(
                ProtocolErrorKind::SizeLimit,
                format!(
                    "size {size} exceeds maximum {}",
                    self.config.max_message_size
                ),
            )));
        }
        Ok(size)
    }
}

#[async_trait]
impl<T: Transport> Protocol for BinaryProtocol<T> {
    async fn write_message_begin(
        &mut self,
        name: &str,
        mtype: MessageType,
        seq_id: i32,
    ) -> Result<()> {
        if self.config.strict_write {
            let header = (VERSION_1 | mtype as u32) as i32;
            self.write_i32(header).await?;
            self.write_string(name).await?;
            self.write_i32(seq_id).await
        } else {
            self.write_string(name).await?;
            self.write_byte(mtype as i32 as i8).await?;
            self.write_i32(seq_id).await
        }
    }

    async fn write_message_end(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_struct_begin(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn write_struct_end(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_field_begin(&mut self, _name: &str, ttype: TType, id: i16) -> Result<()> {
        self.write_byte(ttype as u8 as i8).await?;
        self.write_i16(id).await
    }

    async fn write_field_end(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_field_stop(&mut self) -> Result<()> {
        self.write_byte(TType::Stop as u8 as i8).await
    }

    async fn write_map_begin(&mut self, key: TType, value: TType, size: usize) -> Result<()> {
        self.write_byte(key as u8 as i8).await?;
        self.write_byte(value as u8 as i8).await?;
        self.write_i32(size as i32).await
    }

    async fn write_map_end(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_list_begin(&mut self, elem: TType, size: usize) -> Result<()> {
        self.write_byte(elem as u8 as i8).await?;
        self.write_i32(size as i32).await
    }

    async fn write_list_end(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_set_begin(&mut self, elem: TType, size: usize) -> Result<()> {
        self.write_byte(elem as u8 as i8).await?;
        self.write_i32(size as i32).await
    }

    async fn write_set_end(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_byte(if value { 1 } else { 0 }).await
    }

    async fn write_byte(&mut self, value: i8) -> Result<()> {
        self.wbuf.put_i8(value);
        Ok(())
    }

    async fn write_i16(&mut self, value: i16) -> Result<()> {
        self.wbuf.put_i16(value);
        Ok(())
    }

    async fn write_i32(&mut self, value: i32) -> Result<()> {
        self.wbuf.put_i32(value);
        Ok(())
    }

    async fn write_i64(&mut self, value: i64) -> Result<()> {
        self.wbuf.put_i64(value);
        Ok(())
    }

    async fn write_double(&mut self, value: f64) -> Result<()> {
        self.wbuf.put_u64(value.to_bits());
        Ok(())
    }

    async fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_binary(value.as_bytes()).await
    }

    async fn write_binary(&mut self, value: &[u8]) -> Result<()> {
        self.write_i32(value.len() as i32).await?;
        self.wbuf.extend_from_slice(value);
        Ok(())
    }

    async fn read_message_begin(&mut self) -> Result<(String, MessageType, i32)> {
        let header = self.read_i32().await?;
        if header < 0 {
            let version = header as u32 & VERSION_MASK;
            if version != VERSION_1 {
                return Err(Error::Protocol(ProtocolError::new(
                    ProtocolErrorKind::BadVersion,
                    format!("bad version in read_message_begin: {version:#x}"),
                )));
            }
            let mtype = MessageType::from_i32(header & 0xff)?;
            let name = self.read_string().await?;
            let seq_id = self.read_i32().await?;
            Ok((name, mtype, seq_id))
        } else {
            if self.config.strict_read {
                return Err(Error::Protocol(ProtocolError::new(
                    ProtocolErrorKind::BadVersion,
                    "missing version in read_message_begin",
                )));
            }
            let size = self.check_size(header)?;
            let name_bytes = self.read_exact(size).await?;
            let name = String::from_utf8(name_bytes.to_vec()).map_err(|e| {
                ProtocolError::with_cause(
                    ProtocolErrorKind::InvalidData,
                    "invalid utf-8 in method name",
                    Box::new(e),
                )
            })?;
            let mtype = MessageType::from_i32(self.read_byte().await? as i32)?;
            let seq_id = self.read_i32().await?;
            Ok((name, mtype, seq_id))
        }
    }

    async fn read_message_end(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_struct_begin(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_struct_end(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_field_begin(&mut self) -> Result<(TType, i16)> {
        let ttype = TType::from_u8(self.read_u8().await?)?;
        if ttype == TType::Stop {
            return Ok((TType::Stop, 0));
        }
        let id = self.read_i16().await?;
        Ok((ttype, id))
    }

    async fn read_field_end(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_map_begin(&mut self) -> Result<(TType, TType, usize)> {
        let key = TType::from_u8(self.read_u8().await?)?;
        let value = TType::from_u8(self.read_u8().await?)?;
        let size = self.read_i32().await?;
        Ok((key, value, self.check_size(size)?))
    }

    async fn read_map_end(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_list_begin(&mut self) -> Result<(TType, usize)> {
        let elem = TType::from_u8(self.read_u8().await?)?;
        let size = self.read_i32().await?;
        Ok((elem, self.check_size(size)?))
    }

    async fn read_list_end(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_set_begin(&mut self) -> Result<(TType, usize)> {
        let elem = TType::from_u8(self.read_u8().await?)?;
        let size = self.read_i32().await?;
        Ok((elem, self.check_size(size)?))
    }

    async fn read_set_end(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_byte().await? != 0)
    }

    async fn read_byte(&mut self) -> Result<i8> {
        Ok(self.read_u8().await? as i8)
    }

    async fn read_i16(&mut self) -> Result<i16> {
        let mut bytes = self.read_exact(2).await?;
        Ok(bytes.get_i16())
    }

    async fn read_i32(&mut self) -> Result<i32> {
        let mut bytes = self.read_exact(4).await?;
        Ok(bytes.get_i32())
    }

    async fn read_i64(&mut self) -> Result<i64> {
        let mut bytes = self.read_exact(8).await?;
        Ok(bytes.get_i64())
    }

    async fn read_double(&mut self) -> Result<f64> {
        let mut bytes = self.read_exact(8).await?;
        Ok(f64::from_bits(bytes.get_u64()))
    }

    async fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_binary().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| {
            Error::Protocol(ProtocolError::with_cause(
                ProtocolErrorKind::InvalidData,
                "invalid utf-8 in string",
                Box::new(e),
            ))
        })
    }

    async fn read_binary(&mut self) -> Result<Bytes> {
        let size = self.read_i32().await?;
        let size = self.check_size(size)?;
        self.read_exact(size).await
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.wbuf.is_empty() {
            let frame = self.wbuf.split();
            self.transport.write(&frame).await?;
        }
        self.transport.flush().await
    }

    fn transport(&self) -> &dyn Transport {
        &self.transport
    }

    fn transport_mut(&mut self) -> &mut dyn Transport {
        &mut self.transport
    }
}

/// Factory producing [`BinaryProtocol`] instances with a shared config.
#[derive(Clone, Debug, Default)]
pub struct BinaryProtocolFactory {
    config: BinaryConfig,
}

impl BinaryProtocolFactory {
    pub fn new(config: BinaryConfig) -> Self {
        Self { config }
    }
}

impl ProtocolFactory for BinaryProtocolFactory {
    fn protocol(&self, transport: Box<dyn Transport>) -> Box<dyn Protocol> {
        Box::new(BinaryProtocol::with_config(transport, self.config.clone()))
    }
}
