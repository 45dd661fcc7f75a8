//! Wire-level message and element type constants.

use crate::error::{Error, ProtocolError, ProtocolErrorKind, Result};

/// Thrift message types, including the streaming control vocabulary.
///
/// Values 1..=4 are the standard Thrift assignments. The streaming types
/// extend them contiguously so that for each direction the acknowledgement
/// type is always `goaway + 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    /// Unary/binary request.
    Call = 1,
    /// Successful response.
    Reply = 2,
    /// Application or protocol exception response.
    Exception = 3,
    /// Fire-and-forget request.
    Oneway = 4,
    /// Data frame, client to server.
    ClientStreamMessage = 5,
    /// Half-close request, client to server.
    ClientStreamGoAway = 6,
    ClientStreamGoAwayAck = 7,
    /// Data frame, server to client.
    ServerStreamMessage = 8,
    /// Half-close request, server to client.
    ServerStreamGoAway = 9,
    ServerStreamGoAwayAck = 10,
}

impl MessageType {
    /// Decodes a wire value.
    pub fn from_i32(value: i32) -> Result<Self> {
        Ok(match value {
            1 => MessageType::Call,
            2 => MessageType::Reply,
            3 => MessageType::Exception,
            4 => MessageType::Oneway,
            5 => MessageType::ClientStreamMessage,
            6 => MessageType::ClientStreamGoAway,
            7 => MessageType::ClientStreamGoAwayAck,
            8 => MessageType::ServerStreamMessage,
            9 => MessageType::ServerStreamGoAway,
            10 => MessageType::ServerStreamGoAwayAck,
            other => {
                return Err(Error::Protocol(ProtocolError::new(
                    ProtocolErrorKind::InvalidData,
                    format!("invalid message type: {other}"),
                )))
            }
        })
    }

    /// The acknowledgement type paired with a GOAWAY type.
    ///
    /// Returns the input unchanged for non-GOAWAY types.
    pub fn goaway_ack(self) -> MessageType {
        match self {
            MessageType::ClientStreamGoAway => MessageType::ClientStreamGoAwayAck,
            MessageType::ServerStreamGoAway => MessageType::ServerStreamGoAwayAck,
            other => other,
        }
    }
}

/// Thrift element types, used in struct, container and skip encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TType {
    Stop = 0,
    Void = 1,
    Bool = 2,
    Byte = 3,
    Double = 4,
    I16 = 6,
    I32 = 8,
    I64 = 10,
    String = 11,
    Struct = 12,
    Map = 13,
    Set = 14,
    List = 15,
}

impl TType {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => TType::Stop,
            1 => TType::Void,
            2 => TType::Bool,
            3 => TType::Byte,
            4 => TType::Double,
            6 => TType::I16,
            8 => TType::I32,
            10 => TType::I64,
            11 => TType::String,
            12 => TType::Struct,
            13 => TType::Map,
            14 => TType::Set,
            15 => TType::List,
            other => {
                return Err(Error::Protocol(ProtocolError::new(
                    ProtocolErrorKind::InvalidData,
                    format!("invalid element type: {other}"),
                )))
            }
        })
    }
}
