//! Error types for thrum.
//!
//! Errors fall into three wire-visible families, each carrying a numeric
//! type id: [`TransportError`] (I/O layer), [`ProtocolError`] (encoding
//! layer), and [`ApplicationError`] (dispatch layer, serialized as an
//! exception reply). Two sentinels sit outside the families: [`Error::Eof`],
//! the normalized end-of-stream marker every stream operation reports once
//! its stream is closed, and [`Error::Cancelled`] for context cancellation.

use thiserror::Error;

/// Source error attached to an exception.
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Numeric type ids for [`TransportError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum TransportErrorKind {
    Unknown = 0,
    NotOpen = 1,
    AlreadyOpen = 2,
    TimedOut = 3,
    EndOfFile = 4,
}

/// An error raised by the byte transport.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    #[source]
    cause: Option<Cause>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(kind: TransportErrorKind, message: impl Into<String>, cause: Cause) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: Some(cause),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// The wire-visible numeric type id.
    pub fn type_id(&self) -> i32 {
        self.kind as i32
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::UnexpectedEof => TransportErrorKind::EndOfFile,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportErrorKind::TimedOut
            }
            std::io::ErrorKind::NotConnected => TransportErrorKind::NotOpen,
            _ => TransportErrorKind::Unknown,
        };
        Self::with_cause(kind, err.to_string(), Box::new(err))
    }
}

/// Numeric type ids for [`ProtocolError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ProtocolErrorKind {
    Unknown = 0,
    InvalidData = 1,
    NegativeSize = 2,
    SizeLimit = 3,
    BadVersion = 4,
    NotImplemented = 5,
    DepthLimit = 6,
}

/// An error raised by the protocol codec.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ProtocolError {
    kind: ProtocolErrorKind,
    message: String,
    #[source]
    cause: Option<Cause>,
}

impl ProtocolError {
    pub fn new(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(kind: ProtocolErrorKind, message: impl Into<String>, cause: Cause) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: Some(cause),
        }
    }

    pub fn kind(&self) -> ProtocolErrorKind {
        self.kind
    }

    pub fn type_id(&self) -> i32 {
        self.kind as i32
    }
}

/// Well-known type ids for [`ApplicationError`].
///
/// Ids below [`FIRST_USER_ERROR`] are reserved for the runtime; services may
/// define their own ids at or above it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ApplicationErrorKind {
    Unknown = 0,
    UnknownMethod = 1,
    InvalidMessageType = 2,
    WrongMethodName = 3,
    BadSequenceId = 4,
    MissingResult = 5,
    InternalError = 6,
    ProtocolError = 7,
    InternalTimeout = 8,
}

/// First application error type id available to user-defined exceptions.
pub const FIRST_USER_ERROR: i32 = 256;

/// An application-level exception, serialized as an `Exception` reply.
#[derive(Error, Debug, Clone, Default)]
#[error("{message}")]
pub struct ApplicationError {
    type_id: i32,
    message: String,
}

impl ApplicationError {
    pub fn new(kind: ApplicationErrorKind, message: impl Into<String>) -> Self {
        Self {
            type_id: kind as i32,
            message: message.into(),
        }
    }

    /// Creates an application error with an explicit type id, for
    /// user-defined exception ids.
    pub fn with_type_id(type_id: i32, message: impl Into<String>) -> Self {
        Self {
            type_id,
            message: message.into(),
        }
    }

    pub fn type_id(&self) -> i32 {
        self.type_id
    }

    /// The well-known kind for this type id, if it is a reserved one.
    pub fn kind(&self) -> ApplicationErrorKind {
        match self.type_id {
            1 => ApplicationErrorKind::UnknownMethod,
            2 => ApplicationErrorKind::InvalidMessageType,
            3 => ApplicationErrorKind::WrongMethodName,
            4 => ApplicationErrorKind::BadSequenceId,
            5 => ApplicationErrorKind::MissingResult,
            6 => ApplicationErrorKind::InternalError,
            7 => ApplicationErrorKind::ProtocolError,
            8 => ApplicationErrorKind::InternalTimeout,
            _ => ApplicationErrorKind::Unknown,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn set_type_id(&mut self, type_id: i32) {
        self.type_id = type_id;
    }

    pub(crate) fn set_message(&mut self, message: String) {
        self.message = message;
    }
}

/// Errors that can occur in thrum operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The byte transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The protocol codec failed or the peer violated the framing rules.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer reported an application exception, or dispatch failed.
    #[error(transparent)]
    Application(#[from] ApplicationError),

    /// The stream or connection reached its end.
    #[error("end of stream")]
    Eof,

    /// The context governing the operation was cancelled.
    #[error("context cancelled")]
    Cancelled,
}

impl Error {
    /// Returns true if this is the normalized end-of-stream sentinel.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }

    /// Returns true if this error indicates a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Transport(t) => t.kind() == TransportErrorKind::TimedOut,
            Error::Application(a) => a.kind() == ApplicationErrorKind::InternalTimeout,
            _ => false,
        }
    }

    /// Returns true if this error indicates the context was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Returns the application exception, if this is one.
    pub fn as_application(&self) -> Option<&ApplicationError> {
        match self {
            Error::Application(a) => Some(a),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.into())
    }
}

/// Result type alias using thrum's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Prepends context to an error message while preserving its exception
/// family and numeric type id.
pub fn prepend_error(prefix: &str, err: Error) -> Error {
    match err {
        Error::Transport(t) => {
            let kind = t.kind();
            let message = format!("{prefix}{t}");
            Error::Transport(TransportError::with_cause(kind, message, Box::new(t)))
        }
        Error::Protocol(p) => {
            let kind = p.kind();
            let message = format!("{prefix}{p}");
            Error::Protocol(ProtocolError::with_cause(kind, message, Box::new(p)))
        }
        Error::Application(a) => {
            let type_id = a.type_id();
            Error::Application(ApplicationError::with_type_id(
                type_id,
                format!("{prefix}{a}"),
            ))
        }
        other => other,
    }
}
