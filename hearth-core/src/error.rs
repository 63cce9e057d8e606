//! Hearth Error Types
//!
//! Socket-level error codes plus the crate-wide error enum.

use crate::id::ServiceId;
use serde::Serialize;
use std::io;
use thiserror::Error;

/// Broad classes that handshake and frame errors collapse into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    HandshakeFailed,
    ProtocolViolation,
}

/// Categorized socket and protocol failures.
///
/// Codes start at 800000 so they never collide with OS error numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SocketErrorKind {
    BufferOverflow = 800_000,
    InvalidReadOperation,
    ReadMessageTooBig,
    WriteMessageTooBig,
    ReadTimeout,
    SendQueueTooBig,

    // Malformed handshake family
    HandshakeBadHttpHeader,
    HandshakeBadHttpVersion,
    HandshakeBadMethod,
    HandshakeNoHost,
    HandshakeNoConnection,
    HandshakeNoUpgrade,
    HandshakeNoSecKey,
    HandshakeBadSecKey,
    HandshakeNoSecVersion,
    HandshakeBadSecVersion,
    HandshakeNoSecAccept,
    HandshakeBadSecAccept,
    HandshakeUpgradeDeclined,

    // Malformed frame family
    FrameBadOpcode,
    FrameBadDataFrame,
    FrameBadContinuation,
    FrameBadReservedBits,
    FrameBadControlFragment,
    FrameBadControlSize,
    FrameBadUnmaskedFrame,
    FrameBadMaskedFrame,
    FrameBadSize,
    FrameBadPayload,
    FrameBadCloseCode,
    FrameBadCloseSize,
    FrameBadClosePayload,

    Closed,
}

impl SocketErrorKind {
    #[inline]
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::BufferOverflow => "Buffer overflow",
            Self::InvalidReadOperation => "Invalid read operation",
            Self::ReadMessageTooBig => "Read message size too big",
            Self::WriteMessageTooBig => "Write message size too big",
            Self::ReadTimeout => "Socket read timeout",
            Self::SendQueueTooBig => "Send queue size too big",
            Self::HandshakeBadHttpHeader => "The HTTP header is malformed",
            Self::HandshakeBadHttpVersion => "The HTTP version is not 1.1",
            Self::HandshakeBadMethod => "The HTTP method is not GET",
            Self::HandshakeNoHost => "Missing Host field",
            Self::HandshakeNoConnection => "Missing Connection field",
            Self::HandshakeNoUpgrade => "Missing Upgrade field",
            Self::HandshakeNoSecKey => "Missing Sec-WebSocket-Key field",
            Self::HandshakeBadSecKey => "Malformed Sec-WebSocket-Key field",
            Self::HandshakeNoSecVersion => "Missing Sec-WebSocket-Version field",
            Self::HandshakeBadSecVersion => "Malformed Sec-WebSocket-Version field",
            Self::HandshakeNoSecAccept => "Missing Sec-WebSocket-Accept field",
            Self::HandshakeBadSecAccept => "Malformed Sec-WebSocket-Accept field",
            Self::HandshakeUpgradeDeclined => "The upgrade request was declined",
            Self::FrameBadOpcode => "Unknown frame opcode",
            Self::FrameBadDataFrame => "Unexpected data frame",
            Self::FrameBadContinuation => "Unexpected continuation frame",
            Self::FrameBadReservedBits => "Reserved bits set",
            Self::FrameBadControlFragment => "Fragmented control frame",
            Self::FrameBadControlSize => "Control frame payload too big",
            Self::FrameBadUnmaskedFrame => "Unmasked frame from client",
            Self::FrameBadMaskedFrame => "Masked frame from server",
            Self::FrameBadSize => "Frame size not canonical",
            Self::FrameBadPayload => "Frame payload is not valid UTF-8",
            Self::FrameBadCloseCode => "Invalid close code",
            Self::FrameBadCloseSize => "Invalid close frame size",
            Self::FrameBadClosePayload => "Invalid close frame payload",
            Self::Closed => "Connection closed",
        }
    }

    /// Broad condition for the handshake and frame families.
    #[must_use]
    pub const fn condition(self) -> Option<ErrorCondition> {
        match self {
            Self::HandshakeBadHttpHeader
            | Self::HandshakeBadHttpVersion
            | Self::HandshakeBadMethod
            | Self::HandshakeNoHost
            | Self::HandshakeNoConnection
            | Self::HandshakeNoUpgrade
            | Self::HandshakeNoSecKey
            | Self::HandshakeBadSecKey
            | Self::HandshakeNoSecVersion
            | Self::HandshakeBadSecVersion
            | Self::HandshakeNoSecAccept
            | Self::HandshakeBadSecAccept
            | Self::HandshakeUpgradeDeclined => Some(ErrorCondition::HandshakeFailed),
            Self::FrameBadOpcode
            | Self::FrameBadDataFrame
            | Self::FrameBadContinuation
            | Self::FrameBadReservedBits
            | Self::FrameBadControlFragment
            | Self::FrameBadControlSize
            | Self::FrameBadUnmaskedFrame
            | Self::FrameBadMaskedFrame
            | Self::FrameBadSize
            | Self::FrameBadPayload
            | Self::FrameBadCloseCode
            | Self::FrameBadCloseSize
            | Self::FrameBadClosePayload => Some(ErrorCondition::ProtocolViolation),
            _ => None,
        }
    }
}

/// Failure of one socket operation, as reported to the owning service.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("{}", .0.message())]
    Protocol(SocketErrorKind),

    #[error("End of file")]
    Eof,

    #[error("{0}")]
    Io(#[from] io::Error),
}

impl SocketError {
    /// Numeric code carried in error payloads: the categorized code, the OS
    /// error number, or 0 for end of file.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Protocol(kind) => kind.code(),
            Self::Eof => 0,
            Self::Io(e) => e.raw_os_error().unwrap_or(-1),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> Option<SocketErrorKind> {
        match self {
            Self::Protocol(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Render the ERROR payload: `{"addr":..,"code":..,"message":..}`.
    #[must_use]
    pub fn to_payload(&self, addr: &str) -> String {
        let payload = ErrorPayload {
            addr,
            code: self.code(),
            message: self.to_string(),
        };
        serde_json::to_string(&payload).unwrap_or_default()
    }
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    addr: &'a str,
    code: i32,
    message: String,
}

impl From<SocketErrorKind> for SocketError {
    fn from(kind: SocketErrorKind) -> Self {
        Self::Protocol(kind)
    }
}

/// Main error type for hearth operations
#[derive(Error, Debug)]
pub enum HearthError {
    /// IO error outside a registered socket
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Socket operation failed
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Service type '{0}' is already registered")]
    DuplicateServiceType(String),

    #[error("Unknown service type '{0}'")]
    UnknownServiceType(String),

    /// A service's `init` refused to start
    #[error("Service init failed: {0}")]
    ServiceInit(String),

    #[error("Worker {0} has no free service id")]
    ServiceIdExhausted(u8),

    #[error("Unique service name '{0}' is already taken")]
    UniqueNameTaken(String),

    #[error("No worker owns service {0}")]
    UnknownWorker(ServiceId),

    #[error("[{sender}] attempt send to dead service [{receiver}]")]
    DeadLetter { sender: ServiceId, receiver: ServiceId },

    /// Broadcast messages must not be redirected
    #[error("Broadcast message cannot be redirected")]
    BroadcastRedirect,

    /// The service waiting on a session went away
    #[error("Session abandoned")]
    SessionAbandoned,

    /// ERROR-typed reply from another service or the runtime
    #[error("{0}")]
    Remote(String),

    #[error("Invalid socket handle {0}")]
    InvalidHandle(u32),

    #[error("connect {host}:{port} timeout")]
    ConnectTimeout { host: String, port: u16 },

    #[error("Malformed reply: {0}")]
    Malformed(String),
}

/// Result type alias for hearth operations
pub type Result<T> = std::result::Result<T, HearthError>;

impl HearthError {
    /// Create a service init error with a message
    pub fn service_init(msg: impl Into<String>) -> Self {
        Self::ServiceInit(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Check if this is a connection error
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Socket(SocketError::Eof | SocketError::Io(_)) => true,
            Self::Socket(SocketError::Protocol(kind)) => matches!(
                kind,
                SocketErrorKind::Closed | SocketErrorKind::ReadTimeout
            ),
            Self::ConnectTimeout { .. } => true,
            _ => false,
        }
    }
}
