//! Error handling for the Gridline Modbus library.
//!
//! Every request made through a client surfaces its outcome through exactly
//! one path: the value returned by the awaited operation. Decode failures,
//! transport loss, timeouts and Modbus exception responses are all values of
//! [`ModbusError`]; nothing in the core panics or throws across a task
//! boundary.
//!
//! The taxonomy distinguishes:
//!
//! - **Local validation**: [`ModbusError::InvalidArgument`], for a request that
//!   never touched the wire.
//! - **Transport conditions**: [`ModbusError::Timeout`],
//!   [`ModbusError::ConnectionLost`], [`ModbusError::NotConnected`],
//!   [`ModbusError::Io`].
//! - **Protocol conditions**: [`ModbusError::Exception`] (the server
//!   answered with an exception PDU), [`ModbusError::Decode`] (the response
//!   or frame was malformed).
//! - **Client-side lifecycle**: [`ModbusError::TooManyOutstanding`],
//!   [`ModbusError::Cancelled`].

use thiserror::Error;

use crate::protocol::ModbusException;

/// Result type alias used throughout the library.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Ways a PDU or frame can fail to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The buffer ended before the fields required by the function code.
    Truncated,
    /// A quantity field is outside the range allowed for its function code.
    QuantityOutOfRange,
    /// A byte-count field disagrees with the quantity or the buffer length.
    ByteCountMismatch,
    /// The function code is not part of the supported catalogue.
    UnsupportedFunction(u8),
    /// The function code is valid but does not match the outstanding request.
    UnexpectedFunction(u8),
    /// A single-coil value was neither 0x0000 nor 0xFF00.
    InvalidCoilValue(u16),
    /// RTU frame checksum failure.
    CrcMismatch { expected: u16, actual: u16 },
    /// An MBAP length field claims more than a maximum-size frame. The byte
    /// stream is desynchronized and the connection must be torn down.
    OversizedFrame { length: usize },
}

impl std::fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated PDU"),
            Self::QuantityOutOfRange => write!(f, "quantity out of range"),
            Self::ByteCountMismatch => write!(f, "byte count mismatch"),
            Self::UnsupportedFunction(fc) => write!(f, "unsupported function code 0x{fc:02X}"),
            Self::UnexpectedFunction(fc) => write!(f, "unexpected function code 0x{fc:02X}"),
            Self::InvalidCoilValue(v) => write!(f, "invalid coil value 0x{v:04X}"),
            Self::CrcMismatch { expected, actual } => {
                write!(f, "CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")
            }
            Self::OversizedFrame { length } => {
                write!(f, "oversized frame: length field {length}")
            }
        }
    }
}

/// Errors surfaced by Modbus client operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// An address, quantity or value constraint was violated before send.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The per-request deadline elapsed before a response arrived.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The transport disconnected while the request was outstanding.
    #[error("connection lost: {cause}")]
    ConnectionLost { cause: String },

    /// The server device answered with a Modbus exception PDU.
    #[error("modbus exception from function 0x{function:02X}: {exception}")]
    Exception {
        /// Function code of the originating request.
        function: u8,
        exception: ModbusException,
    },

    /// The response PDU or the enclosing frame was malformed.
    #[error("decode error: {kind}")]
    Decode { kind: DecodeErrorKind },

    /// All 65536 transaction identifiers are held by pending requests.
    #[error("transaction identifier space exhausted")]
    TooManyOutstanding,

    /// The request was cancelled before completion.
    #[error("request cancelled")]
    Cancelled,

    /// The transport is not connected; the request was rejected immediately.
    #[error("transport not connected")]
    NotConnected,

    /// Low-level I/O failure (socket or serial line).
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Client or transport configuration problem.
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl ModbusError {
    /// Create an [`ModbusError::InvalidArgument`] error.
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Create a [`ModbusError::Timeout`] error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a [`ModbusError::ConnectionLost`] error.
    pub fn connection_lost<S: Into<String>>(cause: S) -> Self {
        Self::ConnectionLost { cause: cause.into() }
    }

    /// Create a [`ModbusError::Exception`] error from a raw exception code.
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception { function, exception: ModbusException::from_u8(code) }
    }

    /// Create a [`ModbusError::Decode`] error.
    pub fn decode(kind: DecodeErrorKind) -> Self {
        Self::Decode { kind }
    }

    /// Create a [`ModbusError::Io`] error.
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a [`ModbusError::Configuration`] error.
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether retrying the operation could plausibly succeed.
    ///
    /// Timeouts and transport interruptions are transient; a device
    /// answering Acknowledge or ServerDeviceBusy is asking the client to
    /// come back later. Validation and decode failures are permanent.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::ConnectionLost { .. }
            | Self::NotConnected
            | Self::Io { .. }
            | Self::TooManyOutstanding => true,
            Self::Exception { exception, .. } => matches!(
                exception,
                ModbusException::Acknowledge | ModbusException::ServerDeviceBusy
            ),
            _ => false,
        }
    }

    /// Whether the error originates below the Modbus application layer.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::ConnectionLost { .. }
                | Self::NotConnected
                | Self::Io { .. }
        )
    }

    /// Whether the error is a Modbus protocol condition.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Exception { .. } | Self::Decode { .. })
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<DecodeErrorKind> for ModbusError {
    fn from(kind: DecodeErrorKind) -> Self {
        Self::Decode { kind }
    }
}
