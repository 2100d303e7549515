//! Wire protocol error types.

use thiserror::Error;

/// Errors produced while decoding frames off the wire.
#[derive(Error, Debug)]
pub enum WireError {
    /// Unsupported protocol version in a frame header.
    #[error("version unsupported: {0}")]
    Version(u8),

    /// A size field is inconsistent with the frame layout.
    #[error("invalid message size: {0}")]
    Size(u32),

    /// The trailing end-marker did not match the expected magic.
    #[error("end-marker mismatch")]
    EndMarker,

    /// Unknown message type byte.
    #[error("unknown type {0}")]
    Type(u8),

    /// Unknown message subtype byte.
    #[error("unknown subtype {1} for type {0}")]
    SubType(u8, u8),

    /// Malformed message body.
    #[error("malformed frame")]
    Malformed,
}

impl WireError {
    /// Map a decode failure to the error code reported to the peer.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            WireError::Version(_) => ErrorCode::FalseVersion,
            _ => ErrorCode::InvalidMessageSize,
        }
    }
}

/// Error codes surfaced to the application and carried in error frames.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No specific cause.
    Undefined = 0,
    /// Peer spoke an unsupported protocol version.
    FalseVersion = 1,
    /// A frame referenced a session id this endpoint does not know.
    UnknownSession = 2,
    /// Frame sizes or the end-marker were inconsistent.
    InvalidMessageSize = 3,
    /// A reply-expected message was not answered in time.
    MessageTimeout = 4,
    /// A multiblock transfer could not be set up or completed.
    MultiblockFailed = 5,
}

impl TryFrom<u8> for ErrorCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ErrorCode::Undefined),
            1 => Ok(ErrorCode::FalseVersion),
            2 => Ok(ErrorCode::UnknownSession),
            3 => Ok(ErrorCode::InvalidMessageSize),
            4 => Ok(ErrorCode::MessageTimeout),
            5 => Ok(ErrorCode::MultiblockFailed),
            _ => Err(WireError::Malformed),
        }
    }
}
