//! Protocol errors

use std::time::Duration;
use thiserror::Error;

/// Errors raised while encoding, decoding or reading frames
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    #[error("Short read: expected {expected} bytes, got {received}")]
    ShortRead { expected: usize, received: usize },

    #[error("Unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("Unknown app protocol: {0:#04x}")]
    UnknownProtocol(u8),

    #[error("Unknown auth state: {0:#04x}")]
    UnknownAuthState(u8),

    #[error("Field {field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

impl ProtoError {
    /// True when the peer went away (closed, reset or never answered)
    pub fn is_peer_gone(&self) -> bool {
        match self {
            ProtoError::ShortRead { .. } | ProtoError::Timeout(_) => true,
            ProtoError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
