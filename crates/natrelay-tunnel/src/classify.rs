//! Stream error classification
//!
//! A tunnel normally ends because one side hangs up. Those errors are
//! expected and only logged at debug; anything else is a fault.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Ordinary hang-up (reset, broken pipe, EOF)
    #[error("Peer disconnected: {0}")]
    Disconnect(io::Error),

    /// Unexpected I/O failure
    #[error("Transfer fault: {0}")]
    Fault(io::Error),
}

impl TransferError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransferError::Disconnect(_))
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        classify(e)
    }
}

pub fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

pub fn classify(e: io::Error) -> TransferError {
    if is_disconnect_kind(e.kind()) {
        TransferError::Disconnect(e)
    } else {
        TransferError::Fault(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_kinds() {
        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::NotConnected,
        ] {
            assert!(classify(io::Error::from(kind)).is_disconnect(), "{:?}", kind);
        }
    }

    #[test]
    fn test_other_errors_are_faults() {
        let err = classify(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(matches!(err, TransferError::Fault(_)));
        let err: TransferError = io::Error::from(io::ErrorKind::InvalidData).into();
        assert!(!err.is_disconnect());
    }
}
