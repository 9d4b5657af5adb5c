use natrelay_proto::{AuthState, ProtoError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("Failed to connect to {address} after {attempts} attempts")]
    ConnectRetriesExhausted { address: String, attempts: u32 },

    #[error("Connection to {address} timed out")]
    ConnectTimeout { address: String },

    #[error("Provider rejected the app request")]
    Rejected,

    #[error("Reverse connection refused: {0:?}")]
    AuthRejected(AuthState),

    #[error("Unexpected heartbeat answer {0:#04x}")]
    InvalidAck(u8),

    #[error("No client id negotiated yet")]
    NotNegotiated,

    #[error("Configuration error: {0}")]
    Config(String),
}
