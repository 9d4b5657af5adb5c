use std::time::Duration;

use natrelay_auth::AuthError;
use natrelay_proto::{AppId, ClientId, ProtoError};
use thiserror::Error;

/// Allocation failures
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No free consumer port at or above {start}")]
    NoPortAvailable { start: u16 },

    #[error("Could not find an unused client id")]
    IdentitySpaceExhausted,

    #[error("Client {0} has no app ids left")]
    TooManyApps(ClientId),

    #[error("Unknown client {0}")]
    UnknownClient(ClientId),

    #[error("Unknown app {app_id} for client {client_id}")]
    UnknownApp { client_id: ClientId, app_id: AppId },

    #[error("Client {0} belongs to another principal")]
    NotOwner(ClientId),

    #[error("Pinned port {port} is already bound by an app that cannot share it")]
    PortConflict { port: u16 },
}

/// Reverse connection pool failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("No reverse connection within {0:?}")]
    Timeout(Duration),

    #[error("Pool closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind to {address}:{port}: {reason}")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Configuration error: {0}")]
    Config(String),
}
