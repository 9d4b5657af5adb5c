//! Tunnel data plane
//!
//! Once a consumer connection is paired with a reverse connection, bytes
//! are copied verbatim in both directions until either side closes.

pub mod classify;
pub mod rewind;
pub mod transfer;

pub use classify::{classify, is_disconnect_kind, TransferError};
pub use rewind::Rewind;
pub use transfer::{EndReason, TrafficCounters, TransferOutcome, TunnelSession, CHUNK_SIZE};
