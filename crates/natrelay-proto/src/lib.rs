//! Wire protocol for natrelay
//!
//! This crate defines the identity types, opcodes and fixed binary frames
//! exchanged on the provider's control and reverse ports, together with
//! timed readers that turn short reads into protocol errors.

pub mod codec;
pub mod duration_secs;
pub mod error;
pub mod ids;
pub mod messages;

pub use codec::{write_frame, FrameReader};
pub use error::ProtoError;
pub use ids::{AppId, ClientId};
pub use messages::{
    encode_token, read_token, AppAssignment, AppProtocol, AppRequest, Assignment, AuthState,
    ClientIdAppId, NewAppRequest, Opcode,
};

/// Token sent by clients that have no login
pub const NO_TOKEN: &str = "notoken";

/// Byte written by the provider on a popped reverse connection
pub const TUNNEL_MARKER: u8 = 0x01;

/// Byte the provider answers a heartbeat with
pub const HEARTBEAT_ACK: u8 = 0x01;

/// Maximum token length accepted on the wire
pub const MAX_TOKEN_LEN: usize = 4096;

/// Maximum host length accepted in an app request
pub const MAX_HOST_LEN: usize = 1024;

/// Maximum description length accepted in an app request
pub const MAX_DESCRIPTION_LEN: usize = 96;
