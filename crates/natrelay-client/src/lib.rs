//! Client side of natrelay
//!
//! A client sits next to the services it exposes. It asks the provider for
//! consumer ports, keeps reverse connections parked in the provider's pools
//! and forwards each paired connection to its local target.

pub mod config;
pub mod dial;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod login_cache;
pub mod worker;

pub use config::{AppConfig, ClientConfig};
pub use engine::{ClientEngine, ClientHandle, ClientState, EngineExit};
pub use error::ClientError;
pub use heartbeat::{heartbeat_once, HeartbeatEnd};
pub use login_cache::{LoginCache, LoginRecord};
