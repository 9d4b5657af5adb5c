//! Provider (broker) side of natrelay
//!
//! The provider hands out client identities and consumer ports over short
//! control connections, pools the reverse connections clients open to it,
//! and bridges each consumer connection onto one pooled reverse connection.

pub mod config;
pub mod consumer;
pub mod control;
pub mod error;
pub mod pool;
pub mod registry;
pub mod reverse;
pub mod server;
pub mod stats;
pub mod sweeper;

pub use config::ServerConfig;
pub use control::{handle_control, ControlOutcome};
pub use error::{PoolError, RegistryError, ServerError};
pub use pool::ReverseConnectionPool;
pub use registry::{AppEndpoint, AppRegistry, AppSummary, BindProbe, ListenerRequest, PortProbe};
pub use server::{Server, ServerContext};
pub use stats::{ServerStats, StatsSnapshot};
