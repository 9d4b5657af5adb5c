//! Provider configuration

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use natrelay_proto::{duration_secs, ClientId};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address every provider socket binds to
    pub bind_addr: IpAddr,
    /// Control connections (negotiation, heartbeat, close)
    pub config_port: u16,
    /// Reverse connections supplied by clients
    pub reverse_port: u16,
    /// First port probed when allocating consumer ports
    pub consumer_start_port: u16,
    pub allow_anonymous: bool,
    /// User ids refused at login
    pub banned_users: Vec<String>,
    /// Ports a client may pin without availability checks
    pub port_bounds: HashMap<ClientId, Vec<u16>>,
    pub jwt_secret: Option<String>,
    /// JSON credential store, `{ "<user key>": { "userId": "..." } }`
    pub credentials_path: Option<PathBuf>,
    #[serde(with = "duration_secs")]
    pub pool_pop_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub control_read_timeout: Duration,
    /// Clients silent for longer than this are torn down
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            config_port: 7841,
            reverse_port: 7842,
            consumer_start_port: 20000,
            allow_anonymous: true,
            banned_users: Vec::new(),
            port_bounds: HashMap::new(),
            jwt_secret: None,
            credentials_path: None,
            pool_pop_timeout: Duration::from_secs(10),
            control_read_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_ports(mut self, config_port: u16, reverse_port: u16) -> Self {
        self.config_port = config_port;
        self.reverse_port = reverse_port;
        self
    }

    pub fn with_consumer_start_port(mut self, port: u16) -> Self {
        self.consumer_start_port = port;
        self
    }

    pub fn with_allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    pub fn with_banned_users(mut self, users: Vec<String>) -> Self {
        self.banned_users = users;
        self
    }

    pub fn with_port_bound(mut self, client_id: ClientId, ports: Vec<u16>) -> Self {
        self.port_bounds.insert(client_id, ports);
        self
    }

    pub fn with_jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.jwt_secret = Some(secret.into());
        self
    }

    pub fn with_credentials_path(mut self, path: PathBuf) -> Self {
        self.credentials_path = Some(path);
        self
    }

    pub fn with_pool_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pool_pop_timeout = timeout;
        self
    }

    pub fn with_control_read_timeout(mut self, timeout: Duration) -> Self {
        self.control_read_timeout = timeout;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.config_port, 7841);
        assert_eq!(config.consumer_start_port, 20000);
        assert!(config.allow_anonymous);
        assert_eq!(config.pool_pop_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"config_port": 9000, "heartbeat_timeout": 30, "port_bounds": {{"12": [8080]}}}}"#
        )
        .unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.config_port, 9000);
        assert_eq!(config.reverse_port, 7842);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.port_bounds[&ClientId(12)], vec![8080]);
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ nope").unwrap();
        assert!(matches!(
            ServerConfig::load(file.path()),
            Err(ServerError::Config(_))
        ));
    }
}
