//! Client configuration

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use natrelay_proto::{duration_secs, AppProtocol, AppRequest};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// A local service exposed through the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub target_ip: IpAddr,
    pub target_port: u16,
    /// Requested consumer port, 0 lets the provider pick one
    pub consumer_port: u16,
    pub protocol: AppProtocol,
    /// Routing host for HTTP apps sharing a port
    pub host: String,
    pub description: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            target_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            target_port: 80,
            consumer_port: 0,
            protocol: AppProtocol::Tcp,
            host: String::new(),
            description: String::new(),
        }
    }
}

impl AppConfig {
    pub fn tcp(target_port: u16) -> Self {
        Self {
            target_port,
            ..Default::default()
        }
    }

    pub fn http(target_port: u16, host: impl Into<String>) -> Self {
        Self {
            target_port,
            protocol: AppProtocol::Http,
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_target_ip(mut self, ip: IpAddr) -> Self {
        self.target_ip = ip;
        self
    }

    pub fn with_consumer_port(mut self, port: u16) -> Self {
        self.consumer_port = port;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn to_request(&self) -> AppRequest {
        AppRequest {
            port: self.consumer_port,
            protocol: self.protocol,
            host: self.host.clone(),
            description: self.description.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Provider host name or address
    pub provider_address: String,
    pub config_port: u16,
    pub reverse_port: u16,
    /// Login token, `None` connects anonymously
    pub token: Option<String>,
    pub apps: Vec<AppConfig>,
    /// Idle reverse connections kept open per app
    pub reverse_pool_size: usize,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Control connection attempts before negotiation gives up
    pub connect_retries: u32,
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    /// How long to wait for any provider answer
    #[serde(with = "duration_secs")]
    pub ack_timeout: Duration,
    /// Quiet period after the heartbeat loop ends before a restart is requested
    #[serde(with = "duration_secs")]
    pub restart_grace: Duration,
    pub login_cache_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            provider_address: "127.0.0.1".to_string(),
            config_port: 7841,
            reverse_port: 7842,
            token: None,
            apps: Vec::new(),
            reverse_pool_size: 2,
            connect_timeout: Duration::from_secs(5),
            connect_retries: 3,
            retry_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            ack_timeout: Duration::from_secs(5),
            restart_grace: Duration::from_secs(1),
            login_cache_path: None,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn with_provider(
        mut self,
        address: impl Into<String>,
        config_port: u16,
        reverse_port: u16,
    ) -> Self {
        self.provider_address = address.into();
        self.config_port = config_port;
        self.reverse_port = reverse_port;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_app(mut self, app: AppConfig) -> Self {
        self.apps.push(app);
        self
    }

    pub fn with_reverse_pool_size(mut self, size: usize) -> Self {
        self.reverse_pool_size = size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_connect_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.connect_retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_restart_grace(mut self, grace: Duration) -> Self {
        self.restart_grace = grace;
        self
    }

    pub fn with_login_cache_path(mut self, path: PathBuf) -> Self {
        self.login_cache_path = Some(path);
        self
    }

    /// Check the parts the provider would otherwise reject
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.apps.is_empty() {
            return Err(ClientError::Config("no apps configured".to_string()));
        }
        if self.apps.len() > u8::MAX as usize {
            return Err(ClientError::Config(format!(
                "at most 255 apps per client, got {}",
                self.apps.len()
            )));
        }
        if self.reverse_pool_size == 0 {
            return Err(ClientError::Config(
                "reverse_pool_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
