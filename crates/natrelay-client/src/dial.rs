//! Outbound connections to the provider

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::ClientError;

/// Open a TCP connection, bounded by `timeout`
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ClientError> {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ClientError::ConnectTimeout {
            address: format!("{}:{}", host, port),
        }),
    }
}

/// Fixed-delay retry policy for control connections
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before giving up, at least one is always made
    pub attempts: u32,
    pub delay: Duration,
    pub connect_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration, connect_timeout: Duration) -> Self {
        Self {
            attempts,
            delay,
            connect_timeout,
        }
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, ClientError> {
        let attempts = self.attempts.max(1);
        for attempt in 1..=attempts {
            match connect(host, port, self.connect_timeout).await {
                Ok(stream) => {
                    if attempt > 1 {
                        debug!(
                            host = host,
                            port = port,
                            attempt = attempt,
                            "Connected after retry"
                        );
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        host = host,
                        port = port,
                        attempt = attempt,
                        attempts = attempts,
                        error = %e,
                        "Connection to provider failed"
                    );
                    if attempt < attempts {
                        sleep(self.delay).await;
                    }
                }
            }
        }

        Err(ClientError::ConnectRetriesExhausted {
            address: format!("{}:{}", host, port),
            attempts,
        })
    }
}
