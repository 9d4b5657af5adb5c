//! Reverse connection slots
//!
//! Each assigned app keeps `reverse_pool_size` slots. A slot holds one idle
//! reverse connection parked in the provider's pool. When the provider
//! writes the tunnel marker the slot hands the connection to a forwarder
//! and immediately opens a replacement.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use natrelay_proto::{
    encode_token, write_frame, AuthState, ClientIdAppId, FrameReader, TUNNEL_MARKER,
};
use natrelay_tunnel::{TrafficCounters, TunnelSession};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ClientConfig};
use crate::dial::connect;
use crate::error::ClientError;

/// Open a reverse connection, authenticate and name the app it serves
pub async fn open_reverse(
    config: &ClientConfig,
    token: &str,
    id: ClientIdAppId,
) -> Result<TcpStream, ClientError> {
    let mut stream = connect(
        &config.provider_address,
        config.reverse_port,
        config.connect_timeout,
    )
    .await?;

    write_frame(&mut stream, &encode_token(token)?).await?;
    let mut reader = FrameReader::new(&mut stream, config.ack_timeout);
    let state = AuthState::read_from(&mut reader).await?;
    if state != AuthState::Success {
        return Err(ClientError::AuthRejected(state));
    }

    write_frame(&mut stream, &id.to_bytes()).await?;
    Ok(stream)
}

/// Everything a slot needs, shared by all slots of one app
pub struct AppLink {
    pub config: Arc<ClientConfig>,
    pub token: Arc<str>,
    pub app: AppConfig,
    pub id: ClientIdAppId,
    pub traffic: Arc<TrafficCounters>,
}

impl AppLink {
    fn target(&self) -> SocketAddr {
        SocketAddr::new(self.app.target_ip, self.app.target_port)
    }
}

/// Keep one reverse connection parked for `link` until cancelled
///
/// `first` is an already opened connection to park before dialing new ones.
pub async fn run_slot(
    link: Arc<AppLink>,
    mut first: Option<TcpStream>,
    cancel: CancellationToken,
) {
    let retry_delay = link.config.retry_delay;

    loop {
        let mut reverse = match first.take() {
            Some(stream) => stream,
            None => {
                let opened = tokio::select! {
                    opened = open_reverse(&link.config, &link.token, link.id) => opened,
                    _ = cancel.cancelled() => return,
                };
                match opened {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(app = %link.id, error = %e, "Failed to open reverse connection");
                        if !pause(retry_delay, &cancel).await {
                            return;
                        }
                        continue;
                    }
                }
            }
        };

        let mut marker = [0u8; 1];
        let read = tokio::select! {
            read = reverse.read(&mut marker) => read,
            _ = cancel.cancelled() => return,
        };

        match read {
            Ok(1) if marker[0] == TUNNEL_MARKER => {
                let link = link.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move { forward(&link, reverse, cancel).await });
            }
            Ok(1) => {
                warn!(
                    app = %link.id,
                    byte = marker[0],
                    "Unexpected byte on idle reverse connection"
                );
            }
            Ok(_) | Err(_) => {
                // pool closed or client torn down on the provider side
                debug!(app = %link.id, "Idle reverse connection closed by provider");
                if !pause(retry_delay, &cancel).await {
                    return;
                }
            }
        }
    }
}

/// Sleep unless cancelled first, returns false on cancellation
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Bridge a paired reverse connection to the local target
async fn forward(link: &AppLink, reverse: TcpStream, cancel: CancellationToken) {
    let target = link.target();
    let local = match tokio::time::timeout(link.config.connect_timeout, TcpStream::connect(target))
        .await
    {
        Ok(Ok(local)) => local,
        Ok(Err(e)) => {
            warn!(app = %link.id, target = %target, error = %e, "Local service unreachable");
            return;
        }
        Err(_) => {
            warn!(app = %link.id, target = %target, "Local service connect timed out");
            return;
        }
    };

    let session = TunnelSession::new(cancel).with_totals(link.traffic.clone());
    info!(tunnel_id = %session.id(), app = %link.id, target = %target, "Tunnel opened");
    session.bridge(reverse, local).await;
}
