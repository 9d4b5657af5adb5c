//! Consumer ports
//!
//! Each bound consumer port gets one accept loop. A consumer connection is
//! routed to an app (by `Host` header on HTTP ports), paired with one of
//! that app's pooled reverse connections and bridged until either side
//! hangs up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use natrelay_proto::{write_frame, AppProtocol, TUNNEL_MARKER};
use natrelay_tunnel::{Rewind, TunnelSession};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{PoolError, ServerError};
use crate::registry::ListenerRequest;
use crate::server::ServerContext;

/// Largest request head inspected for a `Host` header
const MAX_HEAD_LEN: usize = 8192;

/// Bind with a few retries, ports in TIME_WAIT are common after a client reconnects
pub async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    for attempt in 1..=3 {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!(addr = %addr, attempt = attempt, "Bound after retry");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                warn!(
                    port = addr.port(),
                    attempt = attempt,
                    "Port in use, retrying in 1 second"
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(ServerError::Bind {
                    address: addr.ip().to_string(),
                    port: addr.port(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(ServerError::Bind {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: "Address in use after 3 retry attempts".to_string(),
    })
}

/// Start one accept loop per listener request until the server shuts down
pub async fn run_listener_requests(
    ctx: Arc<ServerContext>,
    mut requests: mpsc::UnboundedReceiver<ListenerRequest>,
) {
    loop {
        let request = tokio::select! {
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = ctx.shutdown.cancelled() => break,
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let port = request.port;
            let cancel = request.cancel.clone();
            if let Err(e) = serve_consumer_port(ctx.clone(), request).await {
                error!(port = port, error = %e, "Consumer listener failed");
                // nobody listens on the assigned port, the owners must renegotiate
                ctx.registry.abandon_port(port, &cancel);
            }
        });
    }
}

async fn serve_consumer_port(
    ctx: Arc<ServerContext>,
    request: ListenerRequest,
) -> Result<(), ServerError> {
    let addr = SocketAddr::new(ctx.config.bind_addr, request.port);
    let listener = tokio::select! {
        bound = bind_with_retry(addr) => bound?,
        _ = request.cancel.cancelled() => return Ok(()),
    };
    info!(
        port = request.port,
        client_id = %request.client_id,
        app_id = %request.app_id,
        "Consumer listener started"
    );

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = request.cancel.cancelled() => break,
            _ = ctx.shutdown.cancelled() => break,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                ctx.stats.record_consumer_connection();
                let ctx = ctx.clone();
                let port = request.port;
                tokio::spawn(async move {
                    if let Err(e) = handle_consumer(&ctx, port, stream).await {
                        debug!(port = port, peer = %peer_addr, error = %e, "Consumer dropped");
                    }
                });
            }
            Err(e) => {
                error!(port = request.port, error = %e, "Failed to accept consumer connection");
            }
        }
    }

    // the port must be free before the release guard fires
    drop(listener);
    info!(port = request.port, "Consumer listener stopped");
    drop(request);
    Ok(())
}

/// Route, pair and bridge one consumer connection
pub async fn handle_consumer(
    ctx: &ServerContext,
    port: u16,
    mut consumer: TcpStream,
) -> Result<(), ServerError> {
    let (head, host) = match ctx.registry.port_protocol(port) {
        Some(AppProtocol::Http) => {
            let head = read_request_head(&mut consumer, ctx.config.control_read_timeout).await;
            let host = parse_host(&head);
            (head, host)
        }
        _ => (Vec::new(), None),
    };

    let Some(endpoint) = ctx.registry.route(port, host.as_deref()) else {
        debug!(port = port, "No app bound to port");
        return Ok(());
    };

    let mut reverse = match endpoint.pool.pop(ctx.config.pool_pop_timeout).await {
        Ok(reverse) => reverse,
        Err(PoolError::Timeout(waited)) => {
            warn!(
                client_id = %endpoint.client_id,
                app_id = %endpoint.app_id,
                waited = ?waited,
                "No reverse connection available, tearing down client"
            );
            ctx.registry.teardown(endpoint.client_id);
            return Ok(());
        }
        Err(PoolError::Closed) => {
            debug!(client_id = %endpoint.client_id, "Pool closed while waiting");
            return Ok(());
        }
    };

    write_frame(&mut reverse, &[TUNNEL_MARKER]).await?;

    let session =
        TunnelSession::new(endpoint.tunnels.child_token()).with_totals(ctx.stats.traffic());
    debug!(
        tunnel_id = %session.id(),
        client_id = %endpoint.client_id,
        app_id = %endpoint.app_id,
        port = port,
        host = host.as_deref().unwrap_or(""),
        "Tunnel paired"
    );
    session.bridge(Rewind::new(head, consumer), reverse).await;
    Ok(())
}

/// Read until the end of the request head, the size limit, EOF or the timeout
async fn read_request_head(stream: &mut TcpStream, timeout: Duration) -> Vec<u8> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];

    let _ = tokio::time::timeout(timeout, async {
        while head.len() < MAX_HEAD_LEN && !contains_head_end(&head) {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => head.extend_from_slice(&buf[..n]),
            }
        }
    })
    .await;

    head
}

fn contains_head_end(head: &[u8]) -> bool {
    head.windows(4).any(|w| w == b"\r\n\r\n")
}

/// `Host` header value without its port suffix
pub fn parse_host(head: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(head);
    text.split("\r\n")
        .skip(1)
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if !name.trim().eq_ignore_ascii_case("host") {
                return None;
            }
            let value = value.trim();
            let host = if let Some(rest) = value.strip_prefix('[') {
                // bracketed IPv6 literal
                rest.split(']').next().unwrap_or(rest)
            } else {
                value.split(':').next().unwrap_or(value)
            };
            if host.is_empty() {
                None
            } else {
                Some(host.to_ascii_lowercase())
            }
        })
}
