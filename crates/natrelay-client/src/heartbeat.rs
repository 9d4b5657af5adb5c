//! Liveness heartbeat
//!
//! Every `heartbeat_interval` the client opens a fresh control connection,
//! sends its id and expects a single ack byte back. The first beat that
//! fails ends the loop.

use natrelay_proto::{write_frame, ClientId, FrameReader, Opcode, HEARTBEAT_ACK};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::dial::connect;
use crate::error::ClientError;

/// Why the heartbeat loop stopped
#[derive(Debug)]
pub enum HeartbeatEnd {
    Cancelled,
    Failed(ClientError),
}

/// Send one heartbeat and wait for the ack
pub async fn heartbeat_once(config: &ClientConfig, client_id: ClientId) -> Result<(), ClientError> {
    let mut stream = connect(
        &config.provider_address,
        config.config_port,
        config.connect_timeout,
    )
    .await?;

    let [hi, lo] = client_id.to_be_bytes();
    write_frame(&mut stream, &[Opcode::Heartbeat as u8, hi, lo]).await?;

    let ack = FrameReader::new(&mut stream, config.ack_timeout)
        .read_u8()
        .await?;
    if ack != HEARTBEAT_ACK {
        return Err(ClientError::InvalidAck(ack));
    }
    Ok(())
}

/// Beat until cancelled or until a beat fails
pub async fn run_heartbeat(
    config: &ClientConfig,
    client_id: ClientId,
    cancel: &CancellationToken,
) -> HeartbeatEnd {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.heartbeat_interval) => {}
            _ = cancel.cancelled() => return HeartbeatEnd::Cancelled,
        }

        let beat = tokio::select! {
            beat = heartbeat_once(config, client_id) => beat,
            _ = cancel.cancelled() => return HeartbeatEnd::Cancelled,
        };

        match beat {
            Ok(()) => debug!(client_id = %client_id, "Heartbeat acknowledged"),
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Heartbeat failed");
                return HeartbeatEnd::Failed(e);
            }
        }
    }
}
