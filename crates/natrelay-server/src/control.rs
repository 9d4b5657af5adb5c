//! Control connection handling
//!
//! Every control connection carries exactly one exchange. The first byte
//! picks the exchange; the connection is closed once it completes or fails.

use natrelay_proto::{
    write_frame, Assignment, ClientId, FrameReader, NewAppRequest, Opcode, HEARTBEAT_ACK,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::server::ServerContext;

/// What a finished control exchange did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Assigned(Assignment),
    Rejected,
    HeartbeatAcked(ClientId),
    HeartbeatIgnored(ClientId),
    Closed(ClientId),
}

/// Run one control exchange on `stream`
pub async fn handle_control<S>(
    ctx: &ServerContext,
    stream: &mut S,
) -> Result<ControlOutcome, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let timeout = ctx.config.control_read_timeout;
    let mut reader = FrameReader::new(&mut *stream, timeout);
    let opcode = Opcode::read_from(&mut reader).await?;
    debug!(opcode = ?opcode, "Control exchange");

    match opcode {
        Opcode::NewAppRequest | Opcode::Reconnect => {
            let request = NewAppRequest::read_from(&mut reader).await?;
            handle_app_request(ctx, stream, opcode, request).await
        }
        Opcode::Heartbeat => {
            let client_id = ClientId(reader.read_u16().await?);
            if ctx.registry.touch(client_id) {
                write_frame(stream, &[HEARTBEAT_ACK]).await?;
                Ok(ControlOutcome::HeartbeatAcked(client_id))
            } else {
                warn!(client_id = %client_id, "Heartbeat from unknown client");
                Ok(ControlOutcome::HeartbeatIgnored(client_id))
            }
        }
        Opcode::CloseClient => {
            let client_id = ClientId(reader.read_u16().await?);
            if ctx.registry.teardown(client_id) {
                info!(client_id = %client_id, "Client closed by request");
            } else {
                debug!(client_id = %client_id, "Close for unknown client");
            }
            Ok(ControlOutcome::Closed(client_id))
        }
    }
}

async fn handle_app_request<S>(
    ctx: &ServerContext,
    stream: &mut S,
    opcode: Opcode,
    request: NewAppRequest,
) -> Result<ControlOutcome, ServerError>
where
    S: AsyncWrite + Unpin,
{
    let principal = match ctx.validator.authenticate(&request.token).await {
        Ok(principal) => principal,
        Err(e) => {
            warn!(hint = %request.client_id, error = %e, "App request rejected");
            write_frame(stream, &Assignment::rejected().encode()?).await?;
            return Ok(ControlOutcome::Rejected);
        }
    };
    let client_id = principal.client_id(request.client_id);

    // re-provisioning replaces whatever the client had before, and its
    // consumer ports must be free again before they are reallocated
    if !client_id.is_unassigned() {
        match ctx
            .registry
            .replace(principal, client_id, ctx.config.control_read_timeout)
            .await
        {
            Ok(true) => {
                debug!(client_id = %client_id, opcode = ?opcode, "Replaced previous session");
            }
            Ok(false) => {}
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "App request rejected");
                write_frame(stream, &Assignment::rejected().encode()?).await?;
                return Ok(ControlOutcome::Rejected);
            }
        }
    }

    let assignment = match ctx.registry.arrange(principal, client_id, &request.apps) {
        Ok(assignment) => assignment,
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "App allocation failed");
            write_frame(stream, &Assignment::rejected().encode()?).await?;
            return Err(e.into());
        }
    };

    write_frame(stream, &assignment.encode()?).await?;
    info!(
        client_id = %assignment.client_id,
        apps = assignment.apps.len(),
        reconnect = opcode == Opcode::Reconnect,
        "Apps assigned"
    );
    Ok(ControlOutcome::Assigned(assignment))
}
