//! Reverse connection intake
//!
//! A client opens a reverse connection, authenticates with its token, then
//! names the app it serves. The connection is parked in that app's pool
//! until a consumer arrives.

use natrelay_auth::AuthError;
use natrelay_proto::{read_token, write_frame, AuthState, ClientIdAppId, FrameReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::ServerError;
use crate::server::ServerContext;

/// Authenticate a reverse connection and park it in its app's pool
pub async fn handle_reverse(ctx: &ServerContext, mut stream: TcpStream) -> Result<(), ServerError> {
    let timeout = ctx.config.control_read_timeout;

    let token = read_token(&mut FrameReader::new(&mut stream, timeout)).await?;
    let principal = match ctx.validator.authenticate(&token).await {
        Ok(principal) => principal,
        Err(e) => {
            let state = e.auth_state();
            debug!(error = %e, state = ?state, "Reverse connection refused");
            write_frame(&mut stream, &[state as u8]).await?;
            return Err(e.into());
        }
    };
    write_frame(&mut stream, &[AuthState::Success as u8]).await?;

    let frame = ClientIdAppId::read_from(&mut FrameReader::new(&mut stream, timeout)).await?;
    let endpoint = ctx.registry.endpoint(frame.client_id, frame.app_id)?;

    // only the principal that provisioned the app may feed its pool
    if endpoint.owner != principal {
        warn!(
            principal = ?principal,
            owner = ?endpoint.owner,
            claimed = %frame,
            "Reverse connection claims another client's app"
        );
        return Err(AuthError::InvalidToken("client id mismatch".to_string()).into());
    }

    match endpoint.pool.push(stream) {
        Ok(()) => {
            debug!(
                client_id = %frame.client_id,
                app_id = %frame.app_id,
                idle = endpoint.pool.idle_len(),
                "Reverse connection pooled"
            );
        }
        Err(_stream) => {
            debug!(app = %frame, "Pool closed, dropping reverse connection");
        }
    }
    Ok(())
}
