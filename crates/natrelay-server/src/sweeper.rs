//! Heartbeat expiry

use std::sync::Arc;

use tracing::info;

use crate::server::ServerContext;

/// Every `heartbeat_timeout`, tear down clients that have not sent a
/// heartbeat within the last `heartbeat_timeout`
pub async fn run_sweeper(ctx: Arc<ServerContext>) {
    let period = ctx.config.heartbeat_timeout;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = ctx.shutdown.cancelled() => break,
        }

        for client_id in sweep(&ctx) {
            info!(client_id = %client_id, "Client heartbeat expired");
        }
    }
}

/// Tear down every expired client once
pub fn sweep(ctx: &ServerContext) -> Vec<natrelay_proto::ClientId> {
    let expired = ctx.registry.expired(ctx.config.heartbeat_timeout);
    for client_id in &expired {
        ctx.registry.teardown(*client_id);
    }
    expired
}
