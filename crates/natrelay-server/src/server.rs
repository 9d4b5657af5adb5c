//! Provider process
//!
//! [`ServerContext`] is built once at startup and shared by every task.
//! [`Server`] owns the control and reverse listeners and drives the
//! consumer listeners announced by the registry.

use std::net::SocketAddr;
use std::sync::Arc;

use natrelay_auth::{
    CredentialStore, JsonFileCredentialStore, JwtValidator, MemoryCredentialStore, TokenValidator,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::consumer::{bind_with_retry, run_listener_requests};
use crate::control::handle_control;
use crate::error::ServerError;
use crate::registry::{AppRegistry, BindProbe, ListenerRequest, PortProbe};
use crate::reverse::handle_reverse;
use crate::stats::ServerStats;
use crate::sweeper::run_sweeper;

/// Shared state of a running provider
pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: AppRegistry,
    pub validator: TokenValidator,
    pub stats: ServerStats,
    pub shutdown: CancellationToken,
}

impl ServerContext {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn CredentialStore>,
        probe: Box<dyn PortProbe>,
    ) -> (Self, mpsc::UnboundedReceiver<ListenerRequest>) {
        let (registry, listener_rx) = AppRegistry::new(config.consumer_start_port, probe);
        let registry = registry.with_port_bounds(config.port_bounds.clone());

        let mut validator = TokenValidator::new(store)
            .with_allow_anonymous(config.allow_anonymous)
            .with_banned_users(config.banned_users.iter().cloned());
        if let Some(secret) = &config.jwt_secret {
            validator = validator.with_jwt(JwtValidator::new(secret.as_bytes()));
        }

        let ctx = Self {
            config,
            registry,
            validator,
            stats: ServerStats::new(),
            shutdown: CancellationToken::new(),
        };
        (ctx, listener_rx)
    }
}

pub struct Server {
    ctx: Arc<ServerContext>,
    control: TcpListener,
    reverse: TcpListener,
    listener_rx: mpsc::UnboundedReceiver<ListenerRequest>,
}

impl Server {
    /// Bind the control and reverse ports, loading credentials from
    /// `credentials_path` when one is configured
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn CredentialStore> = match &config.credentials_path {
            Some(path) => Arc::new(JsonFileCredentialStore::load(path)?),
            None => Arc::new(MemoryCredentialStore::new()),
        };
        Self::bind_with_store(config, store).await
    }

    pub async fn bind_with_store(
        config: ServerConfig,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self, ServerError> {
        let control =
            bind_with_retry(SocketAddr::new(config.bind_addr, config.config_port)).await?;
        let reverse =
            bind_with_retry(SocketAddr::new(config.bind_addr, config.reverse_port)).await?;

        let probe = Box::new(BindProbe::new(config.bind_addr));
        let (ctx, listener_rx) = ServerContext::new(config, store, probe);

        Ok(Self {
            ctx: Arc::new(ctx),
            control,
            reverse,
            listener_rx,
        })
    }

    pub fn control_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.control.local_addr()?)
    }

    pub fn reverse_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.reverse.local_addr()?)
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    /// Serve until the context's shutdown token is cancelled
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            ctx,
            control,
            reverse,
            listener_rx,
        } = self;

        info!(
            control = %control.local_addr()?,
            reverse = %reverse.local_addr()?,
            consumer_start_port = ctx.config.consumer_start_port,
            "Provider started"
        );

        let listeners = tokio::spawn(run_listener_requests(ctx.clone(), listener_rx));
        let sweeper = tokio::spawn(run_sweeper(ctx.clone()));

        tokio::select! {
            _ = accept_control(ctx.clone(), control) => {}
            _ = accept_reverse(ctx.clone(), reverse) => {}
            _ = ctx.shutdown.cancelled() => {}
        }

        ctx.shutdown.cancel();
        let _ = listeners.await;
        let _ = sweeper.await;

        for client_id in ctx.registry.client_ids() {
            ctx.registry.teardown(client_id);
        }
        info!("Provider stopped");
        Ok(())
    }
}

async fn accept_control(ctx: Arc<ServerContext>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((mut stream, peer_addr)) => {
                ctx.stats.record_control_connection();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_control(&ctx, &mut stream).await {
                        debug!(peer = %peer_addr, error = %e, "Control exchange failed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept control connection");
            }
        }
    }
}

async fn accept_reverse(ctx: Arc<ServerContext>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                ctx.stats.record_reverse_connection();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_reverse(&ctx, stream).await {
                        debug!(peer = %peer_addr, error = %e, "Reverse connection rejected");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept reverse connection");
            }
        }
    }
}
