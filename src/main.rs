//! natrelay - expose services behind NAT through a public provider
//!
//! `server` runs the provider, `client` runs next to the private services
//! and `issue-token` mints login tokens for the provider's users.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use natrelay_auth::TokenIssuer;
use natrelay_client::{AppConfig, ClientConfig, ClientEngine, EngineExit};
use natrelay_proto::ClientId;
use natrelay_server::{Server, ServerConfig};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("NATRELAY_GIT_HASH"),
    ", built ",
    env!("NATRELAY_BUILD_TIME"),
    ")"
);

/// natrelay - Tunnel services behind NAT through a public provider
#[derive(Parser, Debug)]
#[command(name = "natrelay")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log filter, overrides --verbose (e.g. "natrelay_server=debug")
    #[arg(long, global = true, env = "RUST_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public provider
    #[command(long_about = r#"
Run the public provider. Clients negotiate consumer ports on the config
port and park reverse connections on the reverse port.

EXAMPLES:
  # Anonymous provider with defaults
  natrelay server

  # Token-only provider with a credential file
  natrelay server --jwt-secret $SECRET --credentials users.json --no-anonymous

ENVIRONMENT VARIABLES:
  NATRELAY_JWT_SECRET    Secret used to verify login tokens
    "#)]
    Server {
        /// JSON configuration file, flags override its values
        #[arg(long, short)]
        config: Option<PathBuf>,

        #[arg(long)]
        bind: Option<IpAddr>,

        #[arg(long)]
        config_port: Option<u16>,

        #[arg(long)]
        reverse_port: Option<u16>,

        /// First port probed for consumer listeners
        #[arg(long)]
        consumer_start_port: Option<u16>,

        #[arg(long, env = "NATRELAY_JWT_SECRET")]
        jwt_secret: Option<String>,

        /// JSON credential store
        #[arg(long)]
        credentials: Option<PathBuf>,

        /// Refuse clients without a token
        #[arg(long)]
        no_anonymous: bool,
    },

    /// Expose local services through a provider
    #[command(long_about = r#"
Connect to a provider and expose local services. Restarts the session with
the same client id whenever the provider stops answering heartbeats.

EXAMPLES:
  # Expose local SSH on a provider-chosen port
  natrelay client --provider relay.example.com --tcp 127.0.0.1:22

  # Expose two web apps sharing one HTTP port by host name
  natrelay client --provider relay.example.com --token $TOKEN \
    --http a.example.com=127.0.0.1:3000 \
    --http b.example.com=127.0.0.1:3001

ENVIRONMENT VARIABLES:
  NATRELAY_PROVIDER      Provider host name or address
  NATRELAY_TOKEN         Login token
    "#)]
    Client {
        /// JSON configuration file, flags override its values
        #[arg(long, short)]
        config: Option<PathBuf>,

        #[arg(long, env = "NATRELAY_PROVIDER")]
        provider: Option<String>,

        #[arg(long)]
        config_port: Option<u16>,

        #[arg(long)]
        reverse_port: Option<u16>,

        #[arg(long, env = "NATRELAY_TOKEN")]
        token: Option<String>,

        /// Expose a TCP service, `ip:port` (repeatable)
        #[arg(long = "tcp", value_name = "ADDR")]
        tcp: Vec<String>,

        /// Expose an HTTP service, `host=ip:port` (repeatable)
        #[arg(long = "http", value_name = "HOST=ADDR")]
        http: Vec<String>,

        /// Where the last working token is remembered
        #[arg(long)]
        login_cache: Option<PathBuf>,
    },

    /// Mint a login token for a user key
    IssueToken {
        #[arg(long, env = "NATRELAY_JWT_SECRET")]
        secret: String,

        /// User key as found in the credential store
        #[arg(long)]
        user: String,

        /// Validity in days
        #[arg(long, default_value = "30")]
        days: i64,
    },
}

fn setup_logging(verbose: bool, filter: Option<&str>) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = filter
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Parse `ip:port`
fn parse_target(spec: &str) -> Result<(IpAddr, u16)> {
    let (ip, port) = spec
        .rsplit_once(':')
        .with_context(|| format!("expected ip:port, got {:?}", spec))?;
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = ip
        .parse()
        .with_context(|| format!("invalid address in {:?}", spec))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in {:?}", spec))?;
    Ok((ip, port))
}

fn tcp_app(spec: &str) -> Result<AppConfig> {
    let (ip, port) = parse_target(spec)?;
    Ok(AppConfig::tcp(port).with_target_ip(ip))
}

fn http_app(spec: &str) -> Result<AppConfig> {
    let (host, target) = spec
        .split_once('=')
        .with_context(|| format!("expected host=ip:port, got {:?}", spec))?;
    let (ip, port) = parse_target(target)?;
    Ok(AppConfig::http(port, host).with_target_ip(ip))
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let server = Server::bind(config)
        .await
        .context("Failed to start provider")?;
    let ctx = server.context();
    let mut task = tokio::spawn(server.run());

    let finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
            false
        }
        result = &mut task => {
            result.context("Provider task panicked")??;
            true
        }
    };
    if !finished {
        ctx.shutdown.cancel();
        task.await.context("Provider task panicked")??;
    }

    let stats = ctx.stats.snapshot();
    info!(
        bytes_sent = stats.total_bytes_sent,
        bytes_received = stats.total_bytes_received,
        consumer_connections = stats.consumer_connections,
        "Provider stopped"
    );
    Ok(())
}

/// Run engine sessions until stopped, keeping the client id across restarts
async fn run_client(config: ClientConfig) -> Result<()> {
    let retry_delay = config.retry_delay;
    let mut client_id = ClientId::UNASSIGNED;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let engine = ClientEngine::new(config.clone()).with_client_id(client_id);
        let handle = engine.handle();
        let run = engine.run();
        tokio::pin!(run);

        let result = tokio::select! {
            result = &mut run => result,
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                if let Err(e) = handle.close().await {
                    warn!(error = %e, "Failed to notify provider");
                }
                return Ok(());
            }
        };

        match result {
            Ok(EngineExit::Stopped) => return Ok(()),
            Ok(EngineExit::RestartRequired) => {
                client_id = handle.client_id();
                info!(client_id = %client_id, "Restarting client session");
            }
            Err(e) if client_id.is_unassigned() => {
                return Err(e).context("Client failed to start");
            }
            Err(e) => {
                error!(client_id = %client_id, error = %e, "Client session failed");
                warn!("Retrying in {} seconds...", retry_delay.as_secs());
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => {}
                    _ = &mut ctrl_c => return Ok(()),
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.log_level.as_deref());

    match cli.command {
        Commands::Server {
            config,
            bind,
            config_port,
            reverse_port,
            consumer_start_port,
            jwt_secret,
            credentials,
            no_anonymous,
        } => {
            let mut server_config = match config {
                Some(path) => ServerConfig::load(&path)
                    .with_context(|| format!("Failed to load {}", path.display()))?,
                None => ServerConfig::default(),
            };
            if let Some(bind) = bind {
                server_config = server_config.with_bind_addr(bind);
            }
            let config_port = config_port.unwrap_or(server_config.config_port);
            let reverse_port = reverse_port.unwrap_or(server_config.reverse_port);
            server_config = server_config.with_ports(config_port, reverse_port);
            if let Some(port) = consumer_start_port {
                server_config = server_config.with_consumer_start_port(port);
            }
            if let Some(secret) = jwt_secret {
                server_config = server_config.with_jwt_secret(secret);
            }
            if let Some(path) = credentials {
                server_config = server_config.with_credentials_path(path);
            }
            if no_anonymous {
                server_config = server_config.with_allow_anonymous(false);
            }
            if !server_config.allow_anonymous && server_config.jwt_secret.is_none() {
                warn!("Anonymous access disabled without a JWT secret, all clients are rejected");
            }

            run_server(server_config).await
        }

        Commands::Client {
            config,
            provider,
            config_port,
            reverse_port,
            token,
            tcp,
            http,
            login_cache,
        } => {
            let mut client_config = match config {
                Some(path) => ClientConfig::load(&path)
                    .with_context(|| format!("Failed to load {}", path.display()))?,
                None => ClientConfig::default(),
            };
            let provider =
                provider.unwrap_or_else(|| client_config.provider_address.clone());
            let config_port = config_port.unwrap_or(client_config.config_port);
            let reverse_port = reverse_port.unwrap_or(client_config.reverse_port);
            client_config = client_config.with_provider(provider, config_port, reverse_port);
            if let Some(token) = token {
                client_config = client_config.with_token(token);
            }
            for spec in &tcp {
                client_config = client_config.with_app(tcp_app(spec)?);
            }
            for spec in &http {
                client_config = client_config.with_app(http_app(spec)?);
            }
            if let Some(path) = login_cache {
                client_config = client_config.with_login_cache_path(path);
            }
            if client_config.apps.is_empty() {
                bail!("Nothing to expose, pass --tcp, --http or a config file with apps");
            }

            info!(
                provider = %client_config.provider_address,
                apps = client_config.apps.len(),
                "natrelay client starting"
            );
            run_client(client_config).await
        }

        Commands::IssueToken { secret, user, days } => {
            let token = TokenIssuer::new(secret.as_bytes())
                .with_validity(chrono::Duration::days(days))
                .issue(&user)
                .context("Failed to issue token")?;
            println!("{}", token);
            Ok(())
        }
    }
}
