//! Client engine against a real provider on loopback

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use natrelay_auth::{MemoryCredentialStore, TokenIssuer, UserRecord};
use natrelay_client::{AppConfig, ClientConfig, ClientEngine, ClientError, ClientState, EngineExit};
use natrelay_proto::ClientId;
use natrelay_server::{Server, ServerConfig, ServerContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const SECRET: &str = "engine_test_secret";
const TIMEOUT: Duration = Duration::from_secs(5);

struct Provider {
    control: SocketAddr,
    reverse: SocketAddr,
    ctx: Arc<ServerContext>,
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.ctx.shutdown.cancel();
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("natrelay=debug")
        .with_test_writer()
        .try_init();
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_provider(allow_anonymous: bool) -> Provider {
    init_tracing();

    let store = MemoryCredentialStore::new();
    store.insert_user(
        "alice",
        &UserRecord {
            user_id: "2001".to_string(),
            banned: false,
        },
    );

    let config = ServerConfig::default()
        .with_bind_addr(LOCALHOST)
        .with_ports(0, 0)
        .with_consumer_start_port(free_port())
        .with_allow_anonymous(allow_anonymous)
        .with_jwt_secret(SECRET);
    let server = Server::bind_with_store(config, Arc::new(store))
        .await
        .unwrap();
    let provider = Provider {
        control: server.control_addr().unwrap(),
        reverse: server.reverse_addr().unwrap(),
        ctx: server.context(),
    };
    tokio::spawn(server.run());
    provider
}

/// Echo every byte back until the peer hangs up
async fn start_echo() -> u16 {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    port
}

fn client_config(provider: &Provider) -> ClientConfig {
    ClientConfig::default()
        .with_provider("127.0.0.1", provider.control.port(), provider.reverse.port())
        .with_connect_retries(2, Duration::from_millis(50))
        .with_heartbeat_interval(Duration::from_millis(100))
        .with_ack_timeout(Duration::from_secs(2))
        .with_restart_grace(Duration::from_millis(100))
}

async fn wait_for_state(rx: &mut watch::Receiver<ClientState>, state: ClientState) {
    tokio::time::timeout(TIMEOUT, rx.wait_for(|s| *s == state))
        .await
        .unwrap()
        .unwrap();
}

async fn connect_consumer(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect((LOCALHOST, port)).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("consumer port {} never came up", port);
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tunnel_to_local_service_and_close() {
    let provider = start_provider(true).await;
    let echo_port = start_echo().await;

    let engine = ClientEngine::new(client_config(&provider).with_app(AppConfig::tcp(echo_port)));
    let handle = engine.handle();
    let mut states = handle.subscribe();
    let run = tokio::spawn(engine.run());

    wait_for_state(&mut states, ClientState::Running).await;
    let client_id = handle.client_id();
    assert!(!client_id.is_unassigned());
    let apps = handle.assigned_apps();
    assert_eq!(apps.len(), 1);

    let mut consumer = connect_consumer(apps[0].port).await;
    consumer.write_all(b"hello through the relay").await.unwrap();
    let mut echoed = [0u8; 23];
    tokio::time::timeout(TIMEOUT, consumer.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"hello through the relay");
    drop(consumer);

    handle.close().await.unwrap();
    let exit = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(exit, EngineExit::Stopped);

    wait_until(|| !provider.ctx.registry.contains_client(client_id)).await;
    assert!(handle.traffic().sent() >= 23);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_keeps_reverse_pool_filled() {
    let provider = start_provider(true).await;
    let echo_port = start_echo().await;

    let engine = ClientEngine::new(
        client_config(&provider)
            .with_app(AppConfig::tcp(echo_port))
            .with_reverse_pool_size(3),
    );
    let handle = engine.handle();
    let mut states = handle.subscribe();
    let run = tokio::spawn(engine.run());
    wait_for_state(&mut states, ClientState::Running).await;

    let client_id = handle.client_id();
    let idle = || {
        provider
            .ctx
            .registry
            .apps()
            .iter()
            .filter(|app| app.client_id == client_id)
            .map(|app| app.idle_connections)
            .sum::<usize>()
    };
    wait_until(|| idle() == 3).await;

    // using one connection gets it replaced
    let mut consumer = connect_consumer(handle.assigned_apps()[0].port).await;
    consumer.write_all(b"x").await.unwrap();
    let mut byte = [0u8; 1];
    consumer.read_exact(&mut byte).await.unwrap();
    wait_until(|| idle() == 3).await;

    handle.close().await.unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_keeps_identity() {
    let provider = start_provider(true).await;
    let echo_port = start_echo().await;
    let config = client_config(&provider)
        .with_app(AppConfig::tcp(echo_port))
        .with_restart_grace(Duration::from_millis(500));

    let engine = ClientEngine::new(config.clone());
    let handle = engine.handle();
    let mut states = handle.subscribe();
    let run = tokio::spawn(engine.run());
    wait_for_state(&mut states, ClientState::Running).await;
    let client_id = handle.client_id();

    // the provider forgets the client, so its heartbeats go unanswered
    provider.ctx.registry.teardown(client_id);
    wait_for_state(&mut states, ClientState::HeartbeatFailed).await;
    let exit = tokio::time::timeout(TIMEOUT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(exit, EngineExit::RestartRequired);

    let engine = ClientEngine::new(config).with_client_id(client_id);
    let handle = engine.handle();
    let mut states = handle.subscribe();
    let run = tokio::spawn(engine.run());
    wait_for_state(&mut states, ClientState::Running).await;
    assert_eq!(handle.client_id(), client_id);
    assert!(provider.ctx.registry.contains_client(client_id));

    handle.close().await.unwrap();
    assert_eq!(run.await.unwrap().unwrap(), EngineExit::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_token_sets_identity_and_is_cached() {
    let provider = start_provider(false).await;
    let echo_port = start_echo().await;
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("login.json");
    let token = TokenIssuer::new(SECRET.as_bytes()).issue("alice").unwrap();

    let engine = ClientEngine::new(
        client_config(&provider)
            .with_app(AppConfig::tcp(echo_port))
            .with_token(token.clone())
            .with_login_cache_path(cache_path.clone()),
    );
    let handle = engine.handle();
    let mut states = handle.subscribe();
    let run = tokio::spawn(engine.run());
    wait_for_state(&mut states, ClientState::Running).await;
    assert_eq!(handle.client_id(), ClientId(2001));

    let cached = natrelay_client::LoginCache::new(&cache_path).get_token().unwrap();
    assert_eq!(cached, Some(token));

    handle.close().await.unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_first_run_clears_login_cache() {
    let provider = start_provider(false).await;
    let dir = tempfile::tempdir().unwrap();
    let cache = natrelay_client::LoginCache::new(dir.path().join("login.json"));
    cache.set_token("not-a-jwt").unwrap();

    let engine = ClientEngine::new(
        client_config(&provider)
            .with_app(AppConfig::tcp(free_port()))
            .with_login_cache_path(cache.path().to_path_buf()),
    );
    let err = engine.run().await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected));
    assert!(!cache.path().exists());
    assert_eq!(provider.ctx.registry.client_count(), 0);
}
