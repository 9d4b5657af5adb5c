//! Client lifecycle
//!
//! One [`ClientEngine::run`] call is one session: negotiate apps over the
//! control port, park reverse connections for every assigned app, then
//! heartbeat until the provider stops answering or the client is closed.
//!
//! The engine never restarts itself. When the heartbeat fails it waits
//! `restart_grace` and returns [`EngineExit::RestartRequired`] unless a
//! [`ClientHandle::close`] happened in the meantime. The caller builds the
//! next engine with the same [`ClientId`] so the provider re-provisions it
//! in place.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use natrelay_proto::{
    write_frame, AppAssignment, Assignment, ClientId, ClientIdAppId, FrameReader, NewAppRequest,
    Opcode, NO_TOKEN,
};
use natrelay_tunnel::TrafficCounters;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ClientConfig};
use crate::dial::{connect, RetryPolicy};
use crate::error::ClientError;
use crate::heartbeat::{run_heartbeat, HeartbeatEnd};
use crate::login_cache::LoginCache;
use crate::worker::{open_reverse, run_slot, AppLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    ConfigNegotiated,
    AppsConnecting,
    Running,
    HeartbeatFailed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::ConfigNegotiated => "config-negotiated",
            ClientState::AppsConnecting => "apps-connecting",
            ClientState::Running => "running",
            ClientState::HeartbeatFailed => "heartbeat-failed",
        };
        f.write_str(name)
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// The provider went quiet, start a new session with the same id
    RestartRequired,
    /// The session was closed on purpose
    Stopped,
}

struct Shared {
    config: Arc<ClientConfig>,
    token: Arc<str>,
    client_id: Mutex<ClientId>,
    apps: Mutex<Vec<AppAssignment>>,
    /// Bumped by every deliberate stop, compared across the restart grace
    generation: AtomicU64,
    cancel: CancellationToken,
    state: watch::Sender<ClientState>,
    traffic: Arc<TrafficCounters>,
}

impl Shared {
    fn client_id(&self) -> ClientId {
        *self.client_id.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ClientState) {
        debug!(state = %state, "Client state changed");
        self.state.send_replace(state);
    }
}

pub struct ClientEngine {
    shared: Arc<Shared>,
    login_cache: Option<LoginCache>,
}

impl ClientEngine {
    /// Build an engine; the token is taken from the config, then from the
    /// login cache, and falls back to anonymous
    pub fn new(config: ClientConfig) -> Self {
        let login_cache = config.login_cache_path.clone().map(LoginCache::new);
        let token = config
            .token
            .clone()
            .or_else(|| {
                let cache = login_cache.as_ref()?;
                match cache.get_token() {
                    Ok(token) => token,
                    Err(e) => {
                        warn!(error = %e, "Ignoring unreadable login cache");
                        None
                    }
                }
            })
            .unwrap_or_else(|| NO_TOKEN.to_string());

        let (state, _) = watch::channel(ClientState::Disconnected);
        let shared = Shared {
            config: Arc::new(config),
            token: Arc::from(token),
            client_id: Mutex::new(ClientId::UNASSIGNED),
            apps: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            state,
            traffic: Arc::new(TrafficCounters::new()),
        };

        Self {
            shared: Arc::new(shared),
            login_cache,
        }
    }

    /// Resume a previous session's identity
    pub fn with_client_id(self, client_id: ClientId) -> Self {
        *self.shared.client_id.lock().unwrap_or_else(|e| e.into_inner()) = client_id;
        self
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run one session to its end
    pub async fn run(self) -> Result<EngineExit, ClientError> {
        let shared = &self.shared;
        let config = shared.config.clone();
        config.validate()?;
        let generation = shared.generation.load(Ordering::SeqCst);
        if shared.cancel.is_cancelled() {
            return Ok(EngineExit::Stopped);
        }

        let hint = shared.client_id();
        shared.set_state(ClientState::Disconnected);

        let assignment = match self.negotiate(hint).await {
            Ok(assignment) => assignment,
            Err(e) => {
                if hint.is_unassigned() {
                    self.forget_login();
                }
                return Err(e);
            }
        };
        self.remember_login();

        let client_id = assignment.client_id;
        *shared.client_id.lock().unwrap_or_else(|e| e.into_inner()) = client_id;
        *shared.apps.lock().unwrap_or_else(|e| e.into_inner()) = assignment.apps.clone();
        shared.set_state(ClientState::ConfigNegotiated);
        info!(
            client_id = %client_id,
            apps = assignment.apps.len(),
            resumed = !hint.is_unassigned(),
            "Apps negotiated"
        );

        let session = shared.cancel.child_token();
        shared.set_state(ClientState::AppsConnecting);
        let mut slots = self.connect_apps(&assignment, &session).await;

        shared.set_state(ClientState::Running);

        let end = run_heartbeat(&config, client_id, &session).await;
        if let HeartbeatEnd::Failed(e) = &end {
            shared.set_state(ClientState::HeartbeatFailed);
            warn!(client_id = %client_id, error = %e, "Provider unresponsive");
        }

        session.cancel();
        slots.shutdown().await;

        tokio::time::sleep(config.restart_grace).await;
        shared.set_state(ClientState::Disconnected);

        if shared.generation.load(Ordering::SeqCst) == generation {
            info!(client_id = %client_id, "Restart required");
            Ok(EngineExit::RestartRequired)
        } else {
            info!(client_id = %client_id, "Client stopped");
            Ok(EngineExit::Stopped)
        }
    }

    async fn negotiate(&self, hint: ClientId) -> Result<Assignment, ClientError> {
        let config = &self.shared.config;
        let policy = RetryPolicy::new(
            config.connect_retries,
            config.retry_delay,
            config.connect_timeout,
        );
        let mut stream = policy
            .connect(&config.provider_address, config.config_port)
            .await?;

        let opcode = if hint.is_unassigned() {
            Opcode::NewAppRequest
        } else {
            Opcode::Reconnect
        };
        let request = NewAppRequest {
            token: self.shared.token.to_string(),
            client_id: hint,
            apps: config.apps.iter().map(AppConfig::to_request).collect(),
        };
        let body = request.encode()?;
        let mut frame = Vec::with_capacity(1 + body.len());
        frame.push(opcode as u8);
        frame.extend_from_slice(&body);
        write_frame(&mut stream, &frame).await?;

        let assignment =
            Assignment::read_from(&mut FrameReader::new(&mut stream, config.ack_timeout)).await?;
        if assignment.is_rejected() {
            return Err(ClientError::Rejected);
        }
        Ok(assignment)
    }

    /// Park the first reverse connection of every app, then hand each app to
    /// its slots. An app whose first connection fails is skipped.
    async fn connect_apps(
        &self,
        assignment: &Assignment,
        session: &CancellationToken,
    ) -> JoinSet<()> {
        let shared = &self.shared;
        let mut slots = JoinSet::new();

        if assignment.apps.len() != shared.config.apps.len() {
            warn!(
                requested = shared.config.apps.len(),
                assigned = assignment.apps.len(),
                "Provider assigned a different number of apps"
            );
        }

        for (app, assigned) in shared.config.apps.iter().zip(&assignment.apps) {
            let id = ClientIdAppId::new(assignment.client_id, assigned.app_id);
            let first = match open_reverse(&shared.config, &shared.token, id).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        app = %id,
                        port = assigned.port,
                        error = %e,
                        "App connection failed, skipping"
                    );
                    continue;
                }
            };

            info!(
                app = %id,
                port = assigned.port,
                protocol = %app.protocol,
                target = %format!("{}:{}", app.target_ip, app.target_port),
                "App connected"
            );

            let link = Arc::new(AppLink {
                config: shared.config.clone(),
                token: shared.token.clone(),
                app: app.clone(),
                id,
                traffic: shared.traffic.clone(),
            });
            let mut first = Some(first);
            for _ in 0..shared.config.reverse_pool_size {
                slots.spawn(run_slot(link.clone(), first.take(), session.clone()));
            }
        }

        slots
    }

    fn remember_login(&self) {
        let Some(cache) = &self.login_cache else {
            return;
        };
        if &*self.shared.token == NO_TOKEN {
            return;
        }
        if let Err(e) = cache.set_token(&self.shared.token) {
            warn!(path = %cache.path().display(), error = %e, "Failed to save login cache");
        }
    }

    fn forget_login(&self) {
        if let Some(cache) = &self.login_cache {
            if let Err(e) = cache.clear() {
                warn!(path = %cache.path().display(), error = %e, "Failed to clear login cache");
            }
        }
    }
}

/// Observe or stop a running engine from another task
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
}

impl ClientHandle {
    pub fn client_id(&self) -> ClientId {
        self.shared.client_id()
    }

    /// Consumer ports of the last negotiation
    pub fn assigned_apps(&self) -> Vec<AppAssignment> {
        self.shared
            .apps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    pub fn traffic(&self) -> Arc<TrafficCounters> {
        self.shared.traffic.clone()
    }

    /// Stop the engine and ask the provider to release this client
    ///
    /// The local session is always cancelled, the provider notice is best
    /// effort and its failure is returned.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.cancel.cancel();

        let client_id = self.client_id();
        if client_id.is_unassigned() {
            return Err(ClientError::NotNegotiated);
        }

        let config = &self.shared.config;
        let mut stream = connect(
            &config.provider_address,
            config.config_port,
            config.connect_timeout,
        )
        .await?;
        let [hi, lo] = client_id.to_be_bytes();
        write_frame(&mut stream, &[Opcode::CloseClient as u8, hi, lo]).await?;
        info!(client_id = %client_id, "Close sent to provider");
        Ok(())
    }
}
